//! Filesystem primitives for vaultsync.
//!
//! Provides the two low-level building blocks every secret write goes
//! through:
//! - [`write_file_atomically`]: temp-file + rename writes where no reader
//!   can ever observe partial content or wrong permissions
//! - [`Ownership`] resolution from user/group names with safe fallbacks
//!
//! Everything here is deliberately free of any notion of what a "secret"
//! is; higher layers decide names, modes, and owners and this crate makes
//! them true on disk.

mod error;
pub mod ownership;
pub mod writer;

pub use error::{OutputError, OutputResult};
pub use ownership::{Lookup, MockLookup, OsLookup, Ownership};
pub use writer::{write_file_atomically, FileInfo, Filesystem};
