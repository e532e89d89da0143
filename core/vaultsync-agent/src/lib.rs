//! Secret synchronization engine.
//!
//! Periodically pulls secrets from a mutually-TLS-authenticated secrets
//! server on behalf of configured clients, materializing each secret as a
//! file in a per-client directory on tmpfs with the content, mode, and
//! ownership the server dictates. Exposes a loopback HTTP control surface
//! for on-demand syncs, health, and encrypted backups.
//!
//! The moving parts:
//! - [`secret::Secret`]: the record as the server describes it
//! - [`client::SecretSource`]: where secrets come from (HTTPS or a bundle)
//! - [`output::Output`]: where they go (a per-client directory)
//! - [`syncer::Syncer`]: the reconciliation loop driving one to the other

pub mod api;
pub mod bundle;
pub mod client;
pub mod config;
mod error;
pub mod metrics;
pub mod output;
pub mod secret;
pub mod syncer;

#[cfg(test)]
pub(crate) mod testing;

pub use bundle::BundleClient;
pub use client::{HttpsClient, SecretSource};
pub use config::{BackupConfig, ClientConfig, Config};
pub use error::{AgentError, AgentResult};
pub use metrics::AgentMetrics;
pub use output::{Output, OutputDir, OutputDirCollection, SecretState};
pub use secret::{parse_secret, parse_secret_list, Secret, SecretContent};
pub use syncer::{Syncer, SyncerEntry, Updated};
