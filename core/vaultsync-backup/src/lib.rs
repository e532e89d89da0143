//! Encrypted backup and restore for the vaultsync secret tree.
//!
//! A backup is a two-artifact snapshot:
//! - the secret tree tarred in memory and sealed with a freshly generated
//!   AES-128-GCM key (`nonce || ciphertext` on disk)
//! - that AES key wrapped to a long-lived recipient X25519 public key
//!   (NaCl box: Curve25519 + XSalsa20-Poly1305), serialized as JSON
//!
//! Restore reverses the process offline: unwrap the key with the recipient
//! private key, decrypt, and extract — with archive-traversal defenses and
//! a refusal to write into a non-empty destination.

mod archive;
mod crypto;
mod error;
mod file_backup;

pub use archive::{create_tar, extract_tar};
pub use crypto::{
    decrypt, encrypt, generate_keypair, unwrap_key, wrap_key, WrappedKey, BACKUP_KEY_LEN,
};
pub use error::{BackupError, BackupResult};
pub use file_backup::FileBackup;
