//! Backup orchestration over the secret tree on disk.

use std::fs;
use std::path::PathBuf;

use crypto_box::PublicKey;
use tracing::info;

use vaultsync_output::{write_file_atomically, FileInfo, Filesystem};

use crate::archive::{create_tar, extract_tar};
use crate::crypto::{decrypt, encrypt};
use crate::error::BackupResult;

/// Encrypted file-based backup of a secrets directory.
pub struct FileBackup {
    /// The tree to snapshot and restore.
    pub secrets_dir: PathBuf,
    /// Where the sealed tarball is written.
    pub backup_path: PathBuf,
    /// Where the wrapped-key JSON is written.
    pub key_path: PathBuf,
    /// Recipient X25519 public key the backup key is wrapped to.
    pub recipient_pubkey: [u8; 32],
    /// Whether restore re-applies uid/gid from the archive.
    pub chown: bool,
    /// Filesystem magic enforced on restore writes (0 = off).
    pub enforce_filesystem: Filesystem,
}

impl FileBackup {
    /// Snapshots the secret tree: tar in memory, seal with a fresh key,
    /// wrap the key to the recipient, and write both artifacts atomically
    /// at mode 0400.
    pub fn backup(&self) -> BackupResult<()> {
        let tarball = create_tar(&self.secrets_dir)?;
        let recipient = PublicKey::from(self.recipient_pubkey);
        let (wrapped, ciphertext) = encrypt(&tarball, &recipient)?;

        // uid/gid are ignored since these writes never chown.
        let perms = FileInfo { mode: 0o400, uid: 0, gid: 0 };
        write_file_atomically(&self.backup_path, false, perms, Filesystem(0), &ciphertext)?;
        write_file_atomically(&self.key_path, false, perms, Filesystem(0), &wrapped)?;

        info!(
            backup = %self.backup_path.display(),
            bytes = ciphertext.len(),
            "backup written"
        );
        Ok(())
    }

    /// Restores the secret tree from the backup artifact, given the
    /// unwrapped symmetric key. The destination must be empty.
    pub fn restore(&self, key: &[u8]) -> BackupResult<()> {
        let ciphertext = fs::read(&self.backup_path)?;
        let tarball = decrypt(&ciphertext, key)?;
        extract_tar(&tarball, self.chown, &self.secrets_dir, self.enforce_filesystem)?;

        info!(dir = %self.secrets_dir.display(), "backup restored");
        Ok(())
    }

    /// Reads the wrapped-key artifact for out-of-band unwrapping.
    pub fn load_wrapped_key(&self) -> BackupResult<Vec<u8>> {
        Ok(fs::read(&self.key_path)?)
    }
}
