//! Per-client on-disk output of secrets.

use std::collections::{HashMap, HashSet};
use std::fs::{self, DirBuilder};
use std::io::Read as _;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use vaultsync_output::{write_file_atomically, FileInfo, Filesystem, Lookup, Ownership};

use crate::config::ClientConfig;
use crate::error::{AgentError, AgentResult};
use crate::secret::Secret;

/// Everything remembered about a secret that was written, used to decide
/// whether a refetch is needed. In-memory only; never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretState {
    /// SHA-256 of the bytes actually written.
    pub content_hash: [u8; 32],
    /// The server's checksum at write time.
    pub checksum: String,
    /// Mode/uid/gid observed immediately after the write.
    pub file_info: FileInfo,
    pub owner: String,
    pub group: String,
    pub mode: String,
}

/// What it means to store secrets for one client.
pub trait Output: Send + Sync {
    /// Returns true if the secret is already persisted exactly as
    /// recorded: same server checksum, same requested owner/group/mode,
    /// and the on-disk file still matches byte for byte.
    fn validate(&self, secret: &Secret, state: &SecretState) -> bool;

    /// Writes a secret, returning the state to remember for it.
    fn write(&self, secret: &Secret) -> AgentResult<SecretState>;

    /// Removes one secret file.
    fn remove(&self, name: &str) -> AgentResult<()>;

    /// Removes every secret and the containing directory, for when the
    /// client config is gone.
    fn remove_all(&self) -> AgentResult<()>;

    /// Removes files that are not in the known set (e.g. left over from a
    /// crash), returning how many were removed.
    fn cleanup(&self, known: &HashMap<String, Secret>) -> AgentResult<usize>;
}

/// [`Output`] writing to a directory on tmpfs, the production path.
pub struct OutputDir {
    write_directory: PathBuf,
    default_ownership: Ownership,
    enforce_filesystem: Filesystem,
    chown_files: bool,
    lookup: Arc<dyn Lookup>,
}

impl OutputDir {
    pub fn new(
        write_directory: PathBuf,
        default_ownership: Ownership,
        enforce_filesystem: Filesystem,
        chown_files: bool,
        lookup: Arc<dyn Lookup>,
    ) -> AgentResult<OutputDir> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(&write_directory)
            .map_err(|err| {
                AgentError::Config(format!(
                    "failed to create client directory {}: {err}",
                    write_directory.display()
                ))
            })?;
        Ok(OutputDir {
            write_directory,
            default_ownership,
            enforce_filesystem,
            chown_files,
            lookup,
        })
    }

    pub fn write_directory(&self) -> &Path {
        &self.write_directory
    }
}

impl Output for OutputDir {
    fn validate(&self, secret: &Secret, state: &SecretState) -> bool {
        if state.checksum != secret.checksum {
            return false;
        }

        let filename = match secret.filename() {
            Ok(filename) => filename,
            Err(_) => return false,
        };

        // The requested permission strings must be what we wrote with.
        if state.owner != secret.owner || state.group != secret.group || state.mode != secret.mode {
            return false;
        }

        let path = self.write_directory.join(filename);
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => return false,
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(_) => return false,
        };
        let on_disk = FileInfo {
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
        };
        if on_disk != state.file_info {
            warn!(
                secret = filename,
                expected = ?state.file_info,
                seen = ?on_disk,
                "secret permissions changed unexpectedly"
            );
            return false;
        }

        let mut content = Vec::new();
        if file.read_to_end(&mut content).is_err() {
            return false;
        }
        let hash: [u8; 32] = Sha256::digest(&content).into();
        if hash != state.content_hash {
            // Never log hashes; they leak information about the secret.
            warn!(secret = filename, "secret modified on disk");
            return false;
        }

        true
    }

    fn write(&self, secret: &Secret) -> AgentResult<SecretState> {
        let filename = secret.filename()?;
        let ownership = secret.ownership(self.default_ownership, self.lookup.as_ref());
        let mode = secret.mode_value()?;

        let path = self.write_directory.join(filename);
        let requested = FileInfo {
            mode,
            uid: ownership.uid,
            gid: ownership.gid,
        };
        let file_info = write_file_atomically(
            &path,
            self.chown_files,
            requested,
            self.enforce_filesystem,
            &secret.content.0,
        )?;

        Ok(SecretState {
            content_hash: Sha256::digest(&secret.content.0).into(),
            checksum: secret.checksum.clone(),
            file_info,
            owner: secret.owner.clone(),
            group: secret.group.clone(),
            mode: secret.mode.clone(),
        })
    }

    fn remove(&self, name: &str) -> AgentResult<()> {
        fs::remove_file(self.write_directory.join(name))?;
        Ok(())
    }

    fn remove_all(&self) -> AgentResult<()> {
        fs::remove_dir_all(&self.write_directory)?;
        Ok(())
    }

    fn cleanup(&self, known: &HashMap<String, Secret>) -> AgentResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.write_directory)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if known.contains_key(&name) {
                continue;
            }
            info!(file = %name, "removing unknown file");
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(file = %name, %err, "unable to delete file"),
            }
        }
        Ok(removed)
    }
}

/// Owns the root secrets directory and builds per-client outputs.
pub struct OutputDirCollection {
    secrets_dir: PathBuf,
    default_user: String,
    default_group: String,
    enforce_filesystem: Filesystem,
    chown_files: bool,
    lookup: Arc<dyn Lookup>,
}

impl OutputDirCollection {
    pub fn new(
        secrets_dir: PathBuf,
        default_user: String,
        default_group: String,
        enforce_filesystem: Filesystem,
        chown_files: bool,
        lookup: Arc<dyn Lookup>,
    ) -> OutputDirCollection {
        OutputDirCollection {
            secrets_dir,
            default_user,
            default_group,
            enforce_filesystem,
            chown_files,
            lookup,
        }
    }

    /// Creates the output for one client, creating its directory.
    pub fn new_output(&self, client_config: &ClientConfig) -> AgentResult<OutputDir> {
        let default_ownership = Ownership::resolve(
            &client_config.user,
            &client_config.group,
            &self.default_user,
            &self.default_group,
            self.lookup.as_ref(),
        );
        OutputDir::new(
            self.secrets_dir.join(&client_config.dir_name),
            default_ownership,
            self.enforce_filesystem,
            self.chown_files,
            Arc::clone(&self.lookup),
        )
    }

    /// Sweeps the root secrets directory: stray files are warned about and
    /// kept, directories not belonging to a known client are removed
    /// (e.g. clients deleted while the agent was not running).
    pub fn cleanup(&self, known: &HashSet<String>) -> (usize, Vec<AgentError>) {
        let mut removed = 0;
        let mut errors = Vec::new();

        let entries = match fs::read_dir(&self.secrets_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.secrets_dir.display(), %err, "couldn't read secrets dir");
                errors.push(err.into());
                return (removed, errors);
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    errors.push(err.into());
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                warn!(name = %name, "found unknown file, ignoring");
                continue;
            }
            if known.contains(&name) {
                continue;
            }
            warn!(name = %name, "deleting unknown directory");
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => errors.push(err.into()),
            }
        }

        (removed, errors)
    }
}
