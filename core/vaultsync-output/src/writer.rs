//! Atomic file writes.
//!
//! A secret file must never be observable in a half-written state: not
//! with partial content, not with mode 0000, not with the wrong owner.
//! [`write_file_atomically`] achieves this by staging into a randomly
//! suffixed temp file opened exclusively at mode 0000, fixing ownership
//! and permissions while nothing can open it, then renaming over the
//! destination. Rename is the linearization point.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{OutputError, OutputResult};

/// Filesystem properties observed immediately after a write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Permission bits (the type bits are not kept).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// A statfs filesystem magic, e.g. 0x01021994 for Linux tmpfs.
///
/// The zero value means "don't enforce". Get the magic for a mounted
/// filesystem with `stat --file-system --format=%t`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filesystem(pub i64);

impl Filesystem {
    pub fn is_enforced(self) -> bool {
        self.0 != 0
    }
}

/// Removes the temp path when dropped. After a successful rename the path
/// no longer exists and the unlink is a harmless no-op.
struct TempGuard(PathBuf);

impl Drop for TempGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// Writes `content` to `path` with the requested mode and (optionally)
/// ownership, such that concurrent readers see either the prior version
/// or the new one, never anything in between.
///
/// Sequence: open a random-suffixed temp file exclusively at mode 0000,
/// chown (if `chown` is set) *before* chmod so the file is never readable
/// under the wrong owner, verify the filesystem magic if one is enforced,
/// write, fsync best-effort, rename into place. Any early return unlinks
/// the temp file.
///
/// Returns the mode/uid/gid actually observed on the file.
pub fn write_file_atomically(
    path: &Path,
    chown: bool,
    file_info: FileInfo,
    filesystem: Filesystem,
    content: &[u8],
) -> OutputResult<FileInfo> {
    let dir = path
        .parent()
        .ok_or_else(|| OutputError::Io(std::io::Error::other("path has no parent directory")))?;
    DirBuilder::new().recursive(true).mode(0o775).create(dir)?;

    let mut suffix = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(hex::encode(suffix));
    let temp_path = PathBuf::from(temp_name);

    let _guard = TempGuard(temp_path.clone());

    // Exclusive create at 0000: nothing can open the file until ownership
    // and permissions are in their final state.
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o000)
        .open(&temp_path)?;

    if chown {
        std::os::unix::fs::fchown(&file, Some(file_info.uid), Some(file_info.gid)).map_err(
            |source| OutputError::Permission {
                path: path.display().to_string(),
                source,
            },
        )?;
    }

    // Chmod strictly after chown so the file is never readable with the
    // wrong owner.
    file.set_permissions(fs::Permissions::from_mode(file_info.mode))?;

    if filesystem.is_enforced() {
        let statfs = nix::sys::statfs::fstatfs(&file).map_err(std::io::Error::from)?;
        if statfs.filesystem_type().0 as i64 != filesystem.0 {
            return Err(OutputError::FilesystemMismatch(path.display().to_string()));
        }
    }

    file.write_all(content)?;

    let metadata = file.metadata()?;
    let written = FileInfo {
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
    };

    // The intended target is tmpfs, where a failed sync is not actionable.
    let _ = file.sync_all();

    fs::rename(&temp_path, path)?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_zero_is_not_enforced() {
        assert!(!Filesystem(0).is_enforced());
        assert!(Filesystem(0x0102_1994).is_enforced());
    }
}
