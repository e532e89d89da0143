//! In-memory tar archives of a secret tree.
//!
//! These are not general-purpose archive functions: a secret tree contains
//! only non-executable regular files, so [`create_tar`] skips everything
//! else and [`extract_tar`] rejects everything else.

use std::fs::{self, DirBuilder, File};
use std::io::{Cursor, Read as _};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;

use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use vaultsync_output::{write_file_atomically, FileInfo, Filesystem};

use crate::error::{BackupError, BackupResult};

/// Tars the regular files under `dir` into an in-memory archive.
///
/// Entry names are relative to `dir`; mode, uid, and gid are preserved.
/// Directories, symlinks, and any other non-regular entries are skipped.
pub fn create_tar(dir: &Path) -> BackupResult<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| std::io::Error::other("walked entry outside the archive root"))?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(metadata.mode() & 0o7777);
        header.set_uid(metadata.uid() as u64);
        header.set_gid(metadata.gid() as u64);
        header.set_mtime(metadata.mtime() as u64);

        let file = File::open(entry.path())?;
        builder.append_data(&mut header, relative, file)?;
    }

    Ok(builder.into_inner()?)
}

/// Extracts an archive produced by [`create_tar`] into `dir`.
///
/// The destination is created (mode 0755) if absent and must otherwise be
/// an empty directory; restoring must never overwrite live secrets. Every
/// file is written through the atomic writer with the header's mode and
/// (when `chown` is set) uid/gid, and against the enforced filesystem.
pub fn extract_tar(
    tarball: &[u8],
    chown: bool,
    dir: &Path,
    filesystem: Filesystem,
) -> BackupResult<()> {
    match fs::metadata(dir) {
        Ok(metadata) if !metadata.is_dir() => {
            return Err(BackupError::Io(std::io::Error::other(format!(
                "{} exists and is not a directory",
                dir.display()
            ))));
        }
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            DirBuilder::new().recursive(true).mode(0o755).create(dir)?;
        }
        Err(err) => return Err(err.into()),
    }

    check_if_empty(dir)?;

    let mut archive = Archive::new(Cursor::new(tarball));
    for entry in archive.entries()? {
        let mut entry = entry?;

        match entry.header().entry_type() {
            // Directories materialize implicitly when files are written.
            EntryType::Directory => continue,
            EntryType::Regular => {}
            other => {
                return Err(BackupError::UnsupportedEntry {
                    name: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
                    type_byte: other.as_byte(),
                });
            }
        }

        let name = match std::str::from_utf8(&entry.path_bytes()) {
            Ok(name) => name.to_string(),
            Err(_) => {
                return Err(BackupError::NonCanonicalPath(
                    String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
                ))
            }
        };

        let mode = entry.header().mode()?;
        let uid = entry.header().uid()? as u32;
        let gid = entry.header().gid()? as u32;

        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;

        // Prepend '/' with plain string concatenation, then require the
        // result to already be in lexically-clean form. Joining through a
        // path API would clean away a leading `..` and erase the evidence;
        // this form keeps it, so `../x`, `a/../../b`, and absolute names
        // are all rejected as given.
        let probe = format!("/{name}");
        if probe != lexically_clean(&probe) {
            return Err(BackupError::NonCanonicalPath(name));
        }

        let target = dir.join(&name);
        let perms = FileInfo { mode, uid, gid };
        write_file_atomically(&target, chown, perms, filesystem, &content)?;
    }

    Ok(())
}

/// Fails if any file exists under `dir`, listing what was found.
fn check_if_empty(dir: &Path) -> BackupResult<()> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_dir() {
            files.push(entry.path().display().to_string());
        }
    }
    if !files.is_empty() {
        return Err(BackupError::DestinationNotEmpty {
            dir: dir.display().to_string(),
            files,
        });
    }
    Ok(())
}

/// Lexical path cleaning: collapses repeated separators, removes `.`
/// elements, and resolves `..` against preceding elements (dropping `..`
/// at the root of an absolute path).
fn lexically_clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match stack.last() {
                Some(&"..") => stack.push(".."),
                Some(_) => {
                    stack.pop();
                }
                None => {
                    if !rooted {
                        stack.push("..");
                    }
                }
            },
            other => stack.push(other),
        }
    }

    let joined = stack.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_is_identity_on_canonical_paths() {
        for path in ["/a", "/a/b", "/a/b.c", "/secrets/client1/db-password"] {
            assert_eq!(lexically_clean(path), path);
        }
    }

    #[test]
    fn clean_normalizes_traversals() {
        assert_eq!(lexically_clean("/../x"), "/x");
        assert_eq!(lexically_clean("/a/../../b"), "/b");
        assert_eq!(lexically_clean("/a//b"), "/a/b");
        assert_eq!(lexically_clean("/a/./b"), "/a/b");
        assert_eq!(lexically_clean("/a/"), "/a");
        assert_eq!(lexically_clean("/.."), "/");
        assert_eq!(lexically_clean("//etc/passwd"), "/etc/passwd");
    }
}
