use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use tempfile::tempdir;
use vaultsync_output::{write_file_atomically, FileInfo, Filesystem, OutputError};

fn info(mode: u32) -> FileInfo {
    FileInfo { mode, uid: 0, gid: 0 }
}

#[test]
fn writes_content_and_mode() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret");

    let written = write_file_atomically(&path, false, info(0o440), Filesystem(0), b"hello").unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"hello");
    let meta = fs::metadata(&path).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o440);
    assert_eq!(written.mode, 0o440);
    assert_eq!(written.uid, meta.uid());
    assert_eq!(written.gid, meta.gid());
}

#[test]
fn creates_missing_directories() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a").join("b").join("secret");

    write_file_atomically(&path, false, info(0o400), Filesystem(0), b"x").unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"x");
}

#[test]
fn replaces_existing_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret");

    write_file_atomically(&path, false, info(0o440), Filesystem(0), b"one").unwrap();
    write_file_atomically(&path, false, info(0o444), Filesystem(0), b"two").unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"two");
    let meta = fs::metadata(&path).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o444);
}

#[test]
fn leaves_no_temp_files_behind() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret");

    write_file_atomically(&path, false, info(0o440), Filesystem(0), b"payload").unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["secret".to_string()]);
}

#[test]
fn filesystem_mismatch_fails_and_cleans_up() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret");

    // No real mount has this magic.
    let err = write_file_atomically(&path, false, info(0o440), Filesystem(-1), b"payload")
        .expect_err("write should fail on filesystem mismatch");
    assert!(matches!(err, OutputError::FilesystemMismatch(_)));

    // Neither the target nor a temp file survives.
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn failed_write_keeps_prior_version() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret");

    write_file_atomically(&path, false, info(0o440), Filesystem(0), b"original").unwrap();
    write_file_atomically(&path, false, info(0o440), Filesystem(-1), b"clobber").unwrap_err();

    assert_eq!(fs::read(&path).unwrap(), b"original");
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}
