use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use proptest::prelude::*;
use tempfile::tempdir;

use vaultsync_backup::{
    create_tar, decrypt, encrypt, extract_tar, generate_keypair, unwrap_key, BackupError,
    FileBackup, BACKUP_KEY_LEN,
};
use vaultsync_output::Filesystem;

fn write_mode(path: &Path, content: &[u8], mode: u32) {
    fs::write(path, content).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

#[test]
fn tar_roundtrip_preserves_content_and_mode() {
    let src = tempdir().unwrap();
    let client = src.path().join("client1");
    fs::create_dir(&client).unwrap();
    write_mode(&client.join("db-password"), b"hunter2", 0o440);
    write_mode(&client.join("api-key"), b"key-material", 0o400);

    let tarball = create_tar(src.path()).unwrap();

    let dst = tempdir().unwrap();
    let target = dst.path().join("restored");
    extract_tar(&tarball, false, &target, Filesystem(0)).unwrap();

    let restored = target.join("client1");
    assert_eq!(fs::read(restored.join("db-password")).unwrap(), b"hunter2");
    assert_eq!(fs::read(restored.join("api-key")).unwrap(), b"key-material");
    let mode = fs::metadata(restored.join("db-password"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o440);
}

#[test]
fn tar_skips_symlinks() {
    let src = tempdir().unwrap();
    write_mode(&src.path().join("real"), b"data", 0o440);
    std::os::unix::fs::symlink("/etc/passwd", src.path().join("link")).unwrap();

    let tarball = create_tar(src.path()).unwrap();

    let dst = tempdir().unwrap();
    let target = dst.path().join("out");
    extract_tar(&tarball, false, &target, Filesystem(0)).unwrap();

    assert!(target.join("real").exists());
    assert!(!target.join("link").exists());
}

#[test]
fn extract_refuses_non_empty_destination() {
    let src = tempdir().unwrap();
    write_mode(&src.path().join("a"), b"1", 0o440);
    let tarball = create_tar(src.path()).unwrap();

    let dst = tempdir().unwrap();
    write_mode(&dst.path().join("existing"), b"do not touch", 0o600);

    let err = extract_tar(&tarball, false, dst.path(), Filesystem(0)).unwrap_err();
    assert!(matches!(err, BackupError::DestinationNotEmpty { .. }));

    // Nothing was modified.
    assert_eq!(fs::read(dst.path().join("existing")).unwrap(), b"do not touch");
    assert!(!dst.path().join("a").exists());
}

fn tarball_with_name(name: &str) -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(4);
    header.set_mode(0o440);
    header.set_uid(0);
    header.set_gid(0);
    let raw = header.as_mut_bytes();
    raw[0..name.len()].copy_from_slice(name.as_bytes());
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b"evil"[..]).unwrap();
    builder.into_inner().unwrap()
}

#[test]
fn extract_rejects_traversal_names() {
    for name in ["../x", "a/../../b", "a/./b", "a//b"] {
        let tarball = tarball_with_name(name);
        let dst = tempdir().unwrap();
        let target = dst.path().join("out");

        let err = extract_tar(&tarball, false, &target, Filesystem(0))
            .expect_err(&format!("{name} should be rejected"));
        assert!(
            matches!(err, BackupError::NonCanonicalPath(_)),
            "unexpected error for {name}: {err}"
        );
    }
}

#[test]
fn extract_allows_nested_canonical_names() {
    let tarball = tarball_with_name("client1/db-password");
    let dst = tempdir().unwrap();
    let target = dst.path().join("out");

    extract_tar(&tarball, false, &target, Filesystem(0)).unwrap();
    assert_eq!(
        fs::read(target.join("client1/db-password")).unwrap(),
        b"evil"
    );
}

#[test]
fn backup_restore_cycle() {
    let (public, secret) = generate_keypair();

    let src = tempdir().unwrap();
    let secrets = src.path().join("secrets");
    let client = secrets.join("client1");
    fs::create_dir_all(&client).unwrap();
    write_mode(&client.join("token"), b"t0ps3cret", 0o440);

    let artifacts = tempdir().unwrap();
    let backup = FileBackup {
        secrets_dir: secrets.clone(),
        backup_path: artifacts.path().join("backup.bin"),
        key_path: artifacts.path().join("backup.key"),
        recipient_pubkey: *public.as_bytes(),
        chown: false,
        enforce_filesystem: Filesystem(0),
    };

    backup.backup().unwrap();

    // Artifacts are written read-only for owner.
    for artifact in [&backup.backup_path, &backup.key_path] {
        let mode = fs::metadata(artifact).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o400, "{}", artifact.display());
    }

    let key = unwrap_key(&backup.load_wrapped_key().unwrap(), &secret.to_bytes()).unwrap();
    assert_eq!(key.len(), BACKUP_KEY_LEN);

    // Restore into a fresh tree.
    let restored_root = src.path().join("restored");
    let restore = FileBackup {
        secrets_dir: restored_root.clone(),
        ..backup
    };
    restore.restore(&key).unwrap();

    assert_eq!(
        fs::read(restored_root.join("client1/token")).unwrap(),
        b"t0ps3cret"
    );
    let mode = fs::metadata(restored_root.join("client1/token"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o440);
}

#[test]
fn restore_into_populated_tree_fails_without_changes() {
    let (public, secret) = generate_keypair();

    let root = tempdir().unwrap();
    let secrets = root.path().join("secrets");
    fs::create_dir_all(&secrets).unwrap();
    write_mode(&secrets.join("live"), b"live", 0o440);

    let backup = FileBackup {
        secrets_dir: secrets.clone(),
        backup_path: root.path().join("backup.bin"),
        key_path: root.path().join("backup.key"),
        recipient_pubkey: *public.as_bytes(),
        chown: false,
        enforce_filesystem: Filesystem(0),
    };
    backup.backup().unwrap();
    let key = unwrap_key(&backup.load_wrapped_key().unwrap(), &secret.to_bytes()).unwrap();

    let err = backup.restore(&key).unwrap_err();
    assert!(matches!(err, BackupError::DestinationNotEmpty { .. }));
    assert_eq!(fs::read(secrets.join("live")).unwrap(), b"live");
}

proptest! {
    #[test]
    fn encrypt_decrypt_always_roundtrips(plaintext in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let (public, secret) = generate_keypair();
        let (wrapped, ciphertext) = encrypt(&plaintext, &public).unwrap();
        let key = unwrap_key(&wrapped, &secret.to_bytes()).unwrap();
        let recovered = decrypt(&ciphertext, &key).unwrap();
        prop_assert_eq!(recovered, plaintext);
    }
}
