//! Wrap-then-encrypt crypto for backups.
//!
//! Each backup is sealed with a fresh 16-byte AES-128-GCM key; that key is
//! wrapped to the recipient's X25519 public key with an ephemeral sender
//! keypair (NaCl box: Curve25519 + XSalsa20-Poly1305). Holding the
//! recipient private key offline is enough to recover a backup without the
//! symmetric key ever being stored.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use crypto_box::aead::Aead as _;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, BackupResult};

/// Length of the symmetric backup key (AES-128).
pub const BACKUP_KEY_LEN: usize = 16;

const GCM_NONCE_LEN: usize = 12;
const BOX_NONCE_LEN: usize = 24;
const BOX_KEY_LEN: usize = 32;
/// 16-byte AES key plus the 16-byte Poly1305 tag.
const WRAPPED_CIPHERTEXT_LEN: usize = 32;

/// The JSON-encoded wrapped key a backup is encrypted with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(rename = "Nonce", with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(rename = "CipherText", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(rename = "SenderPubkey", with = "base64_bytes")]
    pub sender_pubkey: Vec<u8>,
}

/// Generates a recipient keypair for backup wrapping.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let secret = SecretKey::generate(&mut rand::rngs::OsRng);
    let public = secret.public_key();
    (public, secret)
}

/// Wraps `key` to `recipient` with an ephemeral sender keypair, returning
/// the serialized [`WrappedKey`] JSON.
pub fn wrap_key(recipient: &PublicKey, key: &[u8]) -> BackupResult<Vec<u8>> {
    let ephemeral = SecretKey::generate(&mut rand::rngs::OsRng);
    let ephemeral_pk = ephemeral.public_key();

    let mut nonce = [0u8; BOX_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let salsa_box = SalsaBox::new(recipient, &ephemeral);
    let ciphertext = salsa_box
        .encrypt(crypto_box::Nonce::from_slice(&nonce), key)
        .map_err(|e| BackupError::Encryption(format!("key wrap failed: {e}")))?;

    let wrapped = WrappedKey {
        nonce: nonce.to_vec(),
        ciphertext,
        sender_pubkey: ephemeral_pk.as_bytes().to_vec(),
    };
    Ok(serde_json::to_vec(&wrapped)?)
}

/// Unwraps a [`WrappedKey`] produced by [`wrap_key`] using the recipient
/// private key, returning the symmetric backup key.
///
/// All field lengths are validated before the box is opened; the open
/// itself fails with a single opaque error.
pub fn unwrap_key(wrapped: &[u8], private_key: &[u8]) -> BackupResult<Vec<u8>> {
    let parsed: WrappedKey = serde_json::from_slice(wrapped)
        .map_err(|e| BackupError::MalformedKey(e.to_string()))?;

    if parsed.nonce.len() != BOX_NONCE_LEN {
        return Err(BackupError::MalformedKey(format!(
            "incorrect nonce length: {} != {}",
            BOX_NONCE_LEN,
            parsed.nonce.len()
        )));
    }
    if parsed.sender_pubkey.len() != BOX_KEY_LEN {
        return Err(BackupError::MalformedKey(format!(
            "incorrect public key length: {} != {}",
            BOX_KEY_LEN,
            parsed.sender_pubkey.len()
        )));
    }
    if private_key.len() != BOX_KEY_LEN {
        return Err(BackupError::MalformedKey(format!(
            "incorrect private key length: {} != {}",
            BOX_KEY_LEN,
            private_key.len()
        )));
    }
    if parsed.ciphertext.len() != WRAPPED_CIPHERTEXT_LEN {
        return Err(BackupError::MalformedKey(format!(
            "incorrect ciphertext length: {} != {}",
            WRAPPED_CIPHERTEXT_LEN,
            parsed.ciphertext.len()
        )));
    }

    let mut sender = [0u8; BOX_KEY_LEN];
    sender.copy_from_slice(&parsed.sender_pubkey);
    let mut secret = [0u8; BOX_KEY_LEN];
    secret.copy_from_slice(private_key);

    let salsa_box = SalsaBox::new(&PublicKey::from(sender), &SecretKey::from(secret));
    salsa_box
        .decrypt(
            crypto_box::Nonce::from_slice(&parsed.nonce),
            parsed.ciphertext.as_slice(),
        )
        .map_err(|_| BackupError::Decryption)
}

/// Encrypts `data` with a fresh random key, returning the key wrapped to
/// `recipient` and the sealed data (`nonce || ciphertext`).
pub fn encrypt(data: &[u8], recipient: &PublicKey) -> BackupResult<(Vec<u8>, Vec<u8>)> {
    let mut key = [0u8; BACKUP_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);

    let mut nonce = [0u8; GCM_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let wrapped = wrap_key(recipient, &key)?;

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), data)
        .map_err(|e| BackupError::Encryption(format!("backup seal failed: {e}")))?;

    let mut out = Vec::with_capacity(GCM_NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok((wrapped, out))
}

/// Decrypts data produced by [`encrypt`] given the unwrapped key.
pub fn decrypt(data: &[u8], key: &[u8]) -> BackupResult<Vec<u8>> {
    if key.len() != BACKUP_KEY_LEN || data.len() < GCM_NONCE_LEN {
        return Err(BackupError::Decryption);
    }

    let (nonce, ciphertext) = data.split_at(GCM_NONCE_LEN);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| BackupError::Decryption)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let (public, secret) = generate_keypair();
        let key = [0x42u8; BACKUP_KEY_LEN];

        let wrapped = wrap_key(&public, &key).unwrap();
        let unwrapped = unwrap_key(&wrapped, &secret.to_bytes()).unwrap();

        assert_eq!(unwrapped, key);
    }

    #[test]
    fn unwrap_with_wrong_key_is_opaque() {
        let (public, _) = generate_keypair();
        let (_, wrong_secret) = generate_keypair();
        let wrapped = wrap_key(&public, &[0u8; BACKUP_KEY_LEN]).unwrap();

        let err = unwrap_key(&wrapped, &wrong_secret.to_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "decryption failed");
    }

    #[test]
    fn unwrap_validates_field_lengths() {
        let (public, secret) = generate_keypair();
        let wrapped = wrap_key(&public, &[0u8; BACKUP_KEY_LEN]).unwrap();
        let mut parsed: WrappedKey = serde_json::from_slice(&wrapped).unwrap();
        parsed.nonce.truncate(23);
        let mangled = serde_json::to_vec(&parsed).unwrap();

        let err = unwrap_key(&mangled, &secret.to_bytes()).unwrap_err();
        assert!(matches!(err, BackupError::MalformedKey(_)));
    }

    #[test]
    fn wrapped_ciphertext_is_key_plus_tag() {
        let (public, _) = generate_keypair();
        let wrapped = wrap_key(&public, &[7u8; BACKUP_KEY_LEN]).unwrap();
        let parsed: WrappedKey = serde_json::from_slice(&wrapped).unwrap();
        assert_eq!(parsed.ciphertext.len(), 32);
        assert_eq!(parsed.nonce.len(), 24);
        assert_eq!(parsed.sender_pubkey.len(), 32);
    }

    #[test]
    fn wrapped_key_json_field_names() {
        let (public, _) = generate_keypair();
        let wrapped = wrap_key(&public, &[7u8; BACKUP_KEY_LEN]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&wrapped).unwrap();
        assert!(value.get("Nonce").is_some());
        assert!(value.get("CipherText").is_some());
        assert!(value.get("SenderPubkey").is_some());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (public, secret) = generate_keypair();
        let plaintext = b"tarball bytes would go here";

        let (wrapped, ciphertext) = encrypt(plaintext, &public).unwrap();
        let key = unwrap_key(&wrapped, &secret.to_bytes()).unwrap();
        let recovered = decrypt(&ciphertext, &key).unwrap();

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn ciphertext_never_contains_plaintext() {
        let (public, _) = generate_keypair();
        let plaintext = b"super-secret-content-0123456789";

        let (_, ciphertext) = encrypt(plaintext, &public).unwrap();
        assert!(!ciphertext
            .windows(plaintext.len())
            .any(|window| window == plaintext));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (public, secret) = generate_keypair();
        let (wrapped, mut ciphertext) = encrypt(b"payload", &public).unwrap();
        let key = unwrap_key(&wrapped, &secret.to_bytes()).unwrap();

        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(decrypt(&ciphertext, &key).is_err());
    }

    #[test]
    fn short_data_fails_decryption() {
        assert!(decrypt(&[0u8; 4], &[0u8; BACKUP_KEY_LEN]).is_err());
    }
}
