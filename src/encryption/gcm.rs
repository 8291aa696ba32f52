//! AES-256-GCM-SIV cipher keyed by password label.
//!
//! A sealed blob is `len(label) as u8 ‖ label ‖ nonce ‖ ciphertext+tag`. The
//! label selects the key on decrypt, so blobs written under any configured
//! password stay readable while a rotation is pending.

use std::collections::BTreeMap;

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use sha2::Sha256;

use super::{EncryptionError, Encryptor};

/// Byte length of an AES-256 key.
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce.
pub const NONCE_LEN: usize = 12;

/// Byte length of the per-label PBKDF2 salt.
pub const SALT_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count.
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// Derive a 256-bit key from a passphrase and the label's salt.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Fresh random salt for a new password label.
pub fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[derive(Clone)]
pub struct GcmEncryptor {
    primary: String,
    keys: BTreeMap<String, Aes256GcmSiv>,
}

impl GcmEncryptor {
    /// Create a cipher that encrypts under `label`.
    pub fn new(label: &str, key: &[u8; KEY_LEN]) -> Result<Self, EncryptionError> {
        let mut keys = BTreeMap::new();
        keys.insert(label.to_string(), build_cipher(label, key)?);
        Ok(Self {
            primary: label.to_string(),
            keys,
        })
    }

    /// Register an additional decrypt-only key.
    pub fn with_key(mut self, label: &str, key: &[u8; KEY_LEN]) -> Result<Self, EncryptionError> {
        self.keys.insert(label.to_string(), build_cipher(label, key)?);
        Ok(self)
    }

    fn seal(&self, label: &str, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let cipher = self
            .keys
            .get(label)
            .ok_or_else(|| EncryptionError::UnknownLabel(label.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| EncryptionError::Encrypt("aead operation failed".into()))?;

        let mut out = Vec::with_capacity(1 + label.len() + NONCE_LEN + sealed.len());
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

impl std::fmt::Debug for GcmEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcmEncryptor")
            .field("primary", &self.primary)
            .field("labels", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Encryptor for GcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        self.seal(&self.primary, plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let (label, nonce, sealed) = split_ciphertext(ciphertext)?;
        let cipher = self
            .keys
            .get(label)
            .ok_or_else(|| EncryptionError::UnknownLabel(label.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| EncryptionError::Decrypt(format!("authentication failed for label {label:?}")))
    }

    fn primary_label(&self) -> Option<&str> {
        Some(&self.primary)
    }
}

fn build_cipher(label: &str, key: &[u8; KEY_LEN]) -> Result<Aes256GcmSiv, EncryptionError> {
    if label.is_empty() || label.len() > u8::MAX as usize {
        return Err(EncryptionError::Encrypt(format!(
            "password label must be 1 to 255 bytes: {label:?}"
        )));
    }
    Aes256GcmSiv::new_from_slice(key)
        .map_err(|_| EncryptionError::Encrypt(format!("invalid key length: expected {KEY_LEN} bytes")))
}

fn split_ciphertext(data: &[u8]) -> Result<(&str, &[u8], &[u8]), EncryptionError> {
    let (&label_len, rest) = data.split_first().ok_or(EncryptionError::Malformed)?;
    let label_len = label_len as usize;
    if label_len == 0 || rest.len() < label_len + NONCE_LEN {
        return Err(EncryptionError::Malformed);
    }
    let (label, rest) = rest.split_at(label_len);
    let label = std::str::from_utf8(label).map_err(|_| EncryptionError::Malformed)?;
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    Ok((label, nonce, sealed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; KEY_LEN] {
        [byte; KEY_LEN]
    }

    #[test]
    fn round_trip() {
        let enc = GcmEncryptor::new("p1", &key(1)).unwrap();
        let sealed = enc.encrypt(b"hello").unwrap();
        assert_ne!(&sealed[..], b"hello");
        assert_eq!(enc.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn fresh_nonce_per_call() {
        let enc = GcmEncryptor::new("p1", &key(1)).unwrap();
        assert_ne!(enc.encrypt(b"same").unwrap(), enc.encrypt(b"same").unwrap());
    }

    #[test]
    fn label_selects_key() {
        let old = GcmEncryptor::new("p1", &key(1)).unwrap();
        let sealed = old.encrypt(b"secret").unwrap();

        let rotated = GcmEncryptor::new("p2", &key(2))
            .unwrap()
            .with_key("p1", &key(1))
            .unwrap();
        assert_eq!(rotated.decrypt(&sealed).unwrap(), b"secret");
        assert_eq!(rotated.primary_label(), Some("p2"));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let enc = GcmEncryptor::new("p1", &key(1)).unwrap();
        let mut sealed = enc.encrypt(b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(enc.decrypt(&sealed), Err(EncryptionError::Decrypt(_))));
    }

    #[test]
    fn unknown_label_fails() {
        let a = GcmEncryptor::new("a", &key(1)).unwrap();
        let b = GcmEncryptor::new("b", &key(2)).unwrap();
        let sealed = a.encrypt(b"x").unwrap();
        assert!(matches!(b.decrypt(&sealed), Err(EncryptionError::UnknownLabel(_))));
    }

    #[test]
    fn derive_key_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        assert_eq!(derive_key("a long enough passphrase", &salt), derive_key("a long enough passphrase", &salt));
        assert_ne!(derive_key("a long enough passphrase", &salt), derive_key("another passphrase!!", &salt));
    }
}
