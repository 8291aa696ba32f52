//! At-rest encryption of persisted blobs.
//!
//! Two ciphers implement [`Encryptor`]: [`noop::NoopEncryptor`] when encryption
//! is disabled, and [`gcm::GcmEncryptor`] keyed by password label. Start-up
//! wiring, canary checks and re-encryption live in [`rotation`].

pub mod gcm;
pub mod noop;
pub mod passwords;
pub mod rotation;

use thiserror::Error;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption error: {0}")]
    Encrypt(String),

    /// Authentication failed: wrong key or tampered data.
    #[error("decryption error: {0}")]
    Decrypt(String),

    #[error("decryption error: no key for password label {0:?}")]
    UnknownLabel(String),

    #[error("decryption error: malformed ciphertext")]
    Malformed,
}

/// Symmetric cipher applied to every opaque blob before it reaches storage.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError>;

    /// Label of the key used by [`Encryptor::encrypt`], `None` for plaintext.
    fn primary_label(&self) -> Option<&str>;
}
