use super::{EncryptionError, Encryptor};

/// Identity cipher used while encryption is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEncryptor;

impl NoopEncryptor {
    pub fn new() -> Self {
        Self
    }
}

impl Encryptor for NoopEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(ciphertext.to_vec())
    }

    fn primary_label(&self) -> Option<&str> {
        None
    }
}
