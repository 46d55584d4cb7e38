//! Optional key encryption.
//!
//! When a tree is created with an [`Encryption`], the stored form of every
//! key is `[ciphertext length: u32 LE][ciphertext]` instead of the raw
//! serialized key. Keys are decrypted before they are compared.

/// Errors raised by an encryption primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    /// Ciphertext could not be decrypted.
    Decrypt(String),
    /// Plaintext could not be encrypted.
    Encrypt(String),
    /// Stored envelope is malformed.
    Envelope(String),
}

impl std::fmt::Display for EncryptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decrypt(msg) => write!(f, "decryption failed: {msg}"),
            Self::Encrypt(msg) => write!(f, "encryption failed: {msg}"),
            Self::Envelope(msg) => write!(f, "invalid encrypted key: {msg}"),
        }
    }
}

impl std::error::Error for EncryptionError {}

/// Symmetric encryption primitive applied to serialized keys.
pub trait Encryption: Send + Sync {
    /// Name recorded in redo records.
    fn name(&self) -> &str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}

/// Encrypt a serialized key into its stored envelope.
pub fn seal_key(encryption: &dyn Encryption, key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let ciphertext = encryption.encrypt(key)?;
    let len = u32::try_from(ciphertext.len())
        .map_err(|_| EncryptionError::Envelope(format!("{} bytes", ciphertext.len())))?;
    let mut out = Vec::with_capacity(4 + ciphertext.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a stored envelope back into the serialized key.
pub fn open_key(encryption: &dyn Encryption, stored: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let (len, ciphertext) = stored
        .split_first_chunk::<4>()
        .ok_or_else(|| EncryptionError::Envelope("missing length prefix".to_string()))?;
    let len = u32::from_le_bytes(*len) as usize;
    if len != ciphertext.len() {
        return Err(EncryptionError::Envelope(format!(
            "length prefix {len} does not match {} ciphertext bytes",
            ciphertext.len()
        )));
    }
    encryption.decrypt(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::XorCipher;

    #[test]
    fn test_envelope() {
        let cipher = XorCipher::new(0x5A);
        let stored = seal_key(&cipher, b"plain key").expect("seal");
        assert_eq!(&stored[..4], &9u32.to_le_bytes());
        assert_ne!(&stored[4..], b"plain key");
        assert_eq!(open_key(&cipher, &stored).expect("open"), b"plain key");
    }

    #[test]
    fn test_malformed_envelope() {
        let cipher = XorCipher::new(1);
        assert!(matches!(
            open_key(&cipher, &[1, 2]),
            Err(EncryptionError::Envelope(_))
        ));
        assert!(matches!(
            open_key(&cipher, &[5, 0, 0, 0, 1]),
            Err(EncryptionError::Envelope(_))
        ));
    }
}
