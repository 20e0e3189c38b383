//! ChaCha20-Poly1305 AEAD Encryption
//!
//! Message bodies are sealed under a session key. The scheme authenticates
//! the ciphertext, so a tampered body fails to open instead of decrypting to
//! garbage.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric session key material
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        SymmetricKey(bytes)
    }

    /// Create from a byte slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr = <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(SymmetricKey(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Symmetric cipher for encryption/decryption
pub struct Cipher;

impl Cipher {
    /// Encrypt data with authentication
    ///
    /// Returns: nonce || ciphertext || tag
    pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data
    ///
    /// Input: nonce || ciphertext || tag
    pub fn decrypt(key: &SymmetricKey, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        // Minimum size: nonce + tag
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);

        cipher
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymmetricKey::from_bytes([42u8; KEY_SIZE]);
        let plaintext = b"Hello through the relay";

        let ciphertext = Cipher::encrypt(&key, plaintext).unwrap();
        let decrypted = Cipher::decrypt(&key, &ciphertext).unwrap();

        assert_eq!(plaintext, decrypted.as_slice());
    }

    #[test]
    fn test_ciphertext_different_each_time() {
        let key = SymmetricKey::from_bytes([42u8; KEY_SIZE]);

        let ct1 = Cipher::encrypt(&key, b"Hello").unwrap();
        let ct2 = Cipher::encrypt(&key, b"Hello").unwrap();

        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SymmetricKey::from_bytes([1u8; KEY_SIZE]);
        let key2 = SymmetricKey::from_bytes([2u8; KEY_SIZE]);

        let ciphertext = Cipher::encrypt(&key1, b"Secret").unwrap();
        assert_eq!(
            Cipher::decrypt(&key2, &ciphertext),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SymmetricKey::from_bytes([42u8; KEY_SIZE]);
        let mut ciphertext = Cipher::encrypt(&key, b"Hello").unwrap();

        if let Some(byte) = ciphertext.get_mut(NONCE_SIZE + 1) {
            *byte ^= 0xFF;
        }

        assert!(Cipher::decrypt(&key, &ciphertext).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = SymmetricKey::from_bytes([42u8; KEY_SIZE]);
        assert!(Cipher::decrypt(&key, &[0u8; NONCE_SIZE + TAG_SIZE - 1]).is_err());
    }

    #[test]
    fn test_key_from_slice_checks_length() {
        assert!(SymmetricKey::from_slice(&[0u8; 31]).is_err());
        assert!(SymmetricKey::from_slice(&[0u8; 32]).is_ok());
    }
}
