//! Ed25519 Identity management
//!
//! Provides the long-term signing identity of a client. The public half is
//! the client's address on the relay; every outbound element is signed with
//! the secret half.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::encoding;
use super::error::{CryptoError, CryptoResult};

/// Size of a public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a secret key in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// A public verification key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr = <[u8; PUBLIC_KEY_SIZE]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            }
        })?;
        Ok(PublicKey(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Encode as 44-character URL-safe base64
    pub fn to_base64(&self) -> String {
        encoding::encode_key(&self.0)
    }

    /// Decode from 44-character URL-safe base64
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        encoding::decode_key(s).map(PublicKey)
    }

    /// Verify a signature against this public key
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..12])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// A signature produced by an identity
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl SignatureBytes {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr = <[u8; SIGNATURE_SIZE]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidSignatureLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            }
        })?;
        Ok(SignatureBytes(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Encode as 88-character URL-safe base64
    pub fn to_base64(&self) -> String {
        encoding::encode_signature(&self.0)
    }

    /// Decode from 88-character URL-safe base64
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        encoding::decode_signature(s).map(SignatureBytes)
    }
}

// Arrays >32 don't auto-derive
impl serde::Serialize for SignatureBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for SignatureBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(self.0)[..16])
    }
}

/// A long-term signing identity
///
/// The secret key is automatically zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    public_key: PublicKey,
    secret_key: [u8; SECRET_KEY_SIZE],
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(&signing_key)
    }

    /// Create from a seed (deterministic generation)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(&SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        Identity {
            public_key: PublicKey(signing_key.verifying_key().to_bytes()),
            secret_key: signing_key.to_bytes(),
        }
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        SignatureBytes(signing_key.sign(message).to_bytes())
    }

    /// Export identity to bytes (secret || public)
    ///
    /// WARNING: This exposes the secret key. Handle with extreme care.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE + PUBLIC_KEY_SIZE] {
        let mut bytes = [0u8; SECRET_KEY_SIZE + PUBLIC_KEY_SIZE];
        bytes[..SECRET_KEY_SIZE].copy_from_slice(&self.secret_key);
        bytes[SECRET_KEY_SIZE..].copy_from_slice(&self.public_key.0);
        bytes
    }

    /// Import identity from bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SECRET_KEY_SIZE + PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SECRET_KEY_SIZE + PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut secret_key = [0u8; SECRET_KEY_SIZE];
        secret_key.copy_from_slice(&bytes[..SECRET_KEY_SIZE]);

        // The stored public half must match the secret half
        let signing_key = SigningKey::from_bytes(&secret_key);
        if signing_key.verifying_key().to_bytes()[..] != bytes[SECRET_KEY_SIZE..] {
            secret_key.zeroize();
            return Err(CryptoError::InvalidSecretKey);
        }

        Ok(Self::from_signing_key(&signing_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id1 = Identity::generate();
        let id2 = Identity::generate();

        assert_ne!(id1.public_key().0, id2.public_key().0);
    }

    #[test]
    fn test_deterministic_generation() {
        let seed = [42u8; 32];
        let id1 = Identity::from_seed(&seed);
        let id2 = Identity::from_seed(&seed);

        assert_eq!(id1.public_key().0, id2.public_key().0);
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"exchange key bytes";

        let signature = id.sign(message);
        assert!(id.public_key().verify(message, &signature).is_ok());
        assert!(id.public_key().verify(b"other bytes", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let id1 = Identity::generate();
        let id2 = Identity::generate();
        let message = b"hello";

        let signature = id1.sign(message);
        assert!(id2.public_key().verify(message, &signature).is_err());
    }

    #[test]
    fn test_export_import() {
        let id = Identity::generate();
        let signature = id.sign(b"Test message");

        let restored = Identity::from_bytes(&id.to_bytes()).unwrap();

        assert_eq!(id.public_key(), restored.public_key());
        assert!(restored.public_key().verify(b"Test message", &signature).is_ok());
    }

    #[test]
    fn test_import_rejects_mismatched_public_half() {
        let mut bytes = Identity::generate().to_bytes();
        bytes[SECRET_KEY_SIZE] ^= 0x01;

        assert_eq!(
            Identity::from_bytes(&bytes).err(),
            Some(CryptoError::InvalidSecretKey)
        );
    }

    #[test]
    fn test_public_key_base64() {
        let id = Identity::generate();
        let encoded = id.public_key().to_base64();
        assert_eq!(encoded.len(), 44);

        let restored = PublicKey::from_base64(&encoded).unwrap();
        assert_eq!(id.public_key(), &restored);
    }

    #[test]
    fn test_public_key_serde_as_string() {
        let key = *Identity::from_seed(&[3u8; 32]).public_key();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_base64()));

        let parsed: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }
}
