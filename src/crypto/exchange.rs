//! X25519 Key Exchange
//!
//! Provides Elliptic Curve Diffie-Hellman (ECDH) key exchange
//! for establishing shared secrets between parties.
//!
//! The shared secret is used directly as session key material. No key
//! derivation function is applied on top of the raw X25519 output, which
//! keeps session keys interoperable with existing peers but means the key is
//! not uniformly distributed. This is a known weakness of the protocol.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::cipher::SymmetricKey;
use super::encoding;
use super::error::{CryptoError, CryptoResult};

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// A public key for key exchange (X25519)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangePublicKey(pub [u8; 32]);

impl ExchangePublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr = <[u8; 32]>::try_from(bytes).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(ExchangePublicKey(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as 44-character URL-safe base64
    pub fn to_base64(&self) -> String {
        encoding::encode_key(&self.0)
    }

    /// Decode from 44-character URL-safe base64
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        encoding::decode_key(s).map(ExchangePublicKey)
    }
}

impl std::fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExchangePublicKey({}...)", &self.to_base64()[..12])
    }
}

impl serde::Serialize for ExchangePublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for ExchangePublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Shared secret derived from key exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Get the raw bytes (be careful with this!)
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }

    /// Use the raw secret as symmetric key material
    pub fn to_session_key(&self) -> SymmetricKey {
        SymmetricKey::from_bytes(self.secret)
    }
}

/// An ephemeral keypair for key exchange
///
/// One keypair per handshake. The initiator keeps it until the matching
/// response arrives; the responder drops it right after deriving.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EphemeralKeypair {
    #[zeroize(skip)]
    public_key: ExchangePublicKey,
    secret_key: [u8; 32],
}

impl EphemeralKeypair {
    /// Generate a new ephemeral keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret_bytes(secret.to_bytes())
    }

    /// Rebuild a keypair from its persisted secret half
    pub fn from_secret_bytes(secret_key: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_key);
        let public = X25519Public::from(&secret);

        EphemeralKeypair {
            public_key: ExchangePublicKey(public.to_bytes()),
            secret_key,
        }
    }

    /// Get the public key to share with the peer
    pub fn public_key(&self) -> &ExchangePublicKey {
        &self.public_key
    }

    /// Get the secret half for persistence
    ///
    /// # Security Warning
    /// Only the session store should ever see these bytes.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_key
    }

    /// Compute shared secret with a peer's public key
    pub fn diffie_hellman(&self, peer_public: &ExchangePublicKey) -> SharedSecret {
        let secret = StaticSecret::from(self.secret_key);
        let peer = X25519Public::from(peer_public.0);
        let shared = secret.diffie_hellman(&peer);

        SharedSecret {
            secret: shared.to_bytes(),
        }
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
