//! Cryptographic primitives
//!
//! This module provides all the cryptographic building blocks:
//! - `identity`: Ed25519 signatures for the long-term client identity
//! - `exchange`: X25519 ECDH for handshakes
//! - `cipher`: ChaCha20-Poly1305 AEAD encryption of message bodies
//! - `encoding`: fixed-length URL-safe base64 for keys and signatures

pub mod cipher;
pub mod encoding;
pub mod error;
pub mod exchange;
pub mod identity;

// Re-export commonly used types
pub use cipher::{Cipher, SymmetricKey};
pub use error::{CryptoError, CryptoResult};
pub use exchange::{EphemeralKeypair, ExchangePublicKey, SharedSecret};
pub use identity::{Identity, PublicKey, SignatureBytes};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_handshake_then_encrypt() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();

        let alice_key = alice.diffie_hellman(bob.public_key()).to_session_key();
        let bob_key = bob.diffie_hellman(alice.public_key()).to_session_key();
        assert_eq!(alice_key, bob_key);

        let message = b"Hello, Bob! This is a secret.";
        let ciphertext = Cipher::encrypt(&alice_key, message).unwrap();

        let decrypted = Cipher::decrypt(&bob_key, &ciphertext).unwrap();
        assert_eq!(message, decrypted.as_slice());
    }

    #[test]
    fn test_signed_exchange_key() {
        let alice = Identity::generate();
        let ephemeral = EphemeralKeypair::generate();

        let signature = alice.sign(ephemeral.public_key().as_bytes());

        let public_key = *alice.public_key();
        assert!(public_key
            .verify(ephemeral.public_key().as_bytes(), &signature)
            .is_ok());
        assert!(public_key.verify(&[0u8; 32], &signature).is_err());
    }

    #[test]
    fn test_random_bytes_differ() {
        assert_ne!(random_bytes::<16>(), random_bytes::<16>());
    }
}
