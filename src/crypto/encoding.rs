//! URL-safe base64 text codec for keys and signatures
//!
//! Every binary field on the wire uses the URL-safe alphabet with canonical
//! padding, so lengths are fixed: a 32-byte key is always 44 characters and a
//! 64-byte signature is always 88 characters. Anything else is rejected
//! rather than coerced.

use base64::{engine::general_purpose::URL_SAFE, Engine};

use super::error::{CryptoError, CryptoResult};

/// Raw length of a public key (Ed25519 or X25519)
pub const KEY_LEN: usize = 32;

/// Encoded length of a public key
pub const ENCODED_KEY_LEN: usize = 44;

/// Raw length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Encoded length of an Ed25519 signature
pub const ENCODED_SIGNATURE_LEN: usize = 88;

/// Encode a 32-byte key
pub fn encode_key(bytes: &[u8; KEY_LEN]) -> String {
    URL_SAFE.encode(bytes)
}

/// Decode a 44-character key
pub fn decode_key(text: &str) -> CryptoResult<[u8; KEY_LEN]> {
    decode_fixed::<KEY_LEN>(text, ENCODED_KEY_LEN)
}

/// Encode a 64-byte signature
pub fn encode_signature(bytes: &[u8; SIGNATURE_LEN]) -> String {
    URL_SAFE.encode(bytes)
}

/// Decode an 88-character signature
pub fn decode_signature(text: &str) -> CryptoResult<[u8; SIGNATURE_LEN]> {
    decode_fixed::<SIGNATURE_LEN>(text, ENCODED_SIGNATURE_LEN)
}

/// Encode arbitrary bytes (ciphertext) with the same alphabet
pub fn encode_bytes(bytes: &[u8]) -> String {
    URL_SAFE.encode(bytes)
}

/// Decode arbitrary bytes encoded with [`encode_bytes`]
pub fn decode_bytes(text: &str) -> CryptoResult<Vec<u8>> {
    URL_SAFE
        .decode(text)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

fn decode_fixed<const N: usize>(text: &str, encoded_len: usize) -> CryptoResult<[u8; N]> {
    if text.len() != encoded_len {
        return Err(CryptoError::InvalidEncoding(format!(
            "expected {} characters, got {}",
            encoded_len,
            text.len()
        )));
    }

    let bytes = URL_SAFE
        .decode(text)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;

    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKeyLength {
        expected: N,
        actual: bytes.len(),
    })
}
