//! Relay wire shapes
//!
//! Responses share a `{status, message, data}` wrapper. Fetched element
//! arrays are kept as raw JSON so each element can be decoded on its own; a
//! single malformed entry must not fail the whole batch.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::crypto::{
    encoding, random_bytes, Cipher, CryptoError, CryptoResult, ExchangePublicKey, Identity,
    PublicKey, SignatureBytes, SymmetricKey,
};

use super::element::{is_hex_nonce, parse_timestamp, Element};

/// Size of the request nonce attached to posted messages
pub const REQUEST_NONCE_SIZE: usize = 16;

/// Common accessors for the `{status, message, data}` wrapper
pub trait RelayResponse {
    /// Relay-provided status word
    fn status(&self) -> &str;

    /// Relay-provided human-readable detail
    fn message(&self) -> &str;

    /// Whether the relay accepted the request
    fn is_success(&self) -> bool {
        matches!(self.status().to_ascii_lowercase().as_str(), "success" | "ok")
    }
}

macro_rules! relay_response {
    ($ty:ty) => {
        impl RelayResponse for $ty {
            fn status(&self) -> &str {
                &self.status
            }

            fn message(&self) -> &str {
                &self.message
            }
        }
    };
}

/// Response to a fetch request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Status word
    pub status: String,
    /// Detail text
    #[serde(default)]
    pub message: String,
    /// Fetched elements
    pub data: FetchData,
}

/// Element arrays of a fetch response
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchData {
    /// Exchange-key elements, undecoded
    #[serde(default)]
    pub exchange_keys: Vec<Value>,
    /// Message elements, undecoded
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl FetchResponse {
    /// Build a successful response around element arrays
    pub fn success(exchange_keys: Vec<Value>, messages: Vec<Value>) -> Self {
        FetchResponse {
            status: "success".to_string(),
            message: String::new(),
            data: FetchData {
                exchange_keys,
                messages,
            },
        }
    }

    /// Decode every element, dropping malformed ones
    ///
    /// Signatures are not checked here; see [`Element::verify`].
    pub fn elements(&self) -> Vec<Element> {
        let keys = self
            .data
            .exchange_keys
            .iter()
            .map(Element::decode_exchange_key);
        let messages = self.data.messages.iter().map(Element::decode_message);

        keys.chain(messages)
            .filter_map(|decoded| match decoded {
                Ok(element) => Some(element),
                Err(e) => {
                    debug!(error = %e, "dropping malformed element");
                    None
                }
            })
            .collect()
    }
}

relay_response!(FetchResponse);

/// Response to a posted message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostMessageResponse {
    /// Status word
    pub status: String,
    /// Detail text
    #[serde(default)]
    pub message: String,
    /// Relay receipt
    pub data: PostMessageData,
}

/// Receipt for a posted message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostMessageData {
    /// Hex nonce echoed by the relay
    #[serde(deserialize_with = "deserialize_nonce")]
    pub nonce: String,
    /// When the relay accepted the message
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

relay_response!(PostMessageResponse);

/// Response to a posted exchange key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostKeyResponse {
    /// Status word
    pub status: String,
    /// Detail text
    #[serde(default)]
    pub message: String,
    /// Relay receipt
    pub data: PostKeyData,
}

/// Receipt for a posted exchange key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostKeyData {
    /// When the relay accepted the key
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

relay_response!(PostKeyResponse);

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parse_timestamp(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", value)))
}

fn deserialize_nonce<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let nonce = String::deserialize(deserializer)?;
    if !is_hex_nonce(&nonce) {
        return Err(serde::de::Error::custom(format!("invalid nonce: {:?}", nonce)));
    }
    Ok(nonce)
}

/// Signed exchange-key post (offer or response)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeKeyPost {
    /// Our verification key
    pub sender_key: PublicKey,
    /// The contact's verification key
    pub recipient_key: PublicKey,
    /// Our ephemeral public key
    pub exchange_key: ExchangePublicKey,
    /// The offer this answers, for responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_key: Option<ExchangePublicKey>,
    /// Signature over the raw `exchange_key` bytes
    pub signature: SignatureBytes,
}

impl ExchangeKeyPost {
    /// Sign an exchange key for a recipient
    pub fn new(
        identity: &Identity,
        recipient_key: PublicKey,
        exchange_key: ExchangePublicKey,
        initial_key: Option<ExchangePublicKey>,
    ) -> Self {
        ExchangeKeyPost {
            sender_key: *identity.public_key(),
            recipient_key,
            signature: identity.sign(exchange_key.as_bytes()),
            exchange_key,
            initial_key,
        }
    }

    /// Check the signature against `sender_key`
    pub fn verify(&self) -> bool {
        self.sender_key
            .verify(self.exchange_key.as_bytes(), &self.signature)
            .is_ok()
    }
}

/// Signed, encrypted message post
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePost {
    /// Our verification key
    pub sender_key: PublicKey,
    /// The contact's verification key
    pub recipient_key: PublicKey,
    /// URL-safe base64 of nonce || ciphertext || tag
    pub encrypted_text: String,
    /// Hex request nonce
    pub nonce: String,
    /// Signature over the bytes of `encrypted_text`
    pub signature: SignatureBytes,
}

impl MessagePost {
    /// Encrypt `plaintext` under a session key and sign the result
    pub fn seal(
        identity: &Identity,
        recipient_key: PublicKey,
        key: &SymmetricKey,
        plaintext: &str,
    ) -> CryptoResult<Self> {
        let encrypted_text = seal_text(key, plaintext)?;

        Ok(MessagePost {
            sender_key: *identity.public_key(),
            recipient_key,
            signature: identity.sign(encrypted_text.as_bytes()),
            encrypted_text,
            nonce: hex::encode(random_bytes::<REQUEST_NONCE_SIZE>()),
        })
    }

    /// Check the signature against `sender_key`
    pub fn verify(&self) -> bool {
        self.sender_key
            .verify(self.encrypted_text.as_bytes(), &self.signature)
            .is_ok()
    }
}

/// Signed request for elements addressed to us
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Our verification key
    pub verification_key: PublicKey,
    /// Senders we want elements from
    pub sender_keys: Vec<PublicKey>,
    /// RFC 3339 request time, exactly as signed
    pub timestamp: String,
    /// Signature over the bytes of `timestamp`
    pub signature: SignatureBytes,
}

impl FetchRequest {
    /// Sign a fetch for the given senders
    pub fn new(identity: &Identity, sender_keys: Vec<PublicKey>) -> Self {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        FetchRequest {
            verification_key: *identity.public_key(),
            sender_keys,
            signature: identity.sign(timestamp.as_bytes()),
            timestamp,
        }
    }

    /// Check the signature against `verification_key`
    pub fn verify(&self) -> bool {
        self.verification_key
            .verify(self.timestamp.as_bytes(), &self.signature)
            .is_ok()
    }
}

/// Encrypt text into the `encrypted_text` wire form
pub fn seal_text(key: &SymmetricKey, plaintext: &str) -> CryptoResult<String> {
    Cipher::encrypt(key, plaintext.as_bytes()).map(|sealed| encoding::encode_bytes(&sealed))
}

/// Decrypt the `encrypted_text` wire form
pub fn open_text(key: &SymmetricKey, encrypted_text: &str) -> CryptoResult<String> {
    let sealed = encoding::decode_bytes(encrypted_text)?;
    let plaintext = Cipher::decrypt(key, &sealed)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}
