//! Fetched protocol elements
//!
//! The relay hands back two arrays of loosely-shaped JSON objects. Each object
//! is decoded into one [`Element`] variant, and every variant knows which of
//! its bytes the sender signed.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::crypto::{ExchangePublicKey, PublicKey, SignatureBytes};

use super::{ElementError, ElementResult};

/// Accepted names for the sender's verification key, in resolution order
pub const SENDER_KEY_ALIASES: &[&str] = &[
    "sender_key",
    "sender_public_key",
    "sender_verification_key",
];

/// Accepted names for the ephemeral exchange key, in resolution order
pub const EXCHANGE_KEY_ALIASES: &[&str] = &[
    "sent_key",
    "received_exchange_key",
    "sent_exchange_key",
    "key",
    "exchange_key",
    "transmitted_key",
    "transmitted_exchange_key",
];

/// Accepted names for the offer a response completes, in resolution order
pub const INITIAL_KEY_ALIASES: &[&str] = &["initial_key", "initial_exchange_key", "response_to"];

const SIGNATURE_ALIASES: &[&str] = &["signature"];
const TIMESTAMP_ALIASES: &[&str] = &["timestamp"];
const NONCE_ALIASES: &[&str] = &["nonce"];
const ENCRYPTED_TEXT_ALIASES: &[&str] = &["encrypted_text"];

/// A fresh exchange key awaiting a response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeKeyOffer {
    /// Verification key of the sender
    pub sender_key: PublicKey,
    /// Signature over `exchange_key`
    pub signature: SignatureBytes,
    /// When the relay accepted the element
    pub timestamp: DateTime<Utc>,
    /// The offered ephemeral public key
    pub exchange_key: ExchangePublicKey,
}

/// An exchange key that completes an earlier offer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeKeyResponse {
    /// Verification key of the sender
    pub sender_key: PublicKey,
    /// Signature over `exchange_key`
    pub signature: SignatureBytes,
    /// When the relay accepted the element
    pub timestamp: DateTime<Utc>,
    /// The responder's ephemeral public key
    pub exchange_key: ExchangePublicKey,
    /// Public key of the offer being answered
    pub initial_key: ExchangePublicKey,
}

/// An encrypted text message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageElement {
    /// Verification key of the sender
    pub sender_key: PublicKey,
    /// Signature over the bytes of `encrypted_text`
    pub signature: SignatureBytes,
    /// When the relay accepted the element
    pub timestamp: DateTime<Utc>,
    /// Even-length hex nonce
    pub nonce: String,
    /// Opaque ciphertext text
    pub encrypted_text: String,
}

/// A decoded element from a fetch response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Element {
    /// Exchange key with no `initial_key`
    ExchangeKeyOffer(ExchangeKeyOffer),
    /// Exchange key referencing an earlier offer
    ExchangeKeyResponse(ExchangeKeyResponse),
    /// Encrypted message
    Message(MessageElement),
}

impl Element {
    /// Decode an entry of the fetch response's `exchange_keys` array
    pub fn decode_exchange_key(value: &Value) -> ElementResult<Self> {
        let obj = value.as_object().ok_or(ElementError::NotAnObject)?;

        let sender_key = sender_key(obj)?;
        let signature = signature(obj)?;
        let timestamp = timestamp(obj)?;
        let exchange_key = exchange_key_field(obj, "exchange_key", EXCHANGE_KEY_ALIASES)?;

        let element = match lookup(obj, INITIAL_KEY_ALIASES) {
            None => Element::ExchangeKeyOffer(ExchangeKeyOffer {
                sender_key,
                signature,
                timestamp,
                exchange_key,
            }),
            Some(_) => Element::ExchangeKeyResponse(ExchangeKeyResponse {
                sender_key,
                signature,
                timestamp,
                exchange_key,
                initial_key: exchange_key_field(obj, "initial_key", INITIAL_KEY_ALIASES)?,
            }),
        };
        Ok(element)
    }

    /// Decode an entry of the fetch response's `messages` array
    pub fn decode_message(value: &Value) -> ElementResult<Self> {
        let obj = value.as_object().ok_or(ElementError::NotAnObject)?;

        let nonce = required_str(obj, "nonce", NONCE_ALIASES)?;
        if !is_hex_nonce(nonce) {
            return Err(ElementError::InvalidField {
                field: "nonce",
                reason: "must be a non-empty, even-length hex string".to_string(),
            });
        }

        Ok(Element::Message(MessageElement {
            sender_key: sender_key(obj)?,
            signature: signature(obj)?,
            timestamp: timestamp(obj)?,
            nonce: nonce.to_string(),
            encrypted_text: required_str(obj, "encrypted_text", ENCRYPTED_TEXT_ALIASES)?
                .to_string(),
        }))
    }

    /// Verification key the element claims to come from
    pub fn sender_key(&self) -> &PublicKey {
        match self {
            Element::ExchangeKeyOffer(e) => &e.sender_key,
            Element::ExchangeKeyResponse(e) => &e.sender_key,
            Element::Message(e) => &e.sender_key,
        }
    }

    /// Signature carried by the element
    pub fn signature(&self) -> &SignatureBytes {
        match self {
            Element::ExchangeKeyOffer(e) => &e.signature,
            Element::ExchangeKeyResponse(e) => &e.signature,
            Element::Message(e) => &e.signature,
        }
    }

    /// Relay timestamp of the element
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Element::ExchangeKeyOffer(e) => e.timestamp,
            Element::ExchangeKeyResponse(e) => e.timestamp,
            Element::Message(e) => e.timestamp,
        }
    }

    /// The canonical bytes the sender signed
    ///
    /// Exchange keys sign their own raw 32-byte public key; messages sign the
    /// bytes of their ciphertext text.
    pub fn signed_payload(&self) -> &[u8] {
        match self {
            Element::ExchangeKeyOffer(e) => e.exchange_key.as_bytes(),
            Element::ExchangeKeyResponse(e) => e.exchange_key.as_bytes(),
            Element::Message(e) => e.encrypted_text.as_bytes(),
        }
    }

    /// Check the signature against the claimed sender
    ///
    /// Pure: returns `false` on any failure, never errors.
    pub fn verify(&self) -> bool {
        self.sender_key()
            .verify(self.signed_payload(), self.signature())
            .is_ok()
    }
}

/// First alias present with a non-null value
fn lookup<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|value| !value.is_null())
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
    aliases: &[&str],
) -> ElementResult<&'a str> {
    lookup(obj, aliases)
        .ok_or(ElementError::MissingField(field))?
        .as_str()
        .ok_or_else(|| ElementError::InvalidField {
            field,
            reason: "expected a string".to_string(),
        })
}

fn sender_key(obj: &Map<String, Value>) -> ElementResult<PublicKey> {
    let text = required_str(obj, "sender_key", SENDER_KEY_ALIASES)?;
    PublicKey::from_base64(text).map_err(|e| ElementError::InvalidField {
        field: "sender_key",
        reason: e.to_string(),
    })
}

fn signature(obj: &Map<String, Value>) -> ElementResult<SignatureBytes> {
    let text = required_str(obj, "signature", SIGNATURE_ALIASES)?;
    SignatureBytes::from_base64(text).map_err(|e| ElementError::InvalidField {
        field: "signature",
        reason: e.to_string(),
    })
}

fn exchange_key_field(
    obj: &Map<String, Value>,
    field: &'static str,
    aliases: &[&str],
) -> ElementResult<ExchangePublicKey> {
    let text = required_str(obj, field, aliases)?;
    ExchangePublicKey::from_base64(text).map_err(|e| ElementError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn timestamp(obj: &Map<String, Value>) -> ElementResult<DateTime<Utc>> {
    let value = lookup(obj, TIMESTAMP_ALIASES).ok_or(ElementError::MissingField("timestamp"))?;
    parse_timestamp(value).ok_or_else(|| ElementError::InvalidField {
        field: "timestamp",
        reason: format!("not a point in time: {}", value),
    })
}

/// Parse a relay timestamp
///
/// Accepts RFC 3339 strings, naive ISO 8601 strings (taken as UTC), and unix
/// seconds. No freshness window is applied.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos).single()
        }
        _ => None,
    }
}

/// `^(?:[0-9a-fA-F]{2})+$`
pub fn is_hex_nonce(nonce: &str) -> bool {
    !nonce.is_empty() && nonce.len() % 2 == 0 && nonce.bytes().all(|b| b.is_ascii_hexdigit())
}
