//! Records shared between the engine and the session store

use chrono::{DateTime, Utc};

use crate::crypto::{EphemeralKeypair, ExchangePublicKey, PublicKey, SignatureBytes, SymmetricKey};

/// Row id of a contact
pub type ContactId = i64;

/// Row id of an exchange-key record
pub type RecordId = i64;

/// A person we exchange messages with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    /// Row id
    pub id: ContactId,
    /// Display name
    pub name: String,
    /// Their long-term Ed25519 key, pasted in by the user
    pub verification_key: PublicKey,
}

/// An inbound ephemeral key
///
/// `initial_key == None` is an offer awaiting our response. `Some(k)` is a
/// response completing our offer `k`. `matched` flips to `true` exactly once,
/// when a session key has been derived from the record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeKeyRecord {
    /// Row id
    pub id: RecordId,
    /// Contact that sent the key
    pub contact_id: ContactId,
    /// Their ephemeral public key
    pub public_key: ExchangePublicKey,
    /// Our offer this answers, if any
    pub initial_key: Option<ExchangePublicKey>,
    /// Whether a session key has been derived from it
    pub matched: bool,
    /// Relay timestamp of the element
    pub received_at: DateTime<Utc>,
}

/// A symmetric key from one completed handshake
///
/// Several may exist per contact. The newest `derived_at` encrypts outbound
/// messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKey {
    /// Contact the key is shared with
    pub contact_id: ContactId,
    /// Raw key material
    pub key: SymmetricKey,
    /// When the handshake completed
    pub derived_at: DateTime<Utc>,
}

/// Whether a message was sent or received
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Posted by us
    Sent,
    /// Fetched from the relay
    Received,
}

impl Direction {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    /// Parse a storage name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

/// A stored message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Row id
    pub id: i64,
    /// Contact on the other end
    pub contact_id: ContactId,
    /// Sent or received
    pub direction: Direction,
    /// Plaintext, when we wrote it or could decrypt it
    pub plaintext: Option<String>,
    /// Wire `encrypted_text`
    pub ciphertext: String,
    /// Hex nonce
    pub nonce: String,
    /// Relay timestamp
    pub timestamp: DateTime<Utc>,
    /// Sender's signature over `ciphertext`
    pub signature: SignatureBytes,
}

/// A message about to be stored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    /// Contact on the other end
    pub contact_id: ContactId,
    /// Sent or received
    pub direction: Direction,
    /// Plaintext, when known
    pub plaintext: Option<String>,
    /// Wire `encrypted_text`
    pub ciphertext: String,
    /// Hex nonce
    pub nonce: String,
    /// Relay timestamp
    pub timestamp: DateTime<Utc>,
    /// Sender's signature over `ciphertext`
    pub signature: SignatureBytes,
}

/// An offer we posted and still hold the private half of
#[derive(Clone, Debug)]
pub struct PendingOffer {
    /// Contact the offer was addressed to
    pub contact_id: ContactId,
    /// Our ephemeral keypair
    pub keypair: EphemeralKeypair,
}

/// A verified offer to record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOffer {
    /// Sender
    pub contact_id: ContactId,
    /// Their ephemeral key
    pub public_key: ExchangePublicKey,
    /// Relay timestamp
    pub received_at: DateTime<Utc>,
}

/// A verified response that completed one of our offers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedResponse {
    /// Sender
    pub contact_id: ContactId,
    /// Their ephemeral key
    pub public_key: ExchangePublicKey,
    /// Our offer it answered
    pub initial_key: ExchangePublicKey,
    /// Relay timestamp
    pub received_at: DateTime<Utc>,
    /// Key derived from it
    pub session_key: SessionKey,
}

/// Everything one fetch produced, persisted in a single write
#[derive(Clone, Debug, Default)]
pub struct FetchResults {
    /// New offers awaiting a response
    pub offers: Vec<NewOffer>,
    /// Responses that completed pending offers
    pub completed: Vec<CompletedResponse>,
    /// Received messages
    pub messages: Vec<NewMessage>,
}

impl FetchResults {
    /// Nothing to persist
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty() && self.completed.is_empty() && self.messages.is_empty()
    }
}

/// What a fetch write actually added, after de-duplication
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredFetch {
    /// Contacts with newly recorded offers
    pub new_offers: Vec<ContactId>,
    /// Contacts whose handshakes completed
    pub completed: Vec<ContactId>,
    /// Contacts with new messages
    pub new_messages: Vec<ContactId>,
}
