//! Session store
//!
//! Durable home of contacts, inbound exchange keys, pending offers, session
//! keys and messages. The engine only holds in-flight copies and hands every
//! result back here.
//!
//! Implementations are internally synchronized and safe to read from both
//! threads. Writers are additionally serialized by the client's single write
//! lock, so each write method may assume it is the only writer.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::crypto::{EphemeralKeypair, PublicKey, SignatureBytes};
use crate::model::{
    Contact, ContactId, ExchangeKeyRecord, FetchResults, Message, PendingOffer, RecordId,
    SessionKey, StoredFetch,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors from store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced row does not exist
    #[error("record not found: {0}")]
    NotFound(String),

    /// A unique column already holds this value
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// The backend failed
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    /// A stored value no longer decodes
    #[error("data corruption detected: {0}")]
    DataCorruption(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence used by the sync engine and the client
pub trait SessionStore: Send + Sync {
    /// All contacts, in insertion order
    fn contacts(&self) -> StoreResult<Vec<Contact>>;

    /// One contact by id
    fn contact(&self, id: ContactId) -> StoreResult<Option<Contact>>;

    /// Verification keys to fetch elements from
    fn contacts_with_keys(&self) -> StoreResult<Vec<PublicKey>>;

    /// Contacts with no session key and no outstanding offer
    fn contacts_without_session_key(&self) -> StoreResult<Vec<Contact>>;

    /// Inbound offers not yet answered
    fn unmatched_exchange_keys(&self) -> StoreResult<Vec<ExchangeKeyRecord>>;

    /// Session keys for a contact, newest first
    fn session_keys(&self, contact_id: ContactId) -> StoreResult<Vec<SessionKey>>;

    /// Newest session key for a contact
    fn latest_session_key(&self, contact_id: ContactId) -> StoreResult<Option<SessionKey>> {
        Ok(self.session_keys(contact_id)?.into_iter().next())
    }

    /// Messages with a contact, oldest first
    fn messages(&self, contact_id: ContactId) -> StoreResult<Vec<Message>>;

    /// Received messages no session key has opened yet, oldest first
    fn undecrypted_messages(&self, contact_id: ContactId) -> StoreResult<Vec<Message>> {
        Ok(self
            .messages(contact_id)?
            .into_iter()
            .filter(|m| m.plaintext.is_none())
            .collect())
    }

    /// Offers we posted and have not seen answered
    fn pending_offers(&self) -> StoreResult<Vec<PendingOffer>>;

    /// Add a contact; the verification key must be new
    fn add_contact(&self, name: &str, verification_key: PublicKey) -> StoreResult<Contact>;

    /// Persist one fetch worth of verified elements
    ///
    /// Offers already on record and messages whose signature is already
    /// stored are skipped. A completed response also drops the pending
    /// offer it answered.
    fn store_fetch_results(&self, results: FetchResults) -> StoreResult<StoredFetch>;

    /// Mark an offer matched and store the key derived from answering it
    ///
    /// Returns `false` without writing anything if the record was already
    /// matched.
    fn store_matched_offer(&self, record_id: RecordId, key: SessionKey) -> StoreResult<bool>;

    /// Remember an offer that reached the relay
    fn store_posted_offer(&self, contact_id: ContactId, keypair: &EphemeralKeypair)
        -> StoreResult<()>;

    /// Record a message the relay accepted
    ///
    /// A signature already on record returns the stored message instead of
    /// adding a second row.
    fn store_posted_message(&self, message: PostedMessage) -> StoreResult<Message>;

    /// Fill in the plaintext of a message stored without one
    ///
    /// Returns `false` if the message already had a plaintext.
    fn store_plaintext(&self, message_id: RecordId, plaintext: &str) -> StoreResult<bool>;
}

/// A sent message confirmed by the relay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostedMessage {
    /// Recipient
    pub contact_id: ContactId,
    /// What we wrote
    pub plaintext: String,
    /// Wire `encrypted_text`
    pub ciphertext: String,
    /// Nonce echoed by the relay
    pub nonce: String,
    /// Relay acceptance time
    pub timestamp: DateTime<Utc>,
    /// Our signature over `ciphertext`
    pub signature: SignatureBytes,
}
