//! Client facade
//!
//! What the presentation layer talks to: intents go in through [`Client`],
//! events come out of the shared log. The sync worker runs on its own thread
//! over the same [`Shared`] handle.
//!
//! Reads taken here to decide on an action (is there a key, is the relay up)
//! can be stale by the time the action runs; the worker may have changed
//! things in between. Those races are accepted.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::crypto::{CryptoError, Identity, PublicKey};
use crate::envelope::MessagePost;
use crate::events::{Event, LogEntry};
use crate::model::{Contact, ContactId, Message};
use crate::store::{PostedMessage, SessionStore, StoreError};
use crate::sync::{Shared, SyncEngine};
use crate::transport::{Transport, TransportError};

/// Errors returned to the caller of an intent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The relay is not reachable right now
    #[error("not connected to the server")]
    NotConnected,

    /// No contact matches
    #[error("unknown contact: {0}")]
    UnknownContact(String),

    /// No handshake has completed with this contact yet
    #[error("no session key with {0} yet")]
    NoSessionKey(String),

    /// Sending without a selected contact
    #[error("no contact selected")]
    NoContactSelected,

    /// Nothing to send
    #[error("message is empty")]
    EmptyMessage,

    /// Contacts need a name
    #[error("contact name is empty")]
    EmptyName,

    /// Key or encryption failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Relay failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for client intents
pub type ClientResult<T> = Result<T, ClientError>;

/// Foreground handle
pub struct Client {
    shared: Arc<Shared>,
    selected: Option<ContactId>,
}

impl Client {
    /// Build a client and reload any offers left pending by a previous run
    pub fn new(
        identity: Identity,
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn Transport>,
        event_log_capacity: usize,
    ) -> ClientResult<Self> {
        let shared = Arc::new(Shared::new(identity, store, transport, event_log_capacity));
        let restored = shared.restore_pending()?;
        if restored > 0 {
            info!(count = restored, "restored pending exchange key offers");
        }

        Ok(Self {
            shared,
            selected: None,
        })
    }

    /// Our address, to share with contacts
    pub fn public_key(&self) -> &PublicKey {
        self.shared.public_key()
    }

    /// Whether the relay is currently reachable
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// A sync engine over this client's state
    pub fn sync_engine(&self, poll_interval: Duration) -> SyncEngine {
        SyncEngine::new(Arc::clone(&self.shared), poll_interval)
    }

    /// Start the background worker; it runs until the process exits
    pub fn spawn_sync(&self, poll_interval: Duration) -> JoinHandle<()> {
        self.sync_engine(poll_interval).spawn()
    }

    /// Add a contact from a name and a pasted verification key
    pub fn add_contact(&self, name: &str, verification_key: &str) -> ClientResult<Contact> {
        let name = name.trim();
        if name.is_empty() {
            return self.refuse(ClientError::EmptyName);
        }
        let key = match PublicKey::from_base64(verification_key.trim()) {
            Ok(key) => key,
            Err(e) => return self.refuse(e.into()),
        };

        let contact = match self.shared.write(|store| store.add_contact(name, key)) {
            Ok(contact) => contact,
            Err(e) => return self.refuse(e.into()),
        };
        self.shared.report(
            Event::ContactAdded(contact.id),
            format!("Added {}.", contact.name),
        );
        Ok(contact)
    }

    /// Select a contact by id or by exact name
    pub fn select_contact(&mut self, query: &str) -> ClientResult<Contact> {
        let query = query.trim();
        let contacts = self.shared.store().contacts()?;
        let by_id = query.parse::<ContactId>().ok();

        let found = contacts
            .into_iter()
            .find(|c| Some(c.id) == by_id || c.name == query);
        match found {
            Some(contact) => {
                self.selected = Some(contact.id);
                Ok(contact)
            }
            None => self.refuse(ClientError::UnknownContact(query.to_string())),
        }
    }

    /// Currently selected contact
    pub fn selected(&self) -> ClientResult<Option<Contact>> {
        match self.selected {
            Some(id) => Ok(self.shared.store().contact(id)?),
            None => Ok(None),
        }
    }

    /// All contacts
    pub fn contacts(&self) -> ClientResult<Vec<Contact>> {
        Ok(self.shared.store().contacts()?)
    }

    /// Conversation with a contact, oldest first
    pub fn messages(&self, contact_id: ContactId) -> ClientResult<Vec<Message>> {
        Ok(self.shared.store().messages(contact_id)?)
    }

    /// Whether a handshake with the contact has completed
    pub fn has_session_key(&self, contact_id: ContactId) -> ClientResult<bool> {
        Ok(self.shared.store().latest_session_key(contact_id)?.is_some())
    }

    /// Log entries newer than `seq`
    pub fn events_since(&self, seq: u64) -> Vec<LogEntry> {
        self.shared.events_since(seq)
    }

    /// Send to the selected contact
    pub fn send_to_selected(&self, plaintext: &str) -> ClientResult<Message> {
        match self.selected {
            Some(id) => self.send_message(id, plaintext),
            None => self.refuse(ClientError::NoContactSelected),
        }
    }

    /// Encrypt under the newest session key, sign, post, then store
    ///
    /// Refused without trying when disconnected, when the contact is
    /// unknown, or when no handshake has completed with it.
    pub fn send_message(&self, contact_id: ContactId, plaintext: &str) -> ClientResult<Message> {
        if plaintext.is_empty() {
            return self.refuse(ClientError::EmptyMessage);
        }
        if !self.shared.is_connected() {
            return self.refuse(ClientError::NotConnected);
        }
        let contact = self.known_contact(contact_id)?;
        let key = match self.shared.store().latest_session_key(contact_id)? {
            Some(key) => key,
            None => return self.refuse(ClientError::NoSessionKey(contact.name)),
        };

        let post = MessagePost::seal(
            self.shared.identity(),
            contact.verification_key,
            &key.key,
            plaintext,
        )?;
        let receipt = self.post(|transport| transport.post_message(&post))?;

        let message = self.shared.write(|store| {
            store.store_posted_message(PostedMessage {
                contact_id,
                plaintext: plaintext.to_string(),
                ciphertext: post.encrypted_text.clone(),
                nonce: receipt.data.nonce.clone(),
                timestamp: receipt.data.timestamp,
                signature: post.signature,
            })
        });
        match message {
            Ok(message) => {
                self.shared.report(
                    Event::MessageSent(contact_id),
                    format!("Message to {} delivered to the server.", contact.name),
                );
                Ok(message)
            }
            Err(e) => {
                self.shared.report_store("failed to record sent message", &e);
                Err(e.into())
            }
        }
    }

    /// Post a fresh exchange-key offer to a contact now
    pub fn request_exchange(&self, contact_id: ContactId) -> ClientResult<()> {
        if !self.shared.is_connected() {
            return self.refuse(ClientError::NotConnected);
        }
        let contact = self.known_contact(contact_id)?;
        self.post(|_| self.shared.post_offer(&contact))
    }

    fn known_contact(&self, contact_id: ContactId) -> ClientResult<Contact> {
        match self.shared.store().contact(contact_id)? {
            Some(contact) => Ok(contact),
            None => self.refuse(ClientError::UnknownContact(contact_id.to_string())),
        }
    }

    /// Run a relay call; failures are logged, and a timeout demotes the
    /// worker too
    fn post<T>(
        &self,
        call: impl FnOnce(&dyn Transport) -> Result<T, TransportError>,
    ) -> ClientResult<T> {
        call(self.shared.transport()).map_err(|e| {
            if e.is_timeout() {
                self.shared.mark_timed_out(&e);
            } else {
                self.shared.report_transport("request rejected", &e);
            }
            e.into()
        })
    }

    fn refuse<T>(&self, error: ClientError) -> ClientResult<T> {
        self.shared
            .report(Event::OperationFailed(error.to_string()), error.to_string());
        Err(error)
    }
}
