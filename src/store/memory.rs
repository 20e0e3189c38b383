//! In-memory session store

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::crypto::{EphemeralKeypair, ExchangePublicKey, PublicKey};
use crate::model::{
    Contact, ContactId, Direction, ExchangeKeyRecord, FetchResults, Message, PendingOffer,
    RecordId, SessionKey, StoredFetch,
};

use super::{PostedMessage, SessionStore, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    contacts: Vec<Contact>,
    exchange_keys: Vec<ExchangeKeyRecord>,
    pending: Vec<PendingOffer>,
    session_keys: Vec<SessionKey>,
    messages: Vec<Message>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_contact(&self, id: ContactId) -> StoreResult<()> {
        if self.contacts.iter().any(|c| c.id == id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("contact {}", id)))
        }
    }

    fn has_exchange_key(&self, contact_id: ContactId, key: &ExchangePublicKey) -> bool {
        self.exchange_keys
            .iter()
            .any(|r| r.contact_id == contact_id && &r.public_key == key)
    }
}

/// Session store kept in process memory
///
/// Used by tests and `--ephemeral` runs. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for MemoryStore {
    fn contacts(&self) -> StoreResult<Vec<Contact>> {
        Ok(self.read().contacts.clone())
    }

    fn contact(&self, id: ContactId) -> StoreResult<Option<Contact>> {
        Ok(self.read().contacts.iter().find(|c| c.id == id).cloned())
    }

    fn contacts_with_keys(&self) -> StoreResult<Vec<PublicKey>> {
        Ok(self
            .read()
            .contacts
            .iter()
            .map(|c| c.verification_key)
            .collect())
    }

    fn contacts_without_session_key(&self) -> StoreResult<Vec<Contact>> {
        let tables = self.read();
        Ok(tables
            .contacts
            .iter()
            .filter(|c| !tables.session_keys.iter().any(|k| k.contact_id == c.id))
            .filter(|c| !tables.pending.iter().any(|p| p.contact_id == c.id))
            .cloned()
            .collect())
    }

    fn unmatched_exchange_keys(&self) -> StoreResult<Vec<ExchangeKeyRecord>> {
        Ok(self
            .read()
            .exchange_keys
            .iter()
            .filter(|r| !r.matched && r.initial_key.is_none())
            .cloned()
            .collect())
    }

    fn session_keys(&self, contact_id: ContactId) -> StoreResult<Vec<SessionKey>> {
        let mut keys: Vec<_> = self
            .read()
            .session_keys
            .iter()
            .filter(|k| k.contact_id == contact_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order, reversed below
        keys.sort_by_key(|k| k.derived_at);
        keys.reverse();
        Ok(keys)
    }

    fn messages(&self, contact_id: ContactId) -> StoreResult<Vec<Message>> {
        let mut messages: Vec<_> = self
            .read()
            .messages
            .iter()
            .filter(|m| m.contact_id == contact_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.timestamp, m.id));
        Ok(messages)
    }

    fn pending_offers(&self) -> StoreResult<Vec<PendingOffer>> {
        Ok(self.read().pending.clone())
    }

    fn add_contact(&self, name: &str, verification_key: PublicKey) -> StoreResult<Contact> {
        let mut tables = self.write();
        if tables
            .contacts
            .iter()
            .any(|c| c.verification_key == verification_key)
        {
            return Err(StoreError::AlreadyExists(format!(
                "contact with key {}",
                verification_key
            )));
        }

        let contact = Contact {
            id: tables.next_id(),
            name: name.to_string(),
            verification_key,
        };
        tables.contacts.push(contact.clone());
        Ok(contact)
    }

    fn store_fetch_results(&self, results: FetchResults) -> StoreResult<StoredFetch> {
        let mut tables = self.write();
        let mut stored = StoredFetch::default();

        for offer in results.offers {
            tables.require_contact(offer.contact_id)?;
            if tables.has_exchange_key(offer.contact_id, &offer.public_key) {
                continue;
            }
            let id = tables.next_id();
            tables.exchange_keys.push(ExchangeKeyRecord {
                id,
                contact_id: offer.contact_id,
                public_key: offer.public_key,
                initial_key: None,
                matched: false,
                received_at: offer.received_at,
            });
            stored.new_offers.push(offer.contact_id);
        }

        for response in results.completed {
            tables.require_contact(response.contact_id)?;
            if tables.has_exchange_key(response.contact_id, &response.public_key) {
                continue;
            }
            let id = tables.next_id();
            tables.exchange_keys.push(ExchangeKeyRecord {
                id,
                contact_id: response.contact_id,
                public_key: response.public_key,
                initial_key: Some(response.initial_key),
                matched: true,
                received_at: response.received_at,
            });
            tables
                .pending
                .retain(|p| p.keypair.public_key() != &response.initial_key);
            tables.session_keys.push(response.session_key);
            stored.completed.push(response.contact_id);
        }

        for message in results.messages {
            tables.require_contact(message.contact_id)?;
            if tables
                .messages
                .iter()
                .any(|m| m.signature == message.signature)
            {
                continue;
            }
            let id = tables.next_id();
            tables.messages.push(Message {
                id,
                contact_id: message.contact_id,
                direction: message.direction,
                plaintext: message.plaintext,
                ciphertext: message.ciphertext,
                nonce: message.nonce,
                timestamp: message.timestamp,
                signature: message.signature,
            });
            stored.new_messages.push(message.contact_id);
        }

        Ok(stored)
    }

    fn store_matched_offer(&self, record_id: RecordId, key: SessionKey) -> StoreResult<bool> {
        let mut tables = self.write();
        let record = tables
            .exchange_keys
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| StoreError::NotFound(format!("exchange key {}", record_id)))?;

        if record.matched {
            return Ok(false);
        }
        record.matched = true;
        tables.session_keys.push(key);
        Ok(true)
    }

    fn store_posted_offer(
        &self,
        contact_id: ContactId,
        keypair: &EphemeralKeypair,
    ) -> StoreResult<()> {
        let mut tables = self.write();
        tables.require_contact(contact_id)?;
        tables.pending.push(PendingOffer {
            contact_id,
            keypair: keypair.clone(),
        });
        Ok(())
    }

    fn store_posted_message(&self, message: PostedMessage) -> StoreResult<Message> {
        let mut tables = self.write();
        tables.require_contact(message.contact_id)?;
        if let Some(existing) = tables
            .messages
            .iter()
            .find(|m| m.signature == message.signature)
        {
            return Ok(existing.clone());
        }

        let stored = Message {
            id: tables.next_id(),
            contact_id: message.contact_id,
            direction: Direction::Sent,
            plaintext: Some(message.plaintext),
            ciphertext: message.ciphertext,
            nonce: message.nonce,
            timestamp: message.timestamp,
            signature: message.signature,
        };
        tables.messages.push(stored.clone());
        Ok(stored)
    }

    fn store_plaintext(&self, message_id: RecordId, plaintext: &str) -> StoreResult<bool> {
        let mut tables = self.write();
        let message = tables
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))?;

        if message.plaintext.is_some() {
            return Ok(false);
        }
        message.plaintext = Some(plaintext.to_string());
        Ok(true)
    }
}
