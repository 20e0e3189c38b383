//! Sync engine
//!
//! Drives the protocol against the relay on a fixed interval:
//!
//! ```text
//! Disconnected ──ping ok──▶ Connected ──timeout──▶ Disconnected
//!                           │
//!                           ├─ 1. fetch, verify, route, persist
//!                           ├─ 2. answer unmatched offers
//!                           └─ 3. offer to contacts without a key
//! ```
//!
//! The three steps run in order and each finishes before the next starts.
//! Rejections, refused connections and store failures are reported and the
//! cycle moves on; only a timeout aborts it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::crypto::{PublicKey, SymmetricKey};
use crate::envelope::wire::open_text;
use crate::envelope::{Element, ExchangeKeyPost, FetchRequest, RelayResponse};
use crate::events::Event;
use crate::handshake::{self, CompleteOutcome};
use crate::model::{
    CompletedResponse, Contact, ContactId, Direction, FetchResults, NewMessage, NewOffer,
    StoredFetch,
};
use crate::transport::TransportError;

mod shared;

pub use shared::Shared;

/// Whether the relay is being polled or pinged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Probing with ping
    Disconnected,
    /// Running full cycles
    Connected,
}

/// Background protocol driver
pub struct SyncEngine {
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl SyncEngine {
    /// Engine over shared state, sleeping `poll_interval` between ticks
    pub fn new(shared: Arc<Shared>, poll_interval: Duration) -> Self {
        Self {
            shared,
            poll_interval,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        if self.shared.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Tick forever; never returns
    pub fn run(self) {
        loop {
            self.tick();
            thread::sleep(self.poll_interval);
        }
    }

    /// Run forever on a detached background thread
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    /// One iteration: ping when disconnected, then a full cycle if connected
    pub fn tick(&self) -> ConnectionState {
        if !self.shared.is_connected() {
            match self.shared.transport().ping() {
                Ok(()) => {
                    self.shared.set_connected(true);
                    info!("relay reachable");
                    self.shared.report(
                        Event::ConnectivityChanged(true),
                        "Successfully connected to the server.",
                    );
                }
                Err(e) => {
                    debug!(error = %e, "relay ping failed");
                    return ConnectionState::Disconnected;
                }
            }
        }

        if let Err(e) = self.cycle() {
            self.shared.mark_timed_out(&e);
        }
        self.state()
    }

    fn cycle(&self) -> Result<(), TransportError> {
        self.fetch_step()?;
        self.respond_step()?;
        self.exchange_step()
    }

    /// Step 1: fetch, verify and route every element
    fn fetch_step(&self) -> Result<(), TransportError> {
        let store = self.shared.store();
        let contacts = match store.contacts() {
            Ok(contacts) => contacts,
            Err(e) => {
                self.shared.report_store("failed to load contacts", &e);
                return Ok(());
            }
        };
        let sender_keys = match store.contacts_with_keys() {
            Ok(keys) => keys,
            Err(e) => {
                self.shared.report_store("failed to load contact keys", &e);
                return Ok(());
            }
        };
        if sender_keys.is_empty() {
            return Ok(());
        }

        let request = FetchRequest::new(self.shared.identity(), sender_keys);
        let response = match self.shared.transport().fetch(&request) {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(e),
            Err(e) => {
                self.shared.report_transport("fetch failed", &e);
                return Ok(());
            }
        };

        let by_key: HashMap<PublicKey, &Contact> = contacts
            .iter()
            .map(|contact| (contact.verification_key, contact))
            .collect();
        let results = self.route(response.elements(), &by_key);
        if results.is_empty() {
            return Ok(());
        }

        match self.shared.write(|store| store.store_fetch_results(results)) {
            Ok(stored) => self.report_fetch(&stored, &by_key),
            Err(e) => {
                self.shared.report_store("failed to store fetched elements", &e);
                // Completed responses consumed their pending entries; the
                // store still has them since the write rolled back
                if let Err(e) = self.shared.restore_pending() {
                    self.shared.report_store("failed to reload pending offers", &e);
                }
            }
        }
        Ok(())
    }

    fn route(
        &self,
        elements: Vec<Element>,
        by_key: &HashMap<PublicKey, &Contact>,
    ) -> FetchResults {
        let mut results = FetchResults::default();

        for element in elements {
            if !element.verify() {
                trace!(sender = %element.sender_key(), "dropping element with bad signature");
                continue;
            }
            let Some(contact) = by_key.get(element.sender_key()) else {
                trace!(sender = %element.sender_key(), "dropping element from unknown sender");
                continue;
            };

            match element {
                Element::ExchangeKeyOffer(offer) => results.offers.push(NewOffer {
                    contact_id: contact.id,
                    public_key: offer.exchange_key,
                    received_at: offer.timestamp,
                }),
                Element::ExchangeKeyResponse(response) => {
                    let outcome = self.shared.handshake().complete_offer(contact.id, &response);
                    if let CompleteOutcome::Completed(session_key) = outcome {
                        results.completed.push(CompletedResponse {
                            contact_id: contact.id,
                            public_key: response.exchange_key,
                            initial_key: response.initial_key,
                            received_at: response.timestamp,
                            session_key,
                        });
                    }
                }
                Element::Message(message) => {
                    let plaintext = self.decrypt(contact.id, &message.encrypted_text, &results);
                    results.messages.push(NewMessage {
                        contact_id: contact.id,
                        direction: Direction::Received,
                        plaintext,
                        ciphertext: message.encrypted_text,
                        nonce: message.nonce,
                        timestamp: message.timestamp,
                        signature: message.signature,
                    });
                }
            }
        }

        results
    }

    /// Try every key known for the contact, newest first
    ///
    /// Messages do not say which session key sealed them. Keys completed
    /// earlier in the same fetch are tried before stored ones.
    fn decrypt(
        &self,
        contact_id: ContactId,
        encrypted_text: &str,
        pending: &FetchResults,
    ) -> Option<String> {
        let fresh: Vec<SymmetricKey> = pending
            .completed
            .iter()
            .rev()
            .filter(|c| c.contact_id == contact_id)
            .map(|c| c.session_key.key.clone())
            .collect();
        let stored = match self.shared.store().session_keys(contact_id) {
            Ok(keys) => keys.into_iter().map(|k| k.key).collect(),
            Err(e) => {
                self.shared.report_store("failed to load session keys", &e);
                Vec::new()
            }
        };

        let plaintext = fresh
            .iter()
            .chain(stored.iter())
            .find_map(|key| open_text(key, encrypted_text).ok());
        if plaintext.is_none() {
            debug!(contact_id, "no session key opens message");
        }
        plaintext
    }

    /// Retry stored messages that arrived before the key that sealed them
    fn reopen_messages(&self, contact_id: ContactId, name: &str) {
        let store = self.shared.store();
        let waiting = match store.undecrypted_messages(contact_id) {
            Ok(waiting) if waiting.is_empty() => return,
            Ok(waiting) => waiting,
            Err(e) => {
                self.shared.report_store("failed to load undecrypted messages", &e);
                return;
            }
        };
        let keys = match store.session_keys(contact_id) {
            Ok(keys) => keys,
            Err(e) => {
                self.shared.report_store("failed to load session keys", &e);
                return;
            }
        };

        let mut opened = 0;
        for message in waiting {
            let Some(plaintext) = keys
                .iter()
                .find_map(|k| open_text(&k.key, &message.ciphertext).ok())
            else {
                continue;
            };
            match self
                .shared
                .write(|store| store.store_plaintext(message.id, &plaintext))
            {
                Ok(true) => opened += 1,
                Ok(false) => {}
                Err(e) => self.shared.report_store("failed to store decrypted message", &e),
            }
        }

        if opened > 0 {
            debug!(contact_id, opened, "opened earlier messages");
            self.shared.report(
                Event::NewMessage(contact_id),
                format!("{} earlier message(s) from {} can now be read.", opened, name),
            );
        }
    }

    fn report_fetch(&self, stored: &StoredFetch, by_key: &HashMap<PublicKey, &Contact>) {
        let name = |id: ContactId| {
            by_key
                .values()
                .find(|c| c.id == id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| format!("contact {}", id))
        };

        for id in unique(&stored.new_offers) {
            self.shared.report(
                Event::OfferReceived(id),
                format!("{} requested a key exchange.", name(id)),
            );
        }
        for id in unique(&stored.completed) {
            info!(contact_id = id, "handshake completed");
            self.shared.report(
                Event::HandshakeCompleted(id),
                format!("Key exchange with {} complete.", name(id)),
            );
            self.reopen_messages(id, &name(id));
        }
        for id in unique(&stored.new_messages) {
            let count = stored.new_messages.iter().filter(|&&m| m == id).count();
            self.shared.report(
                Event::NewMessage(id),
                format!("{} new message(s) from {}.", count, name(id)),
            );
        }
    }

    /// Step 2: answer every unmatched offer
    fn respond_step(&self) -> Result<(), TransportError> {
        let store = self.shared.store();
        let records = match store.unmatched_exchange_keys() {
            Ok(records) => records,
            Err(e) => {
                self.shared.report_store("failed to load unmatched keys", &e);
                return Ok(());
            }
        };

        for mut record in records {
            let contact = match store.contact(record.contact_id) {
                Ok(Some(contact)) => contact,
                Ok(None) => continue,
                Err(e) => {
                    self.shared.report_store("failed to load contact", &e);
                    continue;
                }
            };

            let answer = self.shared.handshake().respond_to_offer(&mut record);
            let (response, session_key) = match answer {
                Ok(answer) => answer,
                Err(e) => {
                    debug!(error = %e, "skipping exchange key");
                    continue;
                }
            };

            let post = ExchangeKeyPost::new(
                self.shared.identity(),
                contact.verification_key,
                response.exchange_key,
                Some(response.initial_key),
            );
            let receipt = match self.shared.transport().post_exchange_key(&post) {
                Ok(receipt) => receipt,
                Err(e) if e.is_timeout() => return Err(e),
                Err(e) => {
                    self.shared.report_transport("exchange key response rejected", &e);
                    continue;
                }
            };
            debug!(status = receipt.status(), contact = %contact.name, "exchange key response posted");

            let session_key = handshake::stamp(session_key, receipt.data.timestamp);
            match self
                .shared
                .write(|store| store.store_matched_offer(record.id, session_key))
            {
                Ok(true) => {
                    info!(contact = %contact.name, "handshake completed");
                    self.shared.report(
                        Event::HandshakeCompleted(contact.id),
                        format!("Key exchange with {} complete.", contact.name),
                    );
                    self.reopen_messages(contact.id, &contact.name);
                }
                Ok(false) => debug!(record_id = record.id, "exchange key already matched"),
                Err(e) => self.shared.report_store("failed to store session key", &e),
            }
        }

        Ok(())
    }

    /// Step 3: offer to every contact with no key and no outstanding offer
    fn exchange_step(&self) -> Result<(), TransportError> {
        let contacts = match self.shared.store().contacts_without_session_key() {
            Ok(contacts) => contacts,
            Err(e) => {
                self.shared.report_store("failed to load contacts", &e);
                return Ok(());
            }
        };

        for contact in contacts {
            if self.shared.handshake().has_pending(contact.id) {
                continue;
            }
            match self.shared.post_offer(&contact) {
                Ok(()) => {}
                Err(e) if e.is_timeout() => return Err(e),
                Err(e) => self.shared.report_transport("exchange key offer rejected", &e),
            }
        }

        Ok(())
    }
}

fn unique(ids: &[ContactId]) -> BTreeSet<ContactId> {
    ids.iter().copied().collect()
}
