//! State shared by the foreground and the sync worker
//!
//! One handle, one lock per resource. Store writes are serialized by
//! `store_write`; the event log and the pending-offer table have their own
//! locks. None of them is held across a transport call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::crypto::{Identity, PublicKey};
use crate::envelope::ExchangeKeyPost;
use crate::events::{Event, EventLog, LogEntry};
use crate::handshake::HandshakeEngine;
use crate::model::Contact;
use crate::store::{SessionStore, StoreError, StoreResult};
use crate::transport::{Transport, TransportError};

/// Shared client state
pub struct Shared {
    identity: Identity,
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn Transport>,
    store_write: Mutex<()>,
    events: Mutex<EventLog>,
    handshake: Mutex<HandshakeEngine>,
    connected: AtomicBool,
}

impl Shared {
    /// Wrap the collaborators; starts disconnected with an empty pending table
    pub fn new(
        identity: Identity,
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn Transport>,
        event_log_capacity: usize,
    ) -> Self {
        Self {
            identity,
            store,
            transport,
            store_write: Mutex::new(()),
            events: Mutex::new(EventLog::new(event_log_capacity)),
            handshake: Mutex::new(HandshakeEngine::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Our signing identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Our address on the relay
    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// Read access to the store
    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// The relay client
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Run one store mutation under the write lock
    pub fn write<T>(
        &self,
        op: impl FnOnce(&dyn SessionStore) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self
            .store_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        op(self.store.as_ref())
    }

    /// The pending-offer table
    pub fn handshake(&self) -> MutexGuard<'_, HandshakeEngine> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload the pending table from the store
    pub fn restore_pending(&self) -> StoreResult<usize> {
        let offers = self.store.pending_offers()?;
        let count = offers.len();
        self.handshake().restore(offers);
        Ok(count)
    }

    /// Whether the relay is currently considered reachable
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Record a connectivity change; returns whether it changed anything
    pub fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::SeqCst) != connected
    }

    /// Log an event under its default title
    pub fn report(&self, event: Event, text: impl Into<String>) {
        self.events().push(event, text);
    }

    /// Log an event under a custom title
    pub fn report_titled(&self, event: Event, title: &str, text: impl Into<String>) {
        self.events().push_titled(event, title, text);
    }

    /// Log a relay refusal or bad answer
    pub fn report_transport(&self, context: &str, error: &TransportError) {
        warn!(error = %error, "{}", context);
        self.report_titled(
            Event::OperationFailed(error.to_string()),
            "Bad Response",
            format!("{}: {}", context, error),
        );
    }

    /// Log a failed store operation
    pub fn report_store(&self, context: &str, error: &StoreError) {
        warn!(error = %error, "{}", context);
        self.report_titled(
            Event::OperationFailed(error.to_string()),
            "Storage Error",
            format!("{}: {}", context, error),
        );
    }

    /// Demote to disconnected after a request timed out
    pub fn mark_timed_out(&self, error: &TransportError) {
        if !self.set_connected(false) {
            return;
        }
        warn!(error = %error, "relay timed out");
        self.report(
            Event::ConnectivityChanged(false),
            "Request timed out. Attempting to reconnect...",
        );
    }

    /// Log entries newer than `seq`
    pub fn events_since(&self, seq: u64) -> Vec<LogEntry> {
        self.events().since(seq)
    }

    fn events(&self) -> MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a handshake with `contact`: initiate, post, then persist
    ///
    /// The offer is dropped from the pending table if the post fails. A
    /// store failure after a successful post is reported but not returned;
    /// the offer stays pending in memory.
    pub fn post_offer(&self, contact: &Contact) -> Result<(), TransportError> {
        let offer = self.handshake().initiate(contact.id);
        let post = ExchangeKeyPost::new(
            &self.identity,
            contact.verification_key,
            *offer.exchange_key(),
            None,
        );

        if let Err(e) = self.transport.post_exchange_key(&post) {
            self.handshake().abandon(offer.exchange_key());
            return Err(e);
        }

        match self.write(|store| store.store_posted_offer(contact.id, &offer.keypair)) {
            Ok(()) => {
                info!(contact = %contact.name, "exchange key offer posted");
                self.report(
                    Event::OfferPosted(contact.id),
                    format!("Sent a key exchange request to {}.", contact.name),
                );
            }
            Err(e) => self.report_store("failed to record posted offer", &e),
        }
        Ok(())
    }
}
