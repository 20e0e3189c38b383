//! Handshake engine
//!
//! A two-step X25519 exchange between parties who only know each other's
//! verification key:
//!
//! ```text
//! initiator                          responder
//! ---------                          ---------
//! initiate()          offer  ──────▶ record (OfferReceivedUnmatched)
//! (OfferSent)                        respond_to_offer() → session key
//! complete_offer() ◀──────  response (initial_key = offer)
//! → session key (Matched)            (Matched)
//! ```
//!
//! There is no failed state: a handshake that never gets an answer stays
//! open. Both sides use the raw shared secret as the session key.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{EphemeralKeypair, ExchangePublicKey};
use crate::envelope::ExchangeKeyResponse;
use crate::model::{ContactId, ExchangeKeyRecord, PendingOffer, RecordId, SessionKey};

/// Where a single handshake stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// We posted an offer and hold its private half
    OfferSent,
    /// We recorded their offer and have not answered yet
    OfferReceivedUnmatched,
    /// A session key has been derived
    Matched,
}

impl HandshakeState {
    /// State of an inbound record
    pub fn of_record(record: &ExchangeKeyRecord) -> Self {
        if record.matched {
            HandshakeState::Matched
        } else {
            HandshakeState::OfferReceivedUnmatched
        }
    }
}

/// Errors from handshake operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The record already produced a session key
    #[error("exchange key {0} is already matched")]
    AlreadyMatched(RecordId),

    /// The record is a response, not an offer
    #[error("exchange key {0} is a response and cannot be answered")]
    NotAnOffer(RecordId),
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// An offer ready to post
#[derive(Clone, Debug)]
pub struct OutboundOffer {
    /// Recipient
    pub contact_id: ContactId,
    /// Our new ephemeral keypair; the engine keeps its own copy
    pub keypair: EphemeralKeypair,
}

impl OutboundOffer {
    /// The public half to post
    pub fn exchange_key(&self) -> &ExchangePublicKey {
        self.keypair.public_key()
    }
}

/// A response ready to post
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutboundResponse {
    /// Recipient
    pub contact_id: ContactId,
    /// Record being answered
    pub record_id: RecordId,
    /// Our new ephemeral public key
    pub exchange_key: ExchangePublicKey,
    /// Their offer, echoed as `initial_key`
    pub initial_key: ExchangePublicKey,
}

/// Result of feeding a response to the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The response matched a pending offer
    Completed(SessionKey),
    /// No pending offer matches; already completed, spoofed, or misaddressed
    Unrecognized,
}

/// Pending-offer table and key derivation
#[derive(Debug, Default)]
pub struct HandshakeEngine {
    pending: HashMap<ExchangePublicKey, PendingOffer>,
}

impl HandshakeEngine {
    /// Empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload offers that were outstanding when the process last stopped
    pub fn restore(&mut self, offers: impl IntoIterator<Item = PendingOffer>) {
        for offer in offers {
            self.pending.insert(*offer.keypair.public_key(), offer);
        }
    }

    /// Start a handshake with a contact
    pub fn initiate(&mut self, contact_id: ContactId) -> OutboundOffer {
        let keypair = EphemeralKeypair::generate();
        self.pending.insert(
            *keypair.public_key(),
            PendingOffer {
                contact_id,
                keypair: keypair.clone(),
            },
        );

        OutboundOffer {
            contact_id,
            keypair,
        }
    }

    /// Forget an offer whose post never reached the relay
    pub fn abandon(&mut self, exchange_key: &ExchangePublicKey) {
        self.pending.remove(exchange_key);
    }

    /// Answer an inbound offer
    ///
    /// Marks `record` matched. The caller posts the response, then persists
    /// the key and the flag.
    pub fn respond_to_offer(
        &self,
        record: &mut ExchangeKeyRecord,
    ) -> HandshakeResult<(OutboundResponse, SessionKey)> {
        if record.initial_key.is_some() {
            return Err(HandshakeError::NotAnOffer(record.id));
        }
        if record.matched {
            return Err(HandshakeError::AlreadyMatched(record.id));
        }

        let keypair = EphemeralKeypair::generate();
        let shared = keypair.diffie_hellman(&record.public_key);
        record.matched = true;

        let response = OutboundResponse {
            contact_id: record.contact_id,
            record_id: record.id,
            exchange_key: *keypair.public_key(),
            initial_key: record.public_key,
        };
        let session_key = SessionKey {
            contact_id: record.contact_id,
            key: shared.to_session_key(),
            derived_at: Utc::now(),
        };
        Ok((response, session_key))
    }

    /// Finish one of our offers with a verified response from `contact_id`
    ///
    /// Only the first matching response consumes the pending entry; replays
    /// and responses from another contact come back `Unrecognized`.
    pub fn complete_offer(
        &mut self,
        contact_id: ContactId,
        response: &ExchangeKeyResponse,
    ) -> CompleteOutcome {
        let addressed_to_sender = self
            .pending
            .get(&response.initial_key)
            .is_some_and(|offer| offer.contact_id == contact_id);

        if !addressed_to_sender {
            debug!(contact_id, initial_key = ?response.initial_key, "unrecognized exchange key response");
            return CompleteOutcome::Unrecognized;
        }

        let Some(offer) = self.pending.remove(&response.initial_key) else {
            return CompleteOutcome::Unrecognized;
        };

        let shared = offer.keypair.diffie_hellman(&response.exchange_key);
        CompleteOutcome::Completed(SessionKey {
            contact_id,
            key: shared.to_session_key(),
            derived_at: response.timestamp,
        })
    }

    /// Whether an offer to this contact is still outstanding
    pub fn has_pending(&self, contact_id: ContactId) -> bool {
        self.pending.values().any(|offer| offer.contact_id == contact_id)
    }

    /// State of one of our own offers
    pub fn offer_state(&self, exchange_key: &ExchangePublicKey) -> Option<HandshakeState> {
        self.pending
            .contains_key(exchange_key)
            .then_some(HandshakeState::OfferSent)
    }

    /// Number of outstanding offers
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Stamp a derived key with the relay's acceptance time
pub fn stamp(mut key: SessionKey, derived_at: DateTime<Utc>) -> SessionKey {
    key.derived_at = derived_at;
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    fn offer_record(id: RecordId, contact_id: ContactId, key: ExchangePublicKey) -> ExchangeKeyRecord {
        ExchangeKeyRecord {
            id,
            contact_id,
            public_key: key,
            initial_key: None,
            matched: false,
            received_at: Utc::now(),
        }
    }

    fn response_element(
        from: &Identity,
        exchange_key: ExchangePublicKey,
        initial_key: ExchangePublicKey,
    ) -> ExchangeKeyResponse {
        ExchangeKeyResponse {
            sender_key: *from.public_key(),
            signature: from.sign(exchange_key.as_bytes()),
            timestamp: Utc::now(),
            exchange_key,
            initial_key,
        }
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let bob = Identity::generate();
        let mut alice_engine = HandshakeEngine::new();
        let bob_engine = HandshakeEngine::new();

        // Alice offers to Bob (contact 1 in Alice's store)
        let offer = alice_engine.initiate(1);
        assert_eq!(
            alice_engine.offer_state(offer.exchange_key()),
            Some(HandshakeState::OfferSent)
        );

        // Bob records it (Alice is contact 7 in Bob's store) and responds
        let mut record = offer_record(3, 7, *offer.exchange_key());
        let (response, bob_key) = bob_engine.respond_to_offer(&mut record).unwrap();
        assert!(record.matched);
        assert_eq!(HandshakeState::of_record(&record), HandshakeState::Matched);
        assert_eq!(response.initial_key, *offer.exchange_key());
        assert_eq!(response.record_id, 3);

        // Alice completes
        let element = response_element(&bob, response.exchange_key, response.initial_key);
        match alice_engine.complete_offer(1, &element) {
            CompleteOutcome::Completed(alice_key) => {
                assert_eq!(alice_key.key, bob_key.key);
                assert_eq!(alice_key.contact_id, 1);
                assert_eq!(alice_key.derived_at, element.timestamp);
            }
            CompleteOutcome::Unrecognized => panic!("response should match"),
        }
        assert_eq!(alice_engine.offer_state(offer.exchange_key()), None);
    }

    #[test]
    fn test_replayed_response_is_unrecognized() {
        let bob = Identity::generate();
        let mut engine = HandshakeEngine::new();
        let offer = engine.initiate(1);

        let mut record = offer_record(1, 1, *offer.exchange_key());
        let (response, _) = HandshakeEngine::new().respond_to_offer(&mut record).unwrap();
        let element = response_element(&bob, response.exchange_key, response.initial_key);

        assert!(matches!(
            engine.complete_offer(1, &element),
            CompleteOutcome::Completed(_)
        ));
        assert_eq!(engine.complete_offer(1, &element), CompleteOutcome::Unrecognized);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_response_from_other_contact_is_unrecognized() {
        let mallory = Identity::generate();
        let mut engine = HandshakeEngine::new();
        let offer = engine.initiate(1);

        let element = response_element(
            &mallory,
            *EphemeralKeypair::generate().public_key(),
            *offer.exchange_key(),
        );

        assert_eq!(engine.complete_offer(2, &element), CompleteOutcome::Unrecognized);
        // The real contact can still complete it
        assert!(engine.has_pending(1));
    }

    #[test]
    fn test_unknown_initial_key_is_unrecognized() {
        let bob = Identity::generate();
        let mut engine = HandshakeEngine::new();
        engine.initiate(1);

        let element = response_element(
            &bob,
            *EphemeralKeypair::generate().public_key(),
            *EphemeralKeypair::generate().public_key(),
        );
        assert_eq!(engine.complete_offer(1, &element), CompleteOutcome::Unrecognized);
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn test_matched_record_is_refused() {
        let engine = HandshakeEngine::new();
        let mut record = offer_record(5, 1, *EphemeralKeypair::generate().public_key());

        engine.respond_to_offer(&mut record).unwrap();
        assert_eq!(
            engine.respond_to_offer(&mut record).err(),
            Some(HandshakeError::AlreadyMatched(5))
        );
    }

    #[test]
    fn test_response_record_is_refused() {
        let engine = HandshakeEngine::new();
        let mut record = offer_record(6, 1, *EphemeralKeypair::generate().public_key());
        record.initial_key = Some(*EphemeralKeypair::generate().public_key());

        assert_eq!(
            engine.respond_to_offer(&mut record).err(),
            Some(HandshakeError::NotAnOffer(6))
        );
        assert!(!record.matched);
    }

    #[test]
    fn test_restore_and_abandon() {
        let keypair = EphemeralKeypair::generate();
        let mut engine = HandshakeEngine::new();
        engine.restore([PendingOffer {
            contact_id: 4,
            keypair: keypair.clone(),
        }]);
        assert!(engine.has_pending(4));

        engine.abandon(keypair.public_key());
        assert!(!engine.has_pending(4));
    }
}
