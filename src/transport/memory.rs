//! In-process relay for tests
//!
//! Behaves like the real relay as far as a client can tell: posts are
//! signature-checked and stored per recipient, fetches are signature-checked
//! and return every stored element from the requested senders. Clones share
//! one relay, so two clients can talk through it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::crypto::PublicKey;
use crate::envelope::wire::{PostKeyData, PostMessageData};
use crate::envelope::{
    ExchangeKeyPost, FetchRequest, FetchResponse, MessagePost, PostKeyResponse,
    PostMessageResponse,
};

use super::{Transport, TransportError, TransportResult};

/// Stored element and its addressing
struct Stored {
    sender: PublicKey,
    recipient: PublicKey,
    element: Value,
}

#[derive(Default)]
struct RelayState {
    exchange_keys: Vec<Stored>,
    messages: Vec<Stored>,
    key_posts: Vec<ExchangeKeyPost>,
    message_posts: Vec<MessagePost>,
    refused_recipients: Vec<PublicKey>,
    offline: bool,
    timing_out: bool,
}

/// Shared in-memory relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Empty relay, online
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse connections until set back to `false`
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Time out every request until set back to `false`
    pub fn set_timing_out(&self, timing_out: bool) {
        self.state().timing_out = timing_out;
    }

    /// Answer posts addressed to `recipient` with an error status
    pub fn refuse_posts_to(&self, recipient: PublicKey) {
        self.state().refused_recipients.push(recipient);
    }

    /// Store a raw message element as if a sender had posted it
    pub fn inject_message(&self, sender: PublicKey, recipient: PublicKey, element: Value) {
        self.state().messages.push(Stored {
            sender,
            recipient,
            element,
        });
    }

    /// Store a raw exchange-key element as if a sender had posted it
    pub fn inject_exchange_key(&self, sender: PublicKey, recipient: PublicKey, element: Value) {
        self.state().exchange_keys.push(Stored {
            sender,
            recipient,
            element,
        });
    }

    /// Every accepted exchange-key post, in order
    pub fn exchange_key_posts(&self) -> Vec<ExchangeKeyPost> {
        self.state().key_posts.clone()
    }

    /// Every accepted message post, in order
    pub fn message_posts(&self) -> Vec<MessagePost> {
        self.state().message_posts.clone()
    }

    fn check_reachable(&self) -> TransportResult<()> {
        let state = self.state();
        if state.timing_out {
            return Err(TransportError::Timeout);
        }
        if state.offline {
            return Err(TransportError::ConnectionFailed(
                "relay is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn check_post(
        &self,
        signed: bool,
        recipient: &PublicKey,
    ) -> TransportResult<()> {
        self.check_reachable()?;
        if !signed {
            return Err(rejected("invalid signature"));
        }
        if self.state().refused_recipients.contains(recipient) {
            return Err(rejected("recipient refused"));
        }
        Ok(())
    }
}

impl Transport for MemoryRelay {
    fn ping(&self) -> TransportResult<()> {
        self.check_reachable()
    }

    fn fetch(&self, request: &FetchRequest) -> TransportResult<FetchResponse> {
        self.check_reachable()?;
        if !request.verify() {
            return Err(rejected("invalid signature"));
        }

        let state = self.state();
        let select = |stored: &[Stored]| -> Vec<Value> {
            stored
                .iter()
                .filter(|s| s.recipient == request.verification_key)
                .filter(|s| request.sender_keys.contains(&s.sender))
                .map(|s| s.element.clone())
                .collect()
        };

        Ok(FetchResponse::success(
            select(&state.exchange_keys),
            select(&state.messages),
        ))
    }

    fn post_exchange_key(&self, post: &ExchangeKeyPost) -> TransportResult<PostKeyResponse> {
        self.check_post(post.verify(), &post.recipient_key)?;

        let timestamp = Utc::now();
        let mut element = json!({
            "sender_key": post.sender_key,
            "exchange_key": post.exchange_key,
            "signature": post.signature,
            "timestamp": format_time(timestamp),
        });
        if let Some(initial_key) = post.initial_key {
            element["initial_key"] = json!(initial_key);
        }

        let mut state = self.state();
        state.exchange_keys.push(Stored {
            sender: post.sender_key,
            recipient: post.recipient_key,
            element,
        });
        state.key_posts.push(post.clone());

        Ok(PostKeyResponse {
            status: "success".to_string(),
            message: String::new(),
            data: PostKeyData { timestamp },
        })
    }

    fn post_message(&self, post: &MessagePost) -> TransportResult<PostMessageResponse> {
        self.check_post(post.verify(), &post.recipient_key)?;

        let timestamp = Utc::now();
        let element = json!({
            "sender_key": post.sender_key,
            "signature": post.signature,
            "timestamp": format_time(timestamp),
            "nonce": post.nonce,
            "encrypted_text": post.encrypted_text,
        });

        let mut state = self.state();
        state.messages.push(Stored {
            sender: post.sender_key,
            recipient: post.recipient_key,
            element,
        });
        state.message_posts.push(post.clone());

        Ok(PostMessageResponse {
            status: "success".to_string(),
            message: String::new(),
            data: PostMessageData {
                nonce: post.nonce.clone(),
                timestamp,
            },
        })
    }
}

fn rejected(message: &str) -> TransportError {
    TransportError::Rejected {
        status: "error".to_string(),
        message: message.to_string(),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EphemeralKeypair, Identity};
    use crate::envelope::Element;

    #[test]
    fn test_posted_key_is_fetched_by_recipient() {
        let relay = MemoryRelay::new();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let keypair = EphemeralKeypair::generate();

        let post = ExchangeKeyPost::new(&alice, *bob.public_key(), *keypair.public_key(), None);
        relay.post_exchange_key(&post).unwrap();

        let response = relay
            .fetch(&FetchRequest::new(&bob, vec![*alice.public_key()]))
            .unwrap();
        let elements = response.elements();
        assert_eq!(elements.len(), 1);
        assert!(elements[0].verify());
        match &elements[0] {
            Element::ExchangeKeyOffer(offer) => {
                assert_eq!(offer.exchange_key, *keypair.public_key());
                assert_eq!(offer.sender_key, *alice.public_key());
            }
            other => panic!("expected an offer, got {:?}", other),
        }

        // Not addressed to Alice, and Bob asked only for Alice's elements
        let own = relay
            .fetch(&FetchRequest::new(&alice, vec![*bob.public_key()]))
            .unwrap();
        assert!(own.elements().is_empty());
    }

    #[test]
    fn test_unsigned_post_is_rejected() {
        let relay = MemoryRelay::new();
        let alice = Identity::generate();
        let bob = Identity::generate();

        let mut post = ExchangeKeyPost::new(
            &alice,
            *bob.public_key(),
            *EphemeralKeypair::generate().public_key(),
            None,
        );
        post.signature = bob.sign(post.exchange_key.as_bytes());

        assert!(matches!(
            relay.post_exchange_key(&post),
            Err(TransportError::Rejected { .. })
        ));
        assert!(relay.exchange_key_posts().is_empty());
    }

    #[test]
    fn test_offline_and_timeout_toggles() {
        let relay = MemoryRelay::new();
        assert!(relay.ping().is_ok());

        relay.set_offline(true);
        assert!(matches!(relay.ping(), Err(TransportError::ConnectionFailed(_))));

        relay.set_timing_out(true);
        assert_eq!(relay.ping(), Err(TransportError::Timeout));

        relay.set_offline(false);
        relay.set_timing_out(false);
        assert!(relay.ping().is_ok());
    }

    #[test]
    fn test_refused_recipient() {
        let relay = MemoryRelay::new();
        let alice = Identity::generate();
        let bob = Identity::generate();
        relay.refuse_posts_to(*bob.public_key());

        let post = ExchangeKeyPost::new(
            &alice,
            *bob.public_key(),
            *EphemeralKeypair::generate().public_key(),
            None,
        );
        assert!(matches!(
            relay.post_exchange_key(&post),
            Err(TransportError::Rejected { .. })
        ));
    }
}
