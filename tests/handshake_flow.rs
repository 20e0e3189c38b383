//! Two clients talking through one in-memory relay

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay_chat::crypto::{EphemeralKeypair, Identity, PublicKey, SymmetricKey};
use relay_chat::envelope::{ExchangeKeyPost, MessagePost};
use relay_chat::model::{Contact, Direction};
use relay_chat::{
    Client, ClientError, ConnectionState, Event, MemoryRelay, MemoryStore, SessionStore,
    SqliteStore, SyncEngine, Transport,
};

const POLL: Duration = Duration::from_millis(10);

struct Peer {
    seed: [u8; 32],
    client: Client,
    store: Arc<MemoryStore>,
    engine: SyncEngine,
}

impl Peer {
    fn new(relay: &MemoryRelay) -> Self {
        let seed: [u8; 32] = rand::random();
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(
            Identity::from_seed(&seed),
            store.clone(),
            Arc::new(relay.clone()),
            100,
        )
        .unwrap();
        let engine = client.sync_engine(POLL);
        Peer {
            seed,
            client,
            store,
            engine,
        }
    }

    fn identity(&self) -> Identity {
        Identity::from_seed(&self.seed)
    }

    fn key(&self) -> PublicKey {
        *self.client.public_key()
    }

    fn add(&self, name: &str, other: &Peer) -> Contact {
        self.client
            .add_contact(name, &other.key().to_base64())
            .unwrap()
    }

    fn tick(&self) -> ConnectionState {
        self.engine.tick()
    }

    fn events(&self) -> Vec<Event> {
        self.client
            .events_since(0)
            .into_iter()
            .map(|entry| entry.event)
            .collect()
    }
}

fn offers_from(relay: &MemoryRelay, sender: PublicKey) -> Vec<ExchangeKeyPost> {
    relay
        .exchange_key_posts()
        .into_iter()
        .filter(|post| post.sender_key == sender && post.initial_key.is_none())
        .collect()
}

fn responses_from(relay: &MemoryRelay, sender: PublicKey) -> Vec<ExchangeKeyPost> {
    relay
        .exchange_key_posts()
        .into_iter()
        .filter(|post| post.sender_key == sender && post.initial_key.is_some())
        .collect()
}

/// Alice offers, Bob answers, Alice completes
fn handshake(relay: &MemoryRelay) -> (Peer, Peer, Contact, Contact) {
    let alice = Peer::new(relay);
    let bob = Peer::new(relay);
    let bob_at_alice = alice.add("bob", &bob);
    let alice_at_bob = bob.add("alice", &alice);

    alice.tick();
    bob.tick();
    alice.tick();
    (alice, bob, bob_at_alice, alice_at_bob)
}

#[test]
fn test_new_contact_gets_exactly_one_offer() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);
    let contact = alice.add("bob", &bob);

    assert_eq!(alice.tick(), ConnectionState::Connected);
    alice.tick();
    alice.tick();

    let offers = offers_from(&relay, alice.key());
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].recipient_key, bob.key());
    assert!(alice.events().contains(&Event::OfferPosted(contact.id)));
    assert_eq!(alice.store.pending_offers().unwrap().len(), 1);
}

#[test]
fn test_full_handshake_derives_equal_keys() {
    let relay = MemoryRelay::new();
    let (alice, bob, bob_at_alice, alice_at_bob) = handshake(&relay);

    let alice_keys = alice.store.session_keys(bob_at_alice.id).unwrap();
    let bob_keys = bob.store.session_keys(alice_at_bob.id).unwrap();
    assert_eq!(alice_keys.len(), 1);
    assert_eq!(bob_keys.len(), 1);
    assert_eq!(alice_keys[0].key, bob_keys[0].key);

    // Bob answered instead of making his own offer
    assert!(offers_from(&relay, bob.key()).is_empty());
    assert_eq!(responses_from(&relay, bob.key()).len(), 1);

    assert!(alice.events().contains(&Event::HandshakeCompleted(bob_at_alice.id)));
    assert!(bob.events().contains(&Event::HandshakeCompleted(alice_at_bob.id)));
    assert!(alice.store.pending_offers().unwrap().is_empty());
}

#[test]
fn test_messages_round_trip_both_ways() {
    let relay = MemoryRelay::new();
    let (alice, bob, bob_at_alice, alice_at_bob) = handshake(&relay);
    bob.tick();

    let sent = alice.client.send_message(bob_at_alice.id, "hello bob").unwrap();
    assert_eq!(sent.direction, Direction::Sent);
    assert_eq!(sent.plaintext.as_deref(), Some("hello bob"));

    bob.tick();
    let received = bob.client.messages(alice_at_bob.id).unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].direction, Direction::Received);
    assert_eq!(received[0].plaintext.as_deref(), Some("hello bob"));
    assert_eq!(received[0].signature, sent.signature);
    assert!(bob.events().contains(&Event::NewMessage(alice_at_bob.id)));

    bob.client.send_message(alice_at_bob.id, "hi alice").unwrap();
    alice.tick();
    let conversation = alice.client.messages(bob_at_alice.id).unwrap();
    let texts: Vec<_> = conversation
        .iter()
        .map(|m| (m.direction, m.plaintext.clone()))
        .collect();
    assert_eq!(
        texts,
        vec![
            (Direction::Sent, Some("hello bob".to_string())),
            (Direction::Received, Some("hi alice".to_string())),
        ]
    );

    // Refetching the same elements stores nothing new
    bob.tick();
    assert_eq!(bob.client.messages(alice_at_bob.id).unwrap().len(), 2);
}

#[test]
fn test_forged_message_is_dropped() {
    let relay = MemoryRelay::new();
    let (alice, bob, _, alice_at_bob) = handshake(&relay);
    let mallory = Identity::generate();

    let text = "bm90IGEgcmVhbCBjaXBoZXJ0ZXh0";
    relay.inject_message(
        alice.key(),
        bob.key(),
        json!({
            "sender_key": alice.key(),
            "signature": mallory.sign(text.as_bytes()),
            "timestamp": "2026-01-01T00:00:00.000000Z",
            "nonce": "00112233445566778899aabbccddeeff",
            "encrypted_text": text,
        }),
    );

    bob.tick();
    assert!(bob.client.messages(alice_at_bob.id).unwrap().is_empty());
    assert!(!bob
        .events()
        .iter()
        .any(|e| matches!(e, Event::NewMessage(_))));
}

#[test]
fn test_undecryptable_message_is_kept_without_plaintext() {
    let relay = MemoryRelay::new();
    let (alice, bob, _, alice_at_bob) = handshake(&relay);

    let stray = SymmetricKey::from_bytes([7u8; 32]);
    let post = MessagePost::seal(&alice.identity(), bob.key(), &stray, "lost").unwrap();
    relay.post_message(&post).unwrap();

    bob.tick();
    let messages = bob.client.messages(alice_at_bob.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, None);
    assert_eq!(messages[0].ciphertext, post.encrypted_text);
}

#[test]
fn test_respond_step_answers_once() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);
    alice.add("bob", &bob);
    bob.add("alice", &alice);

    alice.tick();
    bob.tick();
    bob.tick();
    bob.tick();

    assert_eq!(responses_from(&relay, bob.key()).len(), 1);
    assert!(offers_from(&relay, bob.key()).is_empty());
}

#[test]
fn test_repeated_response_completes_once() {
    let relay = MemoryRelay::new();
    let (alice, _bob, bob_at_alice, _) = handshake(&relay);

    // The relay serves Bob's response on every fetch
    alice.tick();
    alice.tick();

    assert_eq!(alice.store.session_keys(bob_at_alice.id).unwrap().len(), 1);
    let completions = alice
        .events()
        .into_iter()
        .filter(|e| *e == Event::HandshakeCompleted(bob_at_alice.id))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(offers_from(&relay, alice.key()).len(), 1);
}

#[test]
fn test_timeout_demotes_then_reconnects() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);
    alice.add("bob", &bob);

    assert_eq!(alice.tick(), ConnectionState::Connected);
    assert!(alice.client.is_connected());

    relay.set_timing_out(true);
    assert_eq!(alice.tick(), ConnectionState::Disconnected);
    assert!(!alice.client.is_connected());
    assert!(alice.events().contains(&Event::ConnectivityChanged(false)));

    // Probing keeps failing while the relay is down
    assert_eq!(alice.tick(), ConnectionState::Disconnected);

    relay.set_timing_out(false);
    assert_eq!(alice.tick(), ConnectionState::Connected);
    let reconnects = alice
        .events()
        .into_iter()
        .filter(|e| *e == Event::ConnectivityChanged(true))
        .count();
    assert_eq!(reconnects, 2);
}

#[test]
fn test_refused_connection_keeps_engine_connected() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);
    alice.add("bob", &bob);

    assert_eq!(alice.tick(), ConnectionState::Connected);

    relay.set_offline(true);
    assert_eq!(alice.tick(), ConnectionState::Connected);
    assert!(alice.client.is_connected());
    assert!(!alice.events().contains(&Event::ConnectivityChanged(false)));
    let failures: Vec<_> = alice
        .client
        .events_since(0)
        .into_iter()
        .filter(|entry| matches!(entry.event, Event::OperationFailed(_)))
        .collect();
    assert!(!failures.is_empty());
    assert!(failures.iter().all(|entry| entry.title == "Bad Response"));

    relay.set_offline(false);
    assert_eq!(alice.tick(), ConnectionState::Connected);
}

#[test]
fn test_rejected_response_does_not_block_other_offers() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);
    let carol = Peer::new(&relay);
    let bob_at_alice = alice.add("bob", &bob);
    let carol_at_alice = alice.add("carol", &carol);
    bob.add("alice", &alice);
    carol.add("alice", &alice);

    bob.tick();
    carol.tick();
    relay.refuse_posts_to(bob.key());

    assert_eq!(alice.tick(), ConnectionState::Connected);

    assert!(alice.store.session_keys(bob_at_alice.id).unwrap().is_empty());
    assert_eq!(alice.store.session_keys(carol_at_alice.id).unwrap().len(), 1);

    let unmatched = alice.store.unmatched_exchange_keys().unwrap();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].contact_id, bob_at_alice.id);

    let responses = responses_from(&relay, alice.key());
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].recipient_key, carol.key());
}

#[test]
fn test_message_sealed_before_key_arrives_is_opened_later() {
    let relay = MemoryRelay::new();
    let bob = Peer::new(&relay);
    let alice = Identity::generate();
    let alice_at_bob = bob
        .client
        .add_contact("alice", &alice.public_key().to_base64())
        .unwrap();

    bob.tick();
    let pending = bob.store.pending_offers().unwrap();
    assert_eq!(pending.len(), 1);
    let bob_offer = *pending[0].keypair.public_key();

    // Alice answers out of order: the message lands before her response
    let ephemeral = EphemeralKeypair::generate();
    let key = ephemeral.diffie_hellman(&bob_offer).to_session_key();
    let post = MessagePost::seal(&alice, bob.key(), &key, "early").unwrap();
    relay.post_message(&post).unwrap();

    bob.tick();
    let messages = bob.client.messages(alice_at_bob.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, None);

    let response = ExchangeKeyPost::new(&alice, bob.key(), *ephemeral.public_key(), Some(bob_offer));
    relay.post_exchange_key(&response).unwrap();

    bob.tick();
    assert!(bob.client.has_session_key(alice_at_bob.id).unwrap());
    let messages = bob.client.messages(alice_at_bob.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext.as_deref(), Some("early"));
}

#[test]
fn test_rejected_offer_does_not_block_other_contacts() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);
    let carol = Peer::new(&relay);
    alice.add("bob", &bob);
    let carol_at_alice = alice.add("carol", &carol);
    relay.refuse_posts_to(bob.key());

    assert_eq!(alice.tick(), ConnectionState::Connected);

    let offers = offers_from(&relay, alice.key());
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].recipient_key, carol.key());
    assert!(alice.events().contains(&Event::OfferPosted(carol_at_alice.id)));
    assert!(alice
        .events()
        .iter()
        .any(|e| matches!(e, Event::OperationFailed(_))));

    // Only Carol's offer is pending, so Bob is retried next cycle
    let pending = alice.store.pending_offers().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].contact_id, carol_at_alice.id);
}

#[test]
fn test_send_preconditions() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);
    let contact = alice.add("bob", &bob);

    assert_eq!(
        alice.client.send_message(contact.id, "hi"),
        Err(ClientError::NotConnected)
    );

    alice.tick();
    assert_eq!(
        alice.client.send_message(contact.id, "hi"),
        Err(ClientError::NoSessionKey("bob".to_string()))
    );
    assert_eq!(
        alice.client.send_message(contact.id + 100, "hi"),
        Err(ClientError::UnknownContact((contact.id + 100).to_string()))
    );
    assert_eq!(
        alice.client.send_message(contact.id, ""),
        Err(ClientError::EmptyMessage)
    );
    assert_eq!(
        alice.client.send_to_selected("hi"),
        Err(ClientError::NoContactSelected)
    );
    assert!(relay.message_posts().is_empty());
}

#[test]
fn test_send_to_selected_contact() {
    let relay = MemoryRelay::new();
    let (mut alice, bob, _, alice_at_bob) = handshake(&relay);

    let selected = alice.client.select_contact("bob").unwrap();
    alice.client.send_to_selected("via selection").unwrap();
    assert_eq!(alice.client.selected().unwrap(), Some(selected));

    bob.tick();
    let received = bob.client.messages(alice_at_bob.id).unwrap();
    assert_eq!(received[0].plaintext.as_deref(), Some("via selection"));
}

#[test]
fn test_add_contact_rejects_bad_input() {
    let relay = MemoryRelay::new();
    let alice = Peer::new(&relay);
    let bob = Peer::new(&relay);

    assert_eq!(
        alice.client.add_contact("  ", &bob.key().to_base64()),
        Err(ClientError::EmptyName)
    );
    assert!(matches!(
        alice.client.add_contact("bob", "not-a-key"),
        Err(ClientError::Crypto(_))
    ));

    alice.add("bob", &bob);
    assert!(matches!(
        alice.client.add_contact("bob again", &bob.key().to_base64()),
        Err(ClientError::Store(_))
    ));
    assert_eq!(alice.client.contacts().unwrap().len(), 1);
}

#[test]
fn test_pending_offer_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alice.db");
    let relay = MemoryRelay::new();
    let bob = Peer::new(&relay);

    let identity = Identity::generate();
    let alice_key = *identity.public_key();
    let identity_bytes = identity.to_bytes();
    let bob_at_alice = {
        let store = Arc::new(SqliteStore::new(&db).unwrap());
        let client = Client::new(identity, store, Arc::new(relay.clone()), 100).unwrap();
        let contact = client.add_contact("bob", &bob.key().to_base64()).unwrap();
        client.sync_engine(POLL).tick();
        contact
    };
    assert_eq!(offers_from(&relay, alice_key).len(), 1);

    bob.client
        .add_contact("alice", &alice_key.to_base64())
        .unwrap();
    bob.tick();
    assert_eq!(responses_from(&relay, bob.key()).len(), 1);

    let identity = Identity::from_bytes(&identity_bytes).unwrap();
    let store = Arc::new(SqliteStore::new(&db).unwrap());
    assert_eq!(store.pending_offers().unwrap().len(), 1);
    let client = Client::new(identity, store.clone(), Arc::new(relay.clone()), 100).unwrap();
    client.sync_engine(POLL).tick();

    assert!(client.has_session_key(bob_at_alice.id).unwrap());
    assert!(store.pending_offers().unwrap().is_empty());
    // The restored offer was answered, so no second offer went out
    assert_eq!(offers_from(&relay, alice_key).len(), 1);
}
