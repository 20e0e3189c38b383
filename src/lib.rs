//! # relay-chat
//!
//! Terminal messaging client: end-to-end encrypted text through an untrusted
//! relay.
//!
//! ## Features
//!
//! - **Signed envelopes**: every element on the relay is Ed25519-signed by
//!   its sender and checked before use
//! - **Two-step key exchange** over X25519 between parties who only know
//!   each other's verification key
//! - **Authenticated encryption** of messages with ChaCha20-Poly1305
//! - **Background sync** on a plain OS thread, with a pluggable relay
//!   transport and session store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use relay_chat::{Client, Identity, MemoryRelay, MemoryStore};
//!
//! let relay = MemoryRelay::new();
//! let mut alice = Client::new(
//!     Identity::generate(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(relay.clone()),
//!     200,
//! )?;
//! println!("My address: {}", alice.public_key());
//!
//! let bob = alice.add_contact("bob", "<bob's 44-character key>")?;
//! alice.select_contact("bob")?;
//! alice.spawn_sync(Duration::from_secs(2));
//! // Once the handshake with bob has completed:
//! alice.send_message(bob.id, "hello")?;
//! # Ok::<(), relay_chat::ClientError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             PRESENTATION LAYER              │
//! │      line UI  |  Client intents  |  events  │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               PROTOCOL LAYER                │
//! │  Sync engine | Handshake engine | Envelopes │
//! └──────────┬──────────────────────┬───────────┘
//!            │                      │
//! ┌──────────▼──────────┐ ┌─────────▼───────────┐
//! │    CRYPTO LAYER     │ │    SESSION STORE    │
//! │ Ed25519 | X25519 |  │ │  SQLite | memory    │
//! │ ChaCha20-Poly1305   │ │                     │
//! └─────────────────────┘ └─────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              TRANSPORT LAYER                │
//! │           HTTP relay  |  in-memory          │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod events;
pub mod handshake;
pub mod model;
pub mod store;
pub mod sync;
pub mod transport;

// Re-export main types at crate root
pub use client::{Client, ClientError, ClientResult};
pub use config::{ConfigError, Settings};
pub use crypto::{CryptoError, CryptoResult, Identity, PublicKey, SignatureBytes};
pub use events::{Event, EventLog, LogEntry};
pub use store::{MemoryStore, SessionStore, SqliteStore, StoreError};
pub use sync::{ConnectionState, SyncEngine};
pub use transport::{HttpTransport, MemoryRelay, Transport, TransportError};
