//! Transport layer abstraction
//!
//! The relay speaks four request kinds: a reachability ping, a signed
//! fetch, and the two signed posts. Implementations:
//! - `HttpTransport`: blocking HTTP with JSON bodies
//! - `memory::MemoryRelay`: an in-process relay for tests
//!
//! Every call returns the relay's typed response only when its status word
//! says success; anything else surfaces as [`TransportError::Rejected`].

use thiserror::Error;

use crate::envelope::{
    ExchangeKeyPost, FetchRequest, FetchResponse, MessagePost, PostKeyResponse,
    PostMessageResponse, RelayResponse,
};

pub mod http;
pub mod memory;

pub use http::HttpTransport;
pub use memory::MemoryRelay;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The relay did not answer in time
    #[error("Request timed out")]
    Timeout,

    /// Could not reach the relay at all
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The relay answered but refused the request
    #[error("Rejected by relay ({status}): {message}")]
    Rejected {
        /// Status word or HTTP status code
        status: String,
        /// Relay-provided detail
        message: String,
    },

    /// The relay's answer did not parse
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl TransportError {
    /// Whether the relay stopped answering in time
    ///
    /// Only a timeout takes the engine offline; a refused connection is
    /// reported like any other failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Blocking relay client
///
/// Calls are made from the sync worker and the foreground thread alike, so
/// implementations must be shareable.
pub trait Transport: Send + Sync {
    /// Cheap reachability check
    fn ping(&self) -> TransportResult<()>;

    /// Fetch elements addressed to us from the given senders
    fn fetch(&self, request: &FetchRequest) -> TransportResult<FetchResponse>;

    /// Post an exchange-key offer or response
    fn post_exchange_key(&self, post: &ExchangeKeyPost) -> TransportResult<PostKeyResponse>;

    /// Post an encrypted message
    fn post_message(&self, post: &MessagePost) -> TransportResult<PostMessageResponse>;
}

/// Pass a relay response through only if its status is success
pub fn accept<R: RelayResponse>(response: R) -> TransportResult<R> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Rejected {
            status: response.status().to_string(),
            message: response.message().to_string(),
        })
    }
}
