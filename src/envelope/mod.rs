//! Envelope codec and verifier
//!
//! - `element`: decoding of fetched exchange-key and message elements, with
//!   field-name aliases and per-kind signed payloads
//! - `wire`: relay response shapes and the signed request bodies we post
//!
//! Decoding and verification are separate steps. A malformed element is an
//! [`ElementError`]; an element that decodes but fails [`Element::verify`] is
//! simply discarded by the caller.

use thiserror::Error;

pub mod element;
pub mod wire;

pub use element::{Element, ExchangeKeyOffer, ExchangeKeyResponse, MessageElement};
pub use wire::{
    ExchangeKeyPost, FetchRequest, FetchResponse, MessagePost, PostKeyResponse,
    PostMessageResponse, RelayResponse,
};

/// A single element that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElementError {
    /// The element is not a JSON object
    #[error("malformed element: expected a JSON object")]
    NotAnObject,

    /// No accepted alias of a required field is present
    #[error("malformed element: missing field `{0}`")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape or length
    #[error("malformed element: field `{field}` {reason}")]
    InvalidField {
        /// Canonical field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// Result type for element decoding
pub type ElementResult<T> = Result<T, ElementError>;
