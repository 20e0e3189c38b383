//! HTTP transport to a relay server
//!
//! JSON over blocking `reqwest`. The ping uses the short ping timeout;
//! every other request uses the request timeout.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::trace;

use crate::config::Settings;
use crate::envelope::{
    ExchangeKeyPost, FetchRequest, FetchResponse, MessagePost, PostKeyResponse,
    PostMessageResponse, RelayResponse,
};

use super::{accept, Transport, TransportError, TransportResult};

/// Relay client over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    ping_url: String,
    fetch_url: String,
    exchange_key_url: String,
    message_url: String,
    ping_timeout: Duration,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build a client for the relay described by `settings`
    pub fn new(settings: &Settings) -> TransportResult<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            ping_url: settings.url(&settings.ping_path),
            fetch_url: settings.url(&settings.fetch_path),
            exchange_key_url: settings.url(&settings.exchange_key_path),
            message_url: settings.url(&settings.message_path),
            ping_timeout: settings.ping_timeout(),
            request_timeout: settings.request_timeout(),
        })
    }

    fn send(&self, request: RequestBuilder, timeout: Duration) -> TransportResult<Response> {
        let response = request.timeout(timeout).send().map_err(map_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // Prefer the relay's own status/message when the body carries one
        let body = response.text().unwrap_or_default();
        Err(match serde_json::from_str::<StatusOnly>(&body) {
            Ok(parsed) => TransportError::Rejected {
                status: parsed.status,
                message: parsed.message,
            },
            Err(_) => TransportError::Rejected {
                status: status.as_u16().to_string(),
                message: body,
            },
        })
    }

    fn post_json<B, R>(&self, url: &str, body: &B) -> TransportResult<R>
    where
        B: serde::Serialize,
        R: DeserializeOwned + RelayResponse,
    {
        trace!(url, "relay post");
        let response = self.send(self.client.post(url).json(body), self.request_timeout)?;
        let parsed: R = response
            .json()
            .map_err(|e| TransportError::InvalidData(e.to_string()))?;
        accept(parsed)
    }
}

impl Transport for HttpTransport {
    fn ping(&self) -> TransportResult<()> {
        self.send(self.client.get(&self.ping_url), self.ping_timeout)
            .map(|_| ())
    }

    fn fetch(&self, request: &FetchRequest) -> TransportResult<FetchResponse> {
        self.post_json(&self.fetch_url, request)
    }

    fn post_exchange_key(&self, post: &ExchangeKeyPost) -> TransportResult<PostKeyResponse> {
        self.post_json(&self.exchange_key_url, post)
    }

    fn post_message(&self, post: &MessagePost) -> TransportResult<PostMessageResponse> {
        self.post_json(&self.message_url, post)
    }
}

#[derive(Deserialize)]
struct StatusOnly {
    status: String,
    #[serde(default)]
    message: String,
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() || e.is_request() {
        TransportError::ConnectionFailed(e.to_string())
    } else {
        TransportError::InvalidData(e.to_string())
    }
}
