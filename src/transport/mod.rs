//! Transport trait between the publish engine and the broker
//!
//! The engine builds a complete request and interprets the raw response;
//! implementations only move bytes. `HttpTransport` is the production
//! implementation; tests plug in scripted transports.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod http;

pub use http::{HttpConfig, HttpTransport};

/// Correlation header sent with every publish request
pub const FLOW_ID_HEADER: &str = "X-Flow-Id";

/// A fully-formed publish request
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Path relative to the broker base URL, e.g. `/event-types/x/events`
    pub path: String,

    /// Correlation id for this publish call
    pub flow_id: String,

    /// Bearer credential, if a token provider is configured
    pub token: Option<String>,

    /// Body content type
    pub content_type: &'static str,

    /// Encoded batch
    pub body: Bytes,
}

impl PublishRequest {
    /// Build the events path for an event type
    pub fn events_path(event_type: &str) -> String {
        format!("/event-types/{}/events", event_type)
    }
}

/// Raw broker response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers, lowercase names
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Bytes,
}

impl TransportResponse {
    /// Response with no headers
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Body as lossy UTF-8, for diagnostics
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Core trait for publish transports
///
/// Must be safe for concurrent use: independent publish calls share one
/// transport. Returns `Err` only when no response was received.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one publish request
    async fn send(&self, request: PublishRequest) -> Result<TransportResponse>;

    /// Transport name (e.g., "http")
    fn name(&self) -> &str;
}
