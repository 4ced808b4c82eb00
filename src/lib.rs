//! # a3s-publish
//!
//! Batch publishing client for event-broker ingestion endpoints.
//!
//! ## Overview
//!
//! `a3s-publish` sends batches of typed events to a broker over HTTP, as
//! either a JSON array or an Avro binary batch, and keeps retrying the part
//! of a batch the broker did not settle. Events the broker accepted or
//! rejected at validation are never sent twice.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_publish::{Event, PublishOptions, Publisher, PublisherConfig};
//!
//! # async fn example() -> a3s_publish::Result<()> {
//! let publisher = Publisher::from_config(&PublisherConfig::new("https://broker.example.com"))?;
//!
//! let events = vec![
//!     Event::business(serde_json::json!({"order_id": "A-1", "total": 42})),
//!     Event::business(serde_json::json!({"order_id": "A-2", "total": 7})),
//! ];
//!
//! publisher
//!     .publish("order.created", events, &PublishOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry behavior
//!
//! - **2xx**: batch accepted
//! - **207 / 422**: per-event responses; accepted and validation-rejected
//!   events are settled, the rest is resent after backoff
//! - **5xx / connection closed mid-response**: the whole attempt is resent
//! - anything else fails the call immediately
//!
//! ## Architecture
//!
//! - **Publisher**: per-call retry state machine
//! - **Transport** trait: sends one encoded batch (`HttpTransport` over reqwest)
//! - **SchemaResolver** trait: binary schema lookup (`MemorySchemaRegistry`)
//! - **TokenProvider** trait: bearer credentials (`StaticTokenProvider`)
//! - **Event**: data-change, business or undefined event

pub mod auth;
pub mod classify;
pub mod codec;
pub mod config;
pub mod enrich;
pub mod error;
pub mod publisher;
pub mod retry;
pub mod schema;
pub mod transport;
pub mod types;

// Re-export core types
pub use auth::{StaticTokenProvider, TokenProvider};
pub use classify::{classify, Classification, Identified, ResponseLog};
pub use config::PublisherConfig;
pub use enrich::{enrich, enrich_all};
pub use error::{PublishError, Result};
pub use publisher::Publisher;
pub use retry::RetryConfig;
pub use schema::{MemorySchemaRegistry, ResolvedSchema, SchemaHint, SchemaResolver};
pub use transport::{HttpConfig, HttpTransport, PublishRequest, Transport, TransportResponse};
pub use types::{
    BatchItemResponse, DataOperation, Event, Metadata, PublishFormat, PublishOptions,
    PublishingStatus, Step,
};
