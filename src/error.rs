//! Error types for a3s-publish

use crate::types::{BatchItemResponse, PublishingStatus};
use thiserror::Error;

/// Errors that can occur while publishing a batch
#[derive(Debug, Error)]
pub enum PublishError {
    /// Network or IO-level failure before a response was received
    ///
    /// `premature_close` marks the one transport condition that is retried:
    /// the connection was closed before the broker finished responding.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        premature_close: bool,
    },

    /// Broker answered with a status that is neither success nor partial failure
    #[error("Broker returned HTTP {status}: {body}")]
    Server { status: u16, body: String },

    /// Events the broker has rendered a final verdict on
    ///
    /// `responses` carries every non-retryable item response accumulated
    /// across all attempts, at most one per event id. `unresolved` holds the
    /// last responses for events that were still retryable when the retry
    /// budget ran out.
    #[error(
        "{} event(s) rejected, {} unresolved: {}",
        rejected_count(.responses),
        count(.unresolved),
        summarize(.responses, .unresolved)
    )]
    Validation {
        responses: Vec<BatchItemResponse>,
        unresolved: Vec<BatchItemResponse>,
    },

    /// No binary schema could be resolved for the event type
    #[error("Schema resolution failed for event type '{event_type}': {reason}")]
    SchemaResolution { event_type: String, reason: String },

    /// Event could not be mapped to its wire form
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token provider failed to yield a credential
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The publish call was cancelled before it resolved
    #[error("Publish cancelled")]
    Cancelled,
}

impl PublishError {
    /// Creates a transport error that is not retried.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            premature_close: false,
        }
    }

    /// Creates a transport error for a connection closed mid-response.
    pub fn premature_close(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            premature_close: true,
        }
    }

    /// Creates a server error from an HTTP status and raw body.
    pub fn server(status: u16, body: impl Into<String>) -> Self {
        Self::Server {
            status,
            body: body.into(),
        }
    }

    /// Whether resending the whole batch may succeed
    ///
    /// True for 5xx broker responses and prematurely closed connections.
    /// Everything else, including validation outcomes, is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport {
                premature_close, ..
            } => *premature_close,
            Self::Server { status, .. } => (500..=599).contains(status),
            Self::Validation { .. }
            | Self::SchemaResolution { .. }
            | Self::Encoding(_)
            | Self::Serialization(_)
            | Self::Auth(_)
            | Self::Config(_)
            | Self::Cancelled => false,
        }
    }

    /// Responses for events that failed permanently
    ///
    /// Empty for anything but `Validation`. Submitted items that were carried
    /// in the accumulator are filtered out.
    pub fn rejected(&self) -> Vec<&BatchItemResponse> {
        match self {
            Self::Validation { responses, .. } => responses
                .iter()
                .filter(|r| r.publishing_status != PublishingStatus::Submitted)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<apache_avro::Error> for PublishError {
    fn from(e: apache_avro::Error) -> Self {
        Self::Encoding(format!("avro: {}", e))
    }
}

fn rejected_count(responses: &[BatchItemResponse]) -> usize {
    responses
        .iter()
        .filter(|r| r.publishing_status != PublishingStatus::Submitted)
        .count()
}

fn count(responses: &[BatchItemResponse]) -> usize {
    responses.len()
}

fn summarize(responses: &[BatchItemResponse], unresolved: &[BatchItemResponse]) -> String {
    responses
        .iter()
        .chain(unresolved)
        .filter(|r| r.publishing_status != PublishingStatus::Submitted)
        .map(|r| {
            let eid = r
                .eid
                .map(|id| id.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            match &r.detail {
                Some(detail) => format!("{} ({})", eid, detail),
                None => eid,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for publish operations
pub type Result<T> = std::result::Result<T, PublishError>;
