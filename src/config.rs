//! Publisher configuration
//!
//! Plain serde structs with defaults; where the values come from (file,
//! environment, flags) is up to the embedding application.

use serde::{Deserialize, Serialize};

use crate::error::{PublishError, Result};
use crate::retry::RetryConfig;
use crate::transport::HttpConfig;

/// Top-level publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Broker base URL, e.g. `https://broker.example.com`
    pub base_url: String,

    /// Retry budget and backoff
    pub retry: RetryConfig,

    /// HTTP client settings
    pub http: HttpConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl PublisherConfig {
    /// Configuration for a broker at `base_url` with default settings
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(PublishError::Config(format!(
                "Broker base URL must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if self.http.timeout_secs == 0 {
            return Err(PublishError::Config(
                "HTTP timeout must be greater than zero".to_string(),
            ));
        }
        self.retry.validate()
    }
}
