//! reqwest-backed HTTP transport

use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{PublishRequest, Transport, TransportResponse, FLOW_ID_HEADER};
use crate::error::{PublishError, Result};

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// User agent string
    pub user_agent: String,

    /// Idle pooled connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 5,
            user_agent: format!("a3s-publish/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 8,
        }
    }
}

/// HTTP transport posting batches to a broker base URL
///
/// Wraps a pooled `reqwest::Client`; clone freely, clones share the pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Build a transport for `base_url` (e.g. `https://broker.example.com`)
    pub fn new(base_url: impl Into<String>, config: &HttpConfig) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(PublishError::Config(
                "Broker base URL cannot be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| PublishError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Full URL for a request path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: PublishRequest) -> Result<TransportResponse> {
        let url = self.url(&request.path);

        let mut http_request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, request.content_type)
            .header(FLOW_ID_HEADER, &request.flow_id)
            .body(request.body);

        if let Some(token) = &request.token {
            http_request = http_request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = http_request.send().await.map_err(|e| classify_error(&url, e))?;

        let status = response.status().as_u16();
        let headers = extract_headers(response.headers());
        let body = response.bytes().await.map_err(|e| classify_error(&url, e))?;

        tracing::debug!(
            url = %url,
            status,
            flow_id = %request.flow_id,
            bytes = body.len(),
            "Broker responded"
        );

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Map a reqwest error, flagging connections closed mid-response
fn classify_error(url: &str, e: reqwest::Error) -> PublishError {
    let message = format!("{}: {}", url, e);
    if is_premature_close(&e) {
        PublishError::premature_close(message)
    } else {
        PublishError::transport(message)
    }
}

fn is_premature_close(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = e.source();
    while let Some(err) = source {
        let text = err.to_string().to_lowercase();
        if text.contains("connection closed before message completed")
            || text.contains("unexpected eof")
            || text.contains("connection reset")
        {
            return true;
        }
        source = err.source();
    }
    false
}

fn extract_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}
