//! Bearer token providers
//!
//! Token acquisition (OAuth flows, refresh) lives outside this crate; the
//! publisher only asks for a credential once per publish call.

use async_trait::async_trait;

use crate::error::{PublishError, Result};

/// Trait for credential sources
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current bearer token, or `None` to send the request unauthenticated
    async fn token(&self) -> Result<Option<String>>;
}

/// A fixed token, e.g. from an environment variable or secret mount
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Create a provider for a non-empty token
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(PublishError::Auth("Token cannot be empty".to_string()));
        }
        Ok(Self { token })
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.token.clone()))
    }
}
