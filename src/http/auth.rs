//! Credential hook consulted by the client before every attempt.
//!
//! The client owns its provider; nothing here is global.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::HeaderValue;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Value for the `Authorization` header, or `None` to send no credentials.
    async fn authorization(&self) -> Result<Option<HeaderValue>>;
}

/// Sends no credentials.
pub struct Anonymous;

#[async_trait]
impl CredentialProvider for Anonymous {
    async fn authorization(&self) -> Result<Option<HeaderValue>> {
        Ok(None)
    }
}

/// A fixed bearer token read from configuration.
pub struct StaticToken {
    value: HeaderValue,
}

impl StaticToken {
    pub fn bearer(token: &str) -> Result<Self> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Token contains characters not allowed in an HTTP header")?;
        value.set_sensitive(true);
        Ok(Self { value })
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn authorization(&self) -> Result<Option<HeaderValue>> {
        Ok(Some(self.value.clone()))
    }
}
