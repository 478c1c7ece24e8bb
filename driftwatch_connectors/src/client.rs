//! Provider API client construction.
//!
//! Units never build their own transport; they hold an
//! `ApiClientFactory` and ask it for a fresh configured client at the
//! start of each invocation, keeping credentials and transport policy
//! in one place.

use std::time::Duration;

use driftwatch_core::{Error, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_base: String,
    pub api_token: String,
}

impl ApiConfig {
    pub fn new(api_base: impl Into<String>, api_token: impl Into<String>) -> Result<Self> {
        let api_base = api_base.into();
        if api_base.trim().is_empty() {
            return Err(Error::InvalidInput("api_base is empty".to_string()));
        }
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(Error::InvalidInput("api_token is empty".to_string()));
        }
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    /// Read `DRIFTWATCH_API_BASE` / `DRIFTWATCH_API_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let api_base = std::env::var("DRIFTWATCH_API_BASE")
            .map_err(|_| Error::InvalidInput("DRIFTWATCH_API_BASE is not set".to_string()))?;
        let api_token = std::env::var("DRIFTWATCH_API_TOKEN")
            .map_err(|_| Error::InvalidInput("DRIFTWATCH_API_TOKEN is not set".to_string()))?;
        Self::new(api_base, api_token)
    }
}

/// Builds a configured HTTP client per unit invocation.
#[derive(Clone)]
pub struct ApiClientFactory {
    config: ApiConfig,
}

impl ApiClientFactory {
    pub fn new(config: ApiConfig) -> Self {
        Self { config }
    }

    pub fn api_base(&self) -> &str {
        &self.config.api_base
    }

    pub fn client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let auth = format!("Bearer {}", self.config.api_token);
        let mut auth = HeaderValue::from_str(&auth)
            .map_err(|e| Error::backend("invalid auth header", e))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::backend("build http client", e))
    }
}

/// Classify a transport error: timeouts and connection failures are
/// retryable, everything else is not.
pub fn fetch_error(context: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::transient(context, e)
    } else {
        Error::backend(context, e)
    }
}
