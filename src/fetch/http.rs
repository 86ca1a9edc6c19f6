//! # HTTP Fetcher
//!
//! Range queries over the backend's REST surface. One GET per query,
//! topic in the path, narrowing as query-string pairs, records in a
//! `{ success, data, error }` envelope.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{EngineError, EngineResult, FetchError};
use crate::fetch::{FetchResult, Fetcher, QueryParams};

/// HTTP fetcher configuration
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Base URL of the records API
    pub base_url: String,

    /// Bearer token sent with every request
    pub auth_token: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpFetcherConfig {
    /// Config for a given base URL with default timeout
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout: Duration::from_secs(15),
        }
    }

    /// Attach a bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self::new("http://localhost:4000")
    }
}

/// Wire envelope for range query responses
#[derive(Debug, Deserialize)]
struct FetchEnvelope {
    success: bool,
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Backend range query client
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpFetcherConfig,
}

impl HttpFetcher {
    /// Build a fetcher, constructing the underlying HTTP client
    pub fn new(config: HttpFetcherConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Endpoint for a topic's records
    fn endpoint(&self, topic: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), topic)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, params: &QueryParams) -> Result<FetchResult, FetchError> {
        let mut request = self
            .client
            .get(self.endpoint(&params.topic))
            .query(&params.query_pairs());
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(format!(
                "unexpected status {} for topic '{}'",
                status, params.topic
            )));
        }

        let envelope: FetchEnvelope = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        if !envelope.success {
            return Err(FetchError::Backend(
                envelope
                    .error
                    .unwrap_or_else(|| "backend reported failure".to_string()),
            ));
        }

        Ok(FetchResult::new(envelope.data))
    }
}
