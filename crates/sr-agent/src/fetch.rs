//! Target fetching
//!
//! The actual HTTP fetch is behind the `Fetcher` trait so the dispatcher
//! can be driven with canned fetchers in tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Result of a successful fetch
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// HTTP status returned by the target
    pub status_code: u16,
    /// Response body
    pub body: String,
}

/// Fetch failures, all recovered locally by the dispatcher
#[derive(Debug, Error)]
pub enum FetchError {
    /// The target did not answer within the fetch timeout
    #[error("Request timed out")]
    Timeout,

    /// The request could not be completed (DNS, connection refused, ...)
    #[error("Request failed: {0}")]
    Request(String),

    /// The target answered with a non-2xx status
    #[error("Target returned status {0}")]
    BadStatus(u16),
}

/// Abstraction over the external fetch call
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the given URL and return status and body
    async fn fetch(&self, url: &str) -> Result<FetchOutcome, FetchError>;
}

/// HTTP fetcher backed by a shared reqwest client
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(FetchOutcome {
            status_code: status.as_u16(),
            body,
        })
    }
}
