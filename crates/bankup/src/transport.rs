//! Transport seam for manifest, signature bundle, and image fetches.
//!
//! The update engine consumes transport as a plain "GET path → status,
//! content type, body" capability so tests can substitute a canned
//! implementation. The production implementation wraps `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::OtaError;

/// Connection timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Result of a GET: status, declared content type, and the body bytes.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Whether this response is a usable `200` with the expected content
    /// type. A `None` expectation only checks the status.
    pub fn matches(&self, expected_content_type: Option<&str>) -> bool {
        if self.status != 200 {
            return false;
        }
        match expected_content_type {
            Some(expected) => self
                .content_type
                .as_deref()
                .map(|ct| ct == expected || ct.starts_with(&format!("{};", expected)))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// A simple GET capability.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<FetchResponse, OtaError>;
}

/// HTTP transport on `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    host: String,
}

impl HttpTransport {
    /// Create a transport rooted at a host base URL, e.g.
    /// `http://thingy.jp`.
    pub fn new(host: impl Into<String>) -> Result<Self, OtaError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(format!("bankup/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OtaError::Config(e.to_string()))?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<FetchResponse, OtaError> {
        let url = format!("{}{}", self.host, path);
        debug!(%url, "fetching");

        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        debug!(status, bytes = body.len(), "fetched");
        Ok(FetchResponse {
            status,
            content_type,
            body,
        })
    }
}
