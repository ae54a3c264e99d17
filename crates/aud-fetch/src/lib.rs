//! aud-fetch
//!
//! Remote fetch boundary for scheduled audience updates.
//!
//! This crate performs the HTTP exchange and reports status, retry hint, and
//! body. It does **not** interpret status codes: deciding what 2xx, 429, or
//! anything else means for a queued update belongs to the engine.

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-exchange timeout, connect through last body byte.
    pub timeout_ms: u64,
    /// Bodies larger than this abort the read.
    pub max_response_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_response_bytes: 100_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// One POST to a buyer's update endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub uri: String,
    /// JSON text.
    pub body: String,
}

/// What came back. `body` is only read for 2xx responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    /// `Retry-After` in whole seconds, when present and numeric.
    pub retry_after_secs: Option<i64>,
    pub body: String,
}

impl FetchResponse {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            retry_after_secs: None,
            body: body.to_string(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after_secs: None,
            body: String::new(),
        }
    }

    pub fn rate_limited(retry_after_secs: Option<i64>) -> Self {
        Self {
            status: 429,
            retry_after_secs,
            body: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failures before a usable response was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, TLS, DNS, or protocol failure.
    Transport(String),
    /// The configured timeout elapsed.
    Timeout,
    /// The body exceeded `limit` bytes.
    ContentTooLarge { limit: usize },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(msg) => write!(f, "transport error: {msg}"),
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::ContentTooLarge { limit } => {
                write!(f, "response body exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Fetcher trait
// ---------------------------------------------------------------------------

/// Outbound update exchange.
///
/// Object-safe and `Send + Sync` so the engine can hold an
/// `Arc<dyn UpdateFetcher>` across spawned tasks.
#[async_trait::async_trait]
pub trait UpdateFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// HTTP fetcher backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpUpdateFetcher {
    http: reqwest::Client,
    max_response_bytes: usize,
}

impl HttpUpdateFetcher {
    pub fn new(cfg: &FetchConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| FetchError::Transport(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            max_response_bytes: cfg.max_response_bytes,
        })
    }
}

/// Parse a delta-seconds `Retry-After`. HTTP-date forms are not honoured.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
}

#[async_trait::async_trait]
impl UpdateFetcher for HttpUpdateFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut resp = self
            .http
            .post(&req.uri)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(req.body.clone())
            .send()
            .await?;

        let status = resp.status().as_u16();
        let retry_after_secs = parse_retry_after(resp.headers());

        if !resp.status().is_success() {
            tracing::debug!(uri = %req.uri, status, "update endpoint returned non-success");
            return Ok(FetchResponse {
                status,
                retry_after_secs,
                body: String::new(),
            });
        }

        let limit = self.max_response_bytes;
        if resp.content_length().is_some_and(|n| n > limit as u64) {
            return Err(FetchError::ContentTooLarge { limit });
        }

        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if buf.len() + chunk.len() > limit {
                return Err(FetchError::ContentTooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }

        // A garbled 2xx body is still a response; the parser judges it.
        let body = String::from_utf8_lossy(&buf).into_owned();
        Ok(FetchResponse {
            status,
            retry_after_secs,
            body,
        })
    }
}
