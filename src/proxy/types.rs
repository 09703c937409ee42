//! Type definitions for the proxy module

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ========== Identifier Types ==========

/// Request ID for correlating logs, errors and diagnostic headers
#[nutype(derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new RequestId with a v7 UUID
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Identifier of one active streaming relay
#[nutype(derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef))]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Target URL for proxying
#[nutype(
    sanitize(trim),
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://")),
    derive(Clone, Debug, Display, PartialEq, Eq, Serialize, Deserialize, AsRef)
)]
pub struct TargetUrl(String);

/// Hex-encoded SHA-256 fingerprint identifying cache-equivalent requests
#[nutype(
    validate(predicate = |s: &str| s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())),
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef)
)]
pub struct CacheKey(String);

// ========== Constants ==========

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying the time the proxy spent on a request, in milliseconds
pub const PROXY_TIME_HEADER: &str = "x-proxy-time";

/// Default upstream timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default redirect cap
/// Longest per-request upstream timeout a caller may ask for
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default maximum size of an inbound proxy request body (30MB)
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 30 * 1024 * 1024;

/// Proxy configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Upstream timeout used when a request does not specify one
    pub request_timeout: Duration,
    /// Maximum number of redirects followed before failing
    pub max_redirects: usize,
    /// Global response cache toggle
    pub cache_enabled: bool,
    /// Time a cached response stays fresh
    pub cache_ttl: Duration,
    /// Entry count above which the oldest entries are evicted
    pub cache_max_entries: usize,
    /// Maximum inbound request size in bytes
    pub max_request_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            cache_max_entries: 1000,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

// ========== Wire Types ==========

/// Body of `POST /proxy` and `POST /proxy/stream`
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub method: Option<String>,
    pub body: Option<String>,
    /// Upstream timeout in seconds
    pub timeout: Option<f64>,
    pub cache: Option<bool>,
    pub follow_redirects: Option<bool>,
}

/// A validated outbound request, ready for dispatch
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: http::Method,
    pub url: TargetUrl,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub cache: Option<bool>,
}

impl OutboundRequest {
    /// Validate a wire request, applying configured defaults
    pub fn from_wire(request: ProxyRequest, config: &ProxyConfig) -> ProxyResult<Self> {
        let raw_url = request
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or(ProxyError::MissingTarget)?;
        let url = TargetUrl::try_new(raw_url.clone())
            .map_err(|_| ProxyError::InvalidTarget(raw_url))?;

        let method_str = request.method.unwrap_or_else(|| METHOD_GET.to_string());
        let method = http::Method::from_bytes(method_str.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ProxyError::InvalidRequest(format!("Invalid HTTP method: {method_str}")))?;

        let timeout = match request.timeout {
            Some(secs) => parse_timeout(secs)?,
            None => config.request_timeout,
        };

        Ok(Self {
            method,
            url,
            headers: request.headers,
            body: request.body.filter(|body| !body.is_empty()),
            timeout,
            follow_redirects: request.follow_redirects.unwrap_or(true),
            cache: request.cache,
        })
    }

    /// Case-insensitive lookup of a request header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Convert a caller-supplied timeout in seconds, rejecting values that are
/// not positive, not finite or above [`MAX_TIMEOUT`]
fn parse_timeout(secs: f64) -> ProxyResult<Duration> {
    let invalid = || {
        ProxyError::InvalidRequest(format!(
            "Timeout must be a positive number of seconds up to {}, got {secs}",
            MAX_TIMEOUT.as_secs()
        ))
    };

    if secs <= 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|timeout| *timeout <= MAX_TIMEOUT)
        .ok_or_else(invalid)
}

/// Normalized upstream response returned by `POST /proxy`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub cached: bool,
}

/// Common HTTP methods
pub const METHOD_GET: &str = "GET";

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing URL parameter")]
    MissingTarget,

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timeout after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Service credential required")]
    Forbidden,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Classify a reqwest failure into the proxy taxonomy
    pub fn from_transport(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::UpstreamTimeout(timeout)
        } else if error.is_builder() {
            Self::InvalidTarget(error.to_string())
        } else {
            Self::UpstreamTransport(error.to_string())
        }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
