//! HTTP header constants and utilities for the proxy service
//!
//! This module centralizes the header names the gateway reads and writes,
//! and the hop-by-hop filter applied to every relayed upstream response.

use ::http::HeaderMap;
use std::collections::BTreeMap;

/// Header name for request ID used for tracing and correlation
pub const X_REQUEST_ID: &str = "x-request-id";

/// Header name for service-to-service credentials
pub const X_API_KEY: &str = "x-api-key";

/// Authorization header prefix for bearer tokens
pub const BEARER_PREFIX: &str = "Bearer ";

/// Request headers that participate in the cache fingerprint, in key order
pub const CACHE_VARY_HEADERS: [&str; 3] = ["accept", "accept-language", "content-type"];

/// Headers that describe a single transport hop and must not be relayed
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Standard header re-exports for convenience
pub use ::http::header::{AUTHORIZATION, CONTENT_TYPE};

/// Well-known paths
pub mod paths {
    /// Health check endpoint path
    pub const HEALTH: &str = "/health";
}

/// Content types produced by the gateway
pub mod content_types {
    pub const NDJSON: &str = "application/x-ndjson";
}

/// Returns true when `name` is a hop-by-hop header (case-insensitive)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Copy `headers` into an ordered map without hop-by-hop entries.
///
/// Multi-valued headers are joined with `", "`; values that are not valid
/// UTF-8 are decoded lossily.
pub fn filter_response_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .filter(|name| !is_hop_by_hop(name.as_str()))
        .map(|name| {
            let joined = headers
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            (name.as_str().to_string(), joined)
        })
        .collect()
}
