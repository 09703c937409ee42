//! Bare forwarding proxy
//!
//! Relays a caller-specified HTTP request either buffered, with an optional
//! fingerprint-keyed response cache, or streamed back as NDJSON frames.

pub mod cache;
pub mod error_response;
pub mod forwarding;
pub mod headers;
pub mod middleware;
pub mod middleware_stack;
pub mod service;
pub mod streaming;
pub mod test_utils;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use service::ProxyService;
pub use types::{ProxyConfig, ProxyError, ProxyResult};
