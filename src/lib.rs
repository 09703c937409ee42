//! Bare Gateway - a forwarding proxy and conversational AI broker
//!
//! The proxy relays caller-specified HTTP requests, buffered or streamed,
//! with an optional response cache. The chat broker fronts a generative
//! model with per-identity rate limiting, owned conversations and graceful
//! degradation when the model fails.

pub mod application;
pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod maintenance;
pub mod metrics;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
