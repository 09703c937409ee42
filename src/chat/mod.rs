//! Identity-scoped chat broker in front of a generative model
//!
//! Each turn passes through the [`RateLimiter`](rate_limit::RateLimiter),
//! is bound to an owned conversation and sent to a
//! [`GenerativeModel`](model::GenerativeModel). Failures are classified and
//! answered with a fallback reply instead of an error.

pub mod broker;
pub mod conversation;
pub mod errors;
pub mod model;
pub mod rate_limit;
pub mod service;
pub mod session;
pub mod topics;
pub mod types;

pub use broker::{ChatBroker, ChatDefaults, ChatOutcome};
pub use errors::{ChatError, ChatErrorKind};
pub use model::{GeminiModel, GenerativeModel, ModelError};
pub use service::ChatService;
