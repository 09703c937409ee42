//! Chat failure taxonomy
//!
//! Upstream model failures are classified by keywords in their message and
//! turned into a fixed, user-presentable fallback reply. Broker-level
//! rejections (identity, ownership, validation, rate limits) are
//! [`ChatError`]s and become error bodies instead.

use crate::chat::conversation::ConversationError;
use crate::proxy::error_response::{ErrorResponse, ErrorResponseExt};
use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Classification of an upstream model failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatErrorKind {
    RateLimited,
    ContentFiltered,
    TokenLimitExceeded,
    InvalidRequest,
    UpstreamUnavailable,
    Unknown,
}

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "quota",
    "resource exhausted",
    "too many requests",
];
const CONTENT_FILTER_KEYWORDS: &[&str] = &["content filtered", "safety", "blocked"];
const INVALID_REQUEST_KEYWORDS: &[&str] = &["invalid request", "bad request", "invalid argument"];
const UNAVAILABLE_KEYWORDS: &[&str] = &[
    "unavailable",
    "timeout",
    "timed out",
    "network",
    "connection",
    "overloaded",
];

impl ChatErrorKind {
    /// Classify a failure message; the first matching category wins
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| message.contains(k));

        if mentions(RATE_LIMIT_KEYWORDS) {
            Self::RateLimited
        } else if mentions(CONTENT_FILTER_KEYWORDS) {
            Self::ContentFiltered
        } else if message.contains("token") && message.contains("limit") {
            Self::TokenLimitExceeded
        } else if mentions(INVALID_REQUEST_KEYWORDS) {
            Self::InvalidRequest
        } else if mentions(UNAVAILABLE_KEYWORDS) {
            Self::UpstreamUnavailable
        } else {
            Self::Unknown
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ContentFiltered | Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::TokenLimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable name sent as `errorType`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::ContentFiltered => "CONTENT_FILTERED",
            Self::TokenLimitExceeded => "TOKEN_LIMIT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::UpstreamUnavailable => "API_UNAVAILABLE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Reply shown to the user instead of model output
    pub fn fallback_message(self) -> &'static str {
        match self {
            Self::RateLimited => {
                "I'm sorry, you've sent too many messages in a short period. Please wait a moment before trying again."
            }
            Self::UpstreamUnavailable => {
                "I'm currently experiencing connectivity issues. Please try again in a few minutes."
            }
            Self::ContentFiltered => {
                "I'm unable to respond to that message due to content restrictions. Please try a different question."
            }
            Self::TokenLimitExceeded => {
                "Your conversation has become too long. Try starting a new conversation or simplifying your question."
            }
            Self::InvalidRequest => {
                "I couldn't process your request. Please check your message and try again."
            }
            Self::Unknown => {
                "I'm sorry, I encountered an error while processing your request. Please try again later."
            }
        }
    }
}

/// Seconds a client is told to wait after an upstream rate limit
pub const UPSTREAM_RETRY_AFTER_SECS: u64 = 60;

/// Rejections raised before or around a chat turn
#[derive(Debug, Error, PartialEq)]
pub enum ChatError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{message}")]
    RateLimited { message: String, retry_after: u64 },

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error("Service credential required")]
    Forbidden,
}

impl ErrorResponseExt for ChatError {
    fn to_error_response(&self) -> ErrorResponse {
        let message = self.to_string();
        match self {
            ChatError::Unauthorized => {
                ErrorResponse::new("UNAUTHORIZED", "Unauthorized", message)
            }
            ChatError::InvalidRequest(_) => {
                ErrorResponse::new("INVALID_REQUEST", "Invalid request", message)
            }
            ChatError::RateLimited { retry_after, .. } => {
                ErrorResponse::new("RATE_LIMITED", "Rate limit exceeded", message)
                    .with_retry_after(*retry_after)
                    .with_error_type(ChatErrorKind::RateLimited.as_str())
            }
            ChatError::Conversation(ConversationError::NotFound(_)) => {
                ErrorResponse::new("NOT_FOUND", "Conversation not found", message)
            }
            ChatError::Conversation(ConversationError::Forbidden(_)) | ChatError::Forbidden => {
                ErrorResponse::new("FORBIDDEN", "Forbidden", message)
            }
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Conversation(ConversationError::NotFound(_)) => StatusCode::NOT_FOUND,
            ChatError::Conversation(ConversationError::Forbidden(_)) | ChatError::Forbidden => {
                StatusCode::FORBIDDEN
            }
        }
    }
}
