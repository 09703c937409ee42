//! Type definitions for the chat broker

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};

pub use crate::identity::UserId;

// ========== Identifier Types ==========

/// Prefix of every generated conversation id
pub const CONVERSATION_ID_PREFIX: &str = "conv_";

/// Number of hex characters following the prefix
pub const CONVERSATION_ID_HEX_LEN: usize = 24;

/// Conversation identifier, `conv_` followed by 24 hex characters
#[nutype(
    sanitize(trim),
    validate(predicate = |s: &str| {
        s.strip_prefix(CONVERSATION_ID_PREFIX).is_some_and(|hex| {
            hex.len() == CONVERSATION_ID_HEX_LEN && hex.chars().all(|c| c.is_ascii_hexdigit())
        })
    }),
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef)
)]
pub struct ConversationId(String);

/// Generative model identifier, e.g. `gemini-1.5-pro`
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 100),
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef)
)]
pub struct ModelName(String);

// ========== Sampling Parameters ==========

/// Sampling temperature
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 2.0),
    derive(Clone, Copy, Debug, Display, PartialEq, PartialOrd, Serialize, Deserialize, AsRef)
)]
pub struct Temperature(f64);

/// Nucleus sampling probability mass
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Clone, Copy, Debug, Display, PartialEq, PartialOrd, Serialize, Deserialize, AsRef)
)]
pub struct TopP(f64);

/// Parameters sent with every generation call
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: Temperature,
    pub top_k: u32,
    pub top_p: TopP,
    pub max_output_tokens: u32,
}

impl GenerationConfig {
    pub fn new(temperature: Temperature, top_k: u32, top_p: TopP, max_output_tokens: u32) -> Self {
        Self {
            temperature,
            top_k,
            top_p,
            max_output_tokens,
        }
    }
}

// ========== Messages ==========

/// Author of a conversation message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One stored conversation message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

// ========== Wire Types ==========

/// Body of `POST /ai/chat`
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: Option<String>,
    #[serde(alias = "conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(alias = "system_prompt")]
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    #[serde(alias = "top_k")]
    pub top_k: Option<u32>,
    #[serde(alias = "top_p")]
    pub top_p: Option<f64>,
    #[serde(alias = "max_output_tokens")]
    pub max_output_tokens: Option<u32>,
}

/// Approximate token usage of one turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    /// Estimate from word counts (`words * 1.3`, rounded)
    pub fn estimate(prompt: &str, reply: &str) -> Self {
        let input = estimate_tokens(prompt);
        let output = estimate_tokens(reply);
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * 1.3).round() as u64
}

/// Response body of `POST /ai/chat`, successful or degraded
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub conversation_id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    pub model: String,
    pub has_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Response body of `GET /ai/topics`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicsResponse {
    pub topics: Vec<String>,
}
