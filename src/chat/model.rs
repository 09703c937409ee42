//! Generative model abstraction and the Gemini REST client

use crate::chat::types::{ChatMessage, GenerationConfig, ModelName, Role};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const GEMINI_API_KEY_HEADER: &str = "x-goog-api-key";
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];
const SAFETY_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";

/// Failures reported by a model backend
///
/// Display strings are fed to keyword classification, so they carry the
/// upstream status text and message verbatim.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("Response blocked by safety filters: {0}")]
    Blocked(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Model returned no content")]
    EmptyResponse,

    #[error("Malformed model response: {0}")]
    Decode(String),

    #[error("Model client configuration error: {0}")]
    Configuration(String),
}

impl ModelError {
    fn from_reqwest(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            ModelError::Timeout(timeout)
        } else if error.is_decode() {
            ModelError::Decode(error.to_string())
        } else {
            ModelError::Transport(error.to_string())
        }
    }
}

/// A text generation backend
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Check that `model` exists and can be used
    async fn probe(&self, model: &ModelName) -> Result<(), ModelError>;

    /// Generate a reply to `prompt`, replaying `history` first
    async fn generate(
        &self,
        model: &ModelName,
        config: &GenerationConfig,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<String, ModelError>;
}

// ========== Gemini wire format ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: &'a GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn safety_settings() -> Vec<SafetySetting> {
    SAFETY_CATEGORIES
        .iter()
        .map(|&category| SafetySetting {
            category,
            threshold: SAFETY_THRESHOLD,
        })
        .collect()
}

impl GenerateContentResponse {
    fn into_text(self) -> Result<String, ModelError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ModelError::Blocked(reason));
        }

        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or(ModelError::EmptyResponse)?;
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(ModelError::Blocked("SAFETY".to_string()));
        }

        let text: String = candidate
            .content
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            Err(ModelError::EmptyResponse)
        } else {
            Ok(text)
        }
    }
}

/// [`GenerativeModel`] backed by the Gemini REST API
pub struct GeminiModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiModel {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }

    fn model_url(&self, model: &ModelName) -> String {
        format!("{}/v1beta/models/{}", self.base_url, model)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|parsed| parsed.error.message)
            .unwrap_or(body);
        Err(ModelError::Status { status, message })
    }
}

#[async_trait]
impl GenerativeModel for GeminiModel {
    async fn probe(&self, model: &ModelName) -> Result<(), ModelError> {
        let response = self
            .client
            .get(self.model_url(model))
            .header(GEMINI_API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        Self::check_status(response).await.inspect_err(|error| {
            warn!(model = %model, error = %error, "Model probe failed");
        })?;
        debug!(model = %model, "Model available");
        Ok(())
    }

    async fn generate(
        &self,
        model: &ModelName,
        config: &GenerationConfig,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<String, ModelError> {
        let mut contents: Vec<Content<'_>> = history
            .iter()
            .map(|message| Content {
                role: Some(wire_role(message.role)),
                parts: vec![Part {
                    text: &message.content,
                }],
            })
            .collect();
        contents.push(Content {
            role: Some(wire_role(Role::User)),
            parts: vec![Part { text: prompt }],
        });

        let body = GenerateContentRequest {
            contents,
            system_instruction: system_prompt.map(|text| Content {
                role: None,
                parts: vec![Part { text }],
            }),
            generation_config: config,
            safety_settings: safety_settings(),
        };

        let response = self
            .client
            .post(format!("{}:generateContent", self.model_url(model)))
            .header(GEMINI_API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        let parsed: GenerateContentResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;
        parsed.into_text()
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};

    /// Model double with scripted availability and replies
    #[derive(Default)]
    pub struct ScriptedModel {
        unavailable: HashSet<String>,
        replies: Mutex<VecDeque<Result<String, ModelError>>>,
        calls: Mutex<Vec<(String, usize, String)>>,
    }

    impl ScriptedModel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn unavailable(mut self, model: &str) -> Self {
            self.unavailable.insert(model.to_string());
            self
        }

        pub fn reply(self, text: &str) -> Self {
            self.replies.lock().push_back(Ok(text.to_string()));
            self
        }

        pub fn fail(self, error: ModelError) -> Self {
            self.replies.lock().push_back(Err(error));
            self
        }

        /// (model, replayed history length, prompt) of every generate call
        pub fn calls(&self) -> Vec<(String, usize, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        async fn probe(&self, model: &ModelName) -> Result<(), ModelError> {
            if self.unavailable.contains(model.as_ref()) {
                Err(ModelError::Status {
                    status: StatusCode::NOT_FOUND,
                    message: format!("models/{model} is not found"),
                })
            } else {
                Ok(())
            }
        }

        async fn generate(
            &self,
            model: &ModelName,
            _config: &GenerationConfig,
            _system_prompt: Option<&str>,
            history: &[ChatMessage],
            prompt: &str,
        ) -> Result<String, ModelError> {
            self.calls
                .lock()
                .push((model.to_string(), history.len(), prompt.to_string()));
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("echo: {prompt}")))
        }
    }
}
