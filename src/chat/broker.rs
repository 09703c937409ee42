//! Chat turn orchestration
//!
//! A turn is validated, rate checked, bound to a conversation, sent to the
//! model once, and recorded. Model failures never escape: they become a
//! degraded [`ChatReply`] carrying a fallback message and the failure kind.

use crate::chat::conversation::{generate_conversation_id, ConversationError, ConversationStore};
use crate::chat::errors::{ChatError, ChatErrorKind, UPSTREAM_RETRY_AFTER_SECS};
use crate::chat::model::{GenerativeModel, ModelError};
use crate::chat::rate_limit::{rejection_message, RateLimiter};
use crate::chat::session::SessionStore;
use crate::chat::types::{
    ChatMessage, ChatReply, ChatRequest, ConversationId, GenerationConfig, ModelName, Temperature,
    TokenUsage, TopP, UserId,
};
use crate::metrics::MetricsCollector;
use axum::http::StatusCode;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_FALLBACK_MODELS: [&str; 2] = ["gemini-1.5-flash", "gemini-pro"];
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_TOP_P: f64 = 0.8;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;

/// Values used when a chat request leaves a parameter out
#[derive(Clone, Debug, PartialEq)]
pub struct ChatDefaults {
    pub model: ModelName,
    pub fallback_models: Vec<ModelName>,
    pub generation: GenerationConfig,
    pub system_prompt: Option<String>,
}

impl Default for ChatDefaults {
    fn default() -> Self {
        Self {
            model: known_model(DEFAULT_MODEL),
            fallback_models: DEFAULT_FALLBACK_MODELS.into_iter().map(known_model).collect(),
            generation: GenerationConfig::new(
                Temperature::try_new(DEFAULT_TEMPERATURE)
                    .unwrap_or_else(|_| unreachable!("default temperature is in range")),
                DEFAULT_TOP_K,
                TopP::try_new(DEFAULT_TOP_P)
                    .unwrap_or_else(|_| unreachable!("default top_p is in range")),
                DEFAULT_MAX_OUTPUT_TOKENS,
            ),
            system_prompt: None,
        }
    }
}

fn known_model(name: &str) -> ModelName {
    ModelName::try_new(name).unwrap_or_else(|_| unreachable!("built-in model name is valid"))
}

/// HTTP status plus body of a completed turn
#[derive(Clone, Debug, PartialEq)]
pub struct ChatOutcome {
    pub status: StatusCode,
    pub reply: ChatReply,
}

/// A validated chat request
struct Turn {
    message: String,
    conversation_id: Option<ConversationId>,
    system_prompt: Option<String>,
    model: Option<ModelName>,
    generation: GenerationConfig,
}

/// Where the turn's conversation came from
struct Binding {
    id: ConversationId,
    model: ModelName,
    system_prompt: Option<String>,
    history: Vec<ChatMessage>,
}

pub struct ChatBroker {
    model: Arc<dyn GenerativeModel>,
    conversations: Arc<ConversationStore>,
    sessions: Arc<SessionStore>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    defaults: ChatDefaults,
}

impl ChatBroker {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        conversations: Arc<ConversationStore>,
        sessions: Arc<SessionStore>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsCollector>,
        defaults: ChatDefaults,
    ) -> Self {
        Self {
            model,
            conversations,
            sessions,
            limiter,
            metrics,
            defaults,
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn defaults(&self) -> &ChatDefaults {
        &self.defaults
    }

    /// Run one chat turn for `caller`
    ///
    /// Returns `Err` only for rejections decided before the model is
    /// involved: invalid input, rate limiting, or a conversation owned by
    /// someone else.
    pub async fn chat(
        &self,
        caller: &UserId,
        request: ChatRequest,
    ) -> Result<ChatOutcome, ChatError> {
        let turn = self.validate(request)?;

        self.metrics.record_request();
        let now = Instant::now();
        let decision = self.limiter.check_at(caller, now);
        if decision.limited {
            self.metrics.record_rate_limited();
            let retry_after = decision.retry_after(self.limiter.config().window, now);
            return Err(ChatError::RateLimited {
                message: rejection_message(&decision, self.limiter.config().limit, retry_after),
                retry_after,
            });
        }

        let started = Instant::now();
        let binding = match self.bind_conversation(caller, &turn).await? {
            Ok(binding) => binding,
            Err((model, error)) => {
                let unstored = generate_conversation_id(caller, Utc::now());
                return Ok(self.degraded(unstored, model, &error, started));
            }
        };

        let system_prompt = turn
            .system_prompt
            .as_deref()
            .or(binding.system_prompt.as_deref())
            .or(self.defaults.system_prompt.as_deref());

        let result = self
            .model
            .generate(
                &binding.model,
                &turn.generation,
                system_prompt,
                &binding.history,
                &turn.message,
            )
            .await;

        match result {
            Ok(response) => {
                let stored =
                    self.conversations
                        .append_exchange(&binding.id, caller, &turn.message, &response);
                if let Err(error) = stored {
                    warn!(conversation_id = %binding.id, error = %error, "Reply not stored");
                }
                self.sessions.record_turn(caller, &turn.message, &response);

                let tokens = TokenUsage::estimate(&turn.message, &response);
                let latency = started.elapsed();
                self.metrics.record_success(latency);
                info!(
                    user = %caller,
                    conversation_id = %binding.id,
                    model = %binding.model,
                    tokens = tokens.total,
                    latency_ms = latency.as_millis() as u64,
                    "Chat turn completed"
                );

                Ok(ChatOutcome {
                    status: StatusCode::OK,
                    reply: ChatReply {
                        response,
                        conversation_id: binding.id,
                        tokens: Some(tokens),
                        model: binding.model.to_string(),
                        has_error: false,
                        error_type: None,
                        timestamp: Utc::now(),
                        retry_after: None,
                    },
                })
            }
            Err(error) => Ok(self.degraded(binding.id, binding.model, &error, started)),
        }
    }

    fn validate(&self, request: ChatRequest) -> Result<Turn, ChatError> {
        let message = request
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| ChatError::InvalidRequest("Message is required".to_string()))?;

        let model = request
            .model
            .map(ModelName::try_new)
            .transpose()
            .map_err(|_| ChatError::InvalidRequest("Model name is invalid".to_string()))?;

        let defaults = &self.defaults.generation;
        let temperature = match request.temperature {
            Some(value) => Temperature::try_new(value).map_err(|_| {
                ChatError::InvalidRequest("temperature must be between 0 and 2".to_string())
            })?,
            None => defaults.temperature,
        };
        let top_p = match request.top_p {
            Some(value) => TopP::try_new(value).map_err(|_| {
                ChatError::InvalidRequest("topP must be between 0 and 1".to_string())
            })?,
            None => defaults.top_p,
        };
        let top_k = positive(request.top_k, defaults.top_k, "topK")?;
        let max_output_tokens =
            positive(request.max_output_tokens, defaults.max_output_tokens, "maxOutputTokens")?;

        // An id that cannot be ours is treated like an unknown one
        let conversation_id = request
            .conversation_id
            .and_then(|raw| ConversationId::try_new(raw).ok());

        Ok(Turn {
            message,
            conversation_id,
            system_prompt: request.system_prompt.filter(|p| !p.trim().is_empty()),
            model,
            generation: GenerationConfig::new(temperature, top_k, top_p, max_output_tokens),
        })
    }

    /// Reuse the caller's conversation or create one on the first available model
    ///
    /// The inner `Err` carries the last model tried when no model could be
    /// probed successfully.
    async fn bind_conversation(
        &self,
        caller: &UserId,
        turn: &Turn,
    ) -> Result<Result<Binding, (ModelName, ModelError)>, ChatError> {
        if let Some(id) = &turn.conversation_id {
            match self.conversations.get(id, caller) {
                Ok(conversation) => {
                    return Ok(Ok(Binding {
                        id: conversation.id,
                        model: conversation.model,
                        system_prompt: conversation.system_prompt,
                        history: conversation.messages,
                    }));
                }
                Err(ConversationError::NotFound(_)) => {
                    debug!(conversation_id = %id, "Unknown conversation, starting a new one");
                }
                Err(forbidden @ ConversationError::Forbidden(_)) => return Err(forbidden.into()),
            }
        }

        let model = match self.select_model(turn.model.as_ref()).await {
            Ok(model) => model,
            Err(failure) => return Ok(Err(failure)),
        };
        let system_prompt = turn
            .system_prompt
            .clone()
            .or_else(|| self.defaults.system_prompt.clone());
        let id = self.conversations.create(caller, model.clone(), system_prompt.clone());

        Ok(Ok(Binding {
            id,
            model,
            system_prompt,
            history: Vec::new(),
        }))
    }

    /// First model in (requested or default, then fallbacks) whose probe succeeds
    async fn select_model(
        &self,
        requested: Option<&ModelName>,
    ) -> Result<ModelName, (ModelName, ModelError)> {
        let primary = requested.unwrap_or(&self.defaults.model);
        let mut candidates = vec![primary];
        for fallback in &self.defaults.fallback_models {
            if !candidates.contains(&fallback) {
                candidates.push(fallback);
            }
        }

        let mut last_failure = None;
        for candidate in candidates {
            match self.model.probe(candidate).await {
                Ok(()) => return Ok(candidate.clone()),
                Err(error) => {
                    warn!(model = %candidate, error = %error, "Model unavailable, trying next");
                    last_failure = Some((candidate.clone(), error));
                }
            }
        }
        Err(last_failure.unwrap_or_else(|| {
            (
                primary.clone(),
                ModelError::Configuration("no models configured".to_string()),
            )
        }))
    }

    fn degraded(
        &self,
        conversation_id: ConversationId,
        model: ModelName,
        error: &ModelError,
        started: Instant,
    ) -> ChatOutcome {
        let kind = ChatErrorKind::classify(&error.to_string());
        self.metrics.record_failure(started.elapsed());
        warn!(
            conversation_id = %conversation_id,
            model = %model,
            error = %error,
            error_type = kind.as_str(),
            "Chat turn failed"
        );

        ChatOutcome {
            status: kind.status_code(),
            reply: ChatReply {
                response: kind.fallback_message().to_string(),
                conversation_id,
                tokens: None,
                model: model.to_string(),
                has_error: true,
                error_type: Some(kind.as_str().to_string()),
                timestamp: Utc::now(),
                retry_after: (kind == ChatErrorKind::RateLimited)
                    .then_some(UPSTREAM_RETRY_AFTER_SECS),
            },
        }
    }
}

fn positive(value: Option<u32>, default: u32, name: &str) -> Result<u32, ChatError> {
    match value {
        Some(0) => Err(ChatError::InvalidRequest(format!("{name} must be positive"))),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}
