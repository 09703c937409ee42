//! HTTP surface of the chat broker
//!
//! ## Routes
//!
//! - `POST /ai/chat` one chat turn, identity required
//! - `GET /ai/topics` suggested topics, identity optional
//! - `GET /ai/metrics` counters for service callers
//! - `GET|DELETE /ai/conversations/{id}` owner-only conversation access

use crate::chat::broker::ChatBroker;
use crate::chat::errors::ChatError;
use crate::chat::topics::TopicSuggester;
use crate::chat::types::{ChatRequest, ConversationId, TopicsResponse, UserId};
use crate::identity::CallerIdentity;
use crate::proxy::error_response::{standard_error_response, ErrorResponseExt};
use crate::proxy::streaming::ConnectionRegistry;
use crate::proxy::types::RequestId;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header::RETRY_AFTER, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Chat endpoints backed by a shared broker
pub struct ChatService {
    broker: Arc<ChatBroker>,
    topics: TopicSuggester,
    streams: ConnectionRegistry,
}

impl ChatService {
    /// `streams` is the proxy's relay registry, reported by `/ai/metrics`
    pub fn new(
        broker: Arc<ChatBroker>,
        topics: TopicSuggester,
        streams: ConnectionRegistry,
    ) -> Self {
        Self {
            broker,
            topics,
            streams,
        }
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/ai/chat", post(chat_handler))
            .route("/ai/topics", get(topics_handler))
            .route("/ai/metrics", get(metrics_handler))
            .route(
                "/ai/conversations/{id}",
                get(conversation_handler).delete(delete_conversation_handler),
            )
            .with_state(Arc::new(self))
    }
}

/// `POST /ai/chat`
async fn chat_handler(
    State(chat): State<Arc<ChatService>>,
    identity: CallerIdentity,
    request_id: RequestId,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request_id = request_id.to_string();
    let Some(user) = identity.user else {
        return ChatError::Unauthorized.into_error_response(Some(&request_id));
    };
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return ChatError::InvalidRequest(rejection.body_text())
                .into_error_response(Some(&request_id));
        }
    };

    match chat.broker.chat(&user, request).await {
        Ok(outcome) => {
            let retry_after = outcome.reply.retry_after;
            let mut response = (outcome.status, Json(outcome.reply)).into_response();
            if let Some(seconds) = retry_after {
                response.headers_mut().insert(RETRY_AFTER, seconds.into());
            }
            response
        }
        Err(e) => e.into_error_response(Some(&request_id)),
    }
}

/// `GET /ai/topics`
async fn topics_handler(
    State(chat): State<Arc<ChatService>>,
    identity: CallerIdentity,
) -> Json<TopicsResponse> {
    Json(TopicsResponse {
        topics: chat.topics.suggest(identity.user.as_ref()).await,
    })
}

/// `GET /ai/metrics`
async fn metrics_handler(
    State(chat): State<Arc<ChatService>>,
    identity: CallerIdentity,
    request_id: RequestId,
) -> Response {
    if !identity.service {
        return ChatError::Forbidden.into_error_response(Some(&request_id.to_string()));
    }

    let broker = &chat.broker;
    Json(json!({
        "metrics": broker.metrics().snapshot(),
        "conversations": broker.conversations().len(),
        "sessions": broker.sessions().len(),
        "trackedIdentities": broker.limiter().tracked(),
        "activeStreams": chat.streams.len(),
    }))
    .into_response()
}

/// Resolve the caller and path id, or the response rejecting them
fn owner_and_id(
    identity: CallerIdentity,
    raw_id: &str,
    request_id: &str,
) -> Result<(UserId, ConversationId), Response> {
    let user = identity
        .user
        .ok_or_else(|| ChatError::Unauthorized.into_error_response(Some(request_id)))?;
    let id = ConversationId::try_new(raw_id)
        .map_err(|_| standard_error_response(StatusCode::NOT_FOUND, Some(request_id)))?;
    Ok((user, id))
}

/// `GET /ai/conversations/{id}`
async fn conversation_handler(
    State(chat): State<Arc<ChatService>>,
    identity: CallerIdentity,
    request_id: RequestId,
    Path(raw_id): Path<String>,
) -> Response {
    let request_id = request_id.to_string();
    let (user, id) = match owner_and_id(identity, &raw_id, &request_id) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };

    match chat.broker.conversations().get(&id, &user) {
        Ok(conversation) => Json(conversation).into_response(),
        Err(e) => ChatError::from(e).into_error_response(Some(&request_id)),
    }
}

/// `DELETE /ai/conversations/{id}`
async fn delete_conversation_handler(
    State(chat): State<Arc<ChatService>>,
    identity: CallerIdentity,
    request_id: RequestId,
    Path(raw_id): Path<String>,
) -> Response {
    let request_id = request_id.to_string();
    let (user, id) = match owner_and_id(identity, &raw_id, &request_id) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };

    match chat.broker.conversations().delete(&id, &user) {
        Ok(()) => {
            info!(request_id = %request_id, conversation_id = %id, "Conversation deleted by owner");
            Json(json!({ "deleted": true, "conversationId": id })).into_response()
        }
        Err(e) => ChatError::from(e).into_error_response(Some(&request_id)),
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        self.to_error_response()
            .into_response_with_status(self.status_code())
    }
}
