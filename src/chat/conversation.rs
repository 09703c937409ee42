//! Owned conversation histories
//!
//! Every operation that names an existing conversation takes the caller's
//! identity; a conversation owned by someone else is reported as
//! [`ConversationError::Forbidden`], never as missing.

use crate::chat::types::{
    ChatMessage, ConversationId, ModelName, Role, UserId, CONVERSATION_ID_HEX_LEN,
    CONVERSATION_ID_PREFIX,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Default idle time after which a conversation is reaped (7 days)
pub const DEFAULT_CONVERSATION_IDLE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error, PartialEq)]
pub enum ConversationError {
    #[error("Conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("You do not have access to this conversation")]
    Forbidden(ConversationId),
}

pub type ConversationResult<T> = Result<T, ConversationError>;

/// A stored conversation
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub owner_id: UserId,
    pub messages: Vec<ChatMessage>,
    pub model: ModelName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    last_active: Instant,
}

/// Thread-safe map of conversation id → [`Conversation`]
pub struct ConversationStore {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    max_history: usize,
    idle_timeout: Duration,
}

impl ConversationStore {
    /// `max_history` counts exchanges; up to twice as many messages are kept
    pub fn new(max_history: usize, idle_timeout: Duration) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            max_history: max_history.max(1),
            idle_timeout,
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_history * 2
    }

    pub fn create(
        &self,
        owner: &UserId,
        model: ModelName,
        system_prompt: Option<String>,
    ) -> ConversationId {
        self.create_at(owner, model, system_prompt, Instant::now())
    }

    pub fn create_at(
        &self,
        owner: &UserId,
        model: ModelName,
        system_prompt: Option<String>,
        now: Instant,
    ) -> ConversationId {
        let timestamp = Utc::now();
        let mut conversations = self.conversations.lock();

        let id = loop {
            let candidate = generate_conversation_id(owner, timestamp);
            if !conversations.contains_key(&candidate) {
                break candidate;
            }
        };

        conversations.insert(
            id.clone(),
            Conversation {
                id: id.clone(),
                owner_id: owner.clone(),
                messages: Vec::new(),
                model,
                system_prompt,
                created_at: timestamp,
                updated_at: timestamp,
                last_active: now,
            },
        );
        debug!(conversation_id = %id, owner = %owner, "Conversation created");
        id
    }

    pub fn get(&self, id: &ConversationId, caller: &UserId) -> ConversationResult<Conversation> {
        let conversations = self.conversations.lock();
        owned(&conversations, id, caller).cloned()
    }

    /// Messages to replay to the model, oldest first
    pub fn history(
        &self,
        id: &ConversationId,
        caller: &UserId,
    ) -> ConversationResult<Vec<ChatMessage>> {
        let conversations = self.conversations.lock();
        owned(&conversations, id, caller).map(|conversation| conversation.messages.clone())
    }

    pub fn append(
        &self,
        id: &ConversationId,
        caller: &UserId,
        role: Role,
        content: impl Into<String>,
    ) -> ConversationResult<()> {
        self.append_all(id, caller, [ChatMessage::new(role, content)], Instant::now())
    }

    /// Append a user message and its reply in one step
    pub fn append_exchange(
        &self,
        id: &ConversationId,
        caller: &UserId,
        prompt: impl Into<String>,
        reply: impl Into<String>,
    ) -> ConversationResult<()> {
        self.append_all(
            id,
            caller,
            [ChatMessage::user(prompt), ChatMessage::assistant(reply)],
            Instant::now(),
        )
    }

    fn append_all(
        &self,
        id: &ConversationId,
        caller: &UserId,
        messages: impl IntoIterator<Item = ChatMessage>,
        now: Instant,
    ) -> ConversationResult<()> {
        let max_messages = self.max_messages();
        let mut conversations = self.conversations.lock();
        let conversation = owned_mut(&mut conversations, id, caller)?;

        conversation.messages.extend(messages);
        if conversation.messages.len() > max_messages {
            let excess = conversation.messages.len() - max_messages;
            conversation.messages.drain(..excess);
        }
        conversation.updated_at = Utc::now();
        conversation.last_active = now;
        Ok(())
    }

    pub fn delete(&self, id: &ConversationId, caller: &UserId) -> ConversationResult<()> {
        let mut conversations = self.conversations.lock();
        owned(&conversations, id, caller)?;
        conversations.remove(id);
        debug!(conversation_id = %id, "Conversation deleted");
        Ok(())
    }

    /// Remove conversations idle longer than the configured timeout
    pub fn reap_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.idle_timeout;
        let mut conversations = self.conversations.lock();
        let before = conversations.len();
        conversations.retain(|_, c| now.saturating_duration_since(c.last_active) <= idle_timeout);
        before - conversations.len()
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn owned<'a>(
    conversations: &'a HashMap<ConversationId, Conversation>,
    id: &ConversationId,
    caller: &UserId,
) -> ConversationResult<&'a Conversation> {
    match conversations.get(id) {
        None => Err(ConversationError::NotFound(id.clone())),
        Some(conversation) if conversation.owner_id != *caller => {
            Err(ConversationError::Forbidden(id.clone()))
        }
        Some(conversation) => Ok(conversation),
    }
}

fn owned_mut<'a>(
    conversations: &'a mut HashMap<ConversationId, Conversation>,
    id: &ConversationId,
    caller: &UserId,
) -> ConversationResult<&'a mut Conversation> {
    match conversations.get_mut(id) {
        None => Err(ConversationError::NotFound(id.clone())),
        Some(conversation) if conversation.owner_id != *caller => {
            Err(ConversationError::Forbidden(id.clone()))
        }
        Some(conversation) => Ok(conversation),
    }
}

/// `conv_` + the first 24 hex chars of SHA-256(owner ‖ timestamp ‖ UUIDv7)
pub fn generate_conversation_id(owner: &UserId, timestamp: DateTime<Utc>) -> ConversationId {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_ref().as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(Uuid::now_v7().as_bytes());
    let digest = hex::encode(hasher.finalize());

    let raw = format!("{CONVERSATION_ID_PREFIX}{}", &digest[..CONVERSATION_ID_HEX_LEN]);
    ConversationId::try_new(raw)
        .unwrap_or_else(|_| unreachable!("prefix plus hex digest is a valid conversation id"))
}
