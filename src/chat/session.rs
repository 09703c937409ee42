//! Per-identity turn history used to personalize topic suggestions

use crate::chat::types::{ChatMessage, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default session lifetime without activity
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
struct Session {
    history: Vec<ChatMessage>,
    last_access: Instant,
}

/// One recent-history buffer per identity, reaped after `ttl` of inactivity
pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, Session>>,
    max_history: usize,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(max_history: usize, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_history: max_history.max(1),
            ttl,
        }
    }

    pub fn record_turn(&self, user: &UserId, prompt: &str, reply: &str) {
        self.record_turn_at(user, prompt, reply, Instant::now());
    }

    pub fn record_turn_at(&self, user: &UserId, prompt: &str, reply: &str, now: Instant) {
        let max_messages = self.max_history * 2;
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(user.clone()).or_insert_with(|| Session {
            history: Vec::new(),
            last_access: now,
        });

        session.history.push(ChatMessage::user(prompt));
        session.history.push(ChatMessage::assistant(reply));
        if session.history.len() > max_messages {
            let excess = session.history.len() - max_messages;
            session.history.drain(..excess);
        }
        session.last_access = now;
    }

    /// The most recent `limit` messages of `user`, oldest first
    pub fn recent(&self, user: &UserId, limit: usize) -> Vec<ChatMessage> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(user) {
            Some(session) => {
                session.last_access = Instant::now();
                let skip = session.history.len().saturating_sub(limit);
                session.history[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub fn reap_expired(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| now.saturating_duration_since(session.last_access) <= ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
