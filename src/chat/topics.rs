//! Suggested conversation topics

use crate::chat::model::GenerativeModel;
use crate::chat::session::SessionStore;
use crate::chat::types::{GenerationConfig, ModelName, Role, UserId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Number of topics returned to the caller
pub const TOPIC_COUNT: usize = 5;

/// Recent session messages considered when personalizing
const PERSONALIZATION_MESSAGES: usize = 10;

pub const DEFAULT_TOPICS: [&str; 7] = [
    "Math homework help",
    "Science concepts explained",
    "History essay research",
    "Language learning tips",
    "Coding tutorials",
    "Literature analysis",
    "Study techniques",
];

pub fn default_topics() -> Vec<String> {
    DEFAULT_TOPICS
        .iter()
        .take(TOPIC_COUNT)
        .map(|topic| topic.to_string())
        .collect()
}

/// Builds topic lists, personalized from session history when available
pub struct TopicSuggester {
    model: Arc<dyn GenerativeModel>,
    sessions: Arc<SessionStore>,
    model_name: ModelName,
    generation: GenerationConfig,
}

impl TopicSuggester {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        sessions: Arc<SessionStore>,
        model_name: ModelName,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            model,
            sessions,
            model_name,
            generation,
        }
    }

    /// Exactly [`TOPIC_COUNT`] topics; never fails
    pub async fn suggest(&self, user: Option<&UserId>) -> Vec<String> {
        let Some(user) = user else {
            return default_topics();
        };
        let recent = self.sessions.recent(user, PERSONALIZATION_MESSAGES);
        let asked: Vec<&str> = recent
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .collect();
        if asked.is_empty() {
            return default_topics();
        }

        let prompt = format!(
            "Based on these recent questions, suggest {TOPIC_COUNT} short study topics the user \
             might want to explore next. Reply with one topic per line and nothing else.\n\n{}",
            asked.join("\n")
        );
        match self
            .model
            .generate(&self.model_name, &self.generation, None, &[], &prompt)
            .await
        {
            Ok(text) => {
                let mut topics = parse_topics(&text);
                debug!(user = %user, parsed = topics.len(), "Personalized topics generated");
                pad_with_defaults(&mut topics);
                topics
            }
            Err(error) => {
                warn!(user = %user, error = %error, "Topic generation failed, using defaults");
                default_topics()
            }
        }
    }
}

/// One topic per non-empty line, without bullets or numbering
pub fn parse_topics(text: &str) -> Vec<String> {
    text.lines()
        .map(strip_marker)
        .filter(|line| !line.is_empty())
        .take(TOPIC_COUNT)
        .map(str::to_string)
        .collect()
}

fn strip_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(['.', ')']) {
            return rest.trim();
        }
    }
    line.trim()
}

fn pad_with_defaults(topics: &mut Vec<String>) {
    for default in DEFAULT_TOPICS {
        if topics.len() >= TOPIC_COUNT {
            break;
        }
        if !topics.iter().any(|t| t.eq_ignore_ascii_case(default)) {
            topics.push(default.to_string());
        }
    }
}
