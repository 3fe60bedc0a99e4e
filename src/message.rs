//! Conversation messages and per-player contexts.

use chrono::{DateTime, Utc};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backends::estimate_message_tokens;

/// Speaker of a message.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Instructions installed before the game starts.
    System,
    /// Game master prompts.
    User,
    /// Model responses.
    Assistant,
}

/// A single immutable message in a player's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
    pinned: bool,
}

impl Message {
    /// Creates a message. System messages are pinned.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            pinned: role == Role::System,
        }
    }

    /// Creates a pinned system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user (game master) message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant (model) message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Marks the message as pinned, exempting it from truncation.
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Returns the role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the text content.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns when the message was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns `true` if truncation must keep this message.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Returns the timestamp-free view stored in transcripts.
    pub fn snapshot(&self) -> SnapshotMessage {
        SnapshotMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Role and content of a message as captured in a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    /// Speaker.
    pub role: Role,
    /// Text content.
    pub content: String,
}

/// Bounds enforced on a player's context before every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Setters)]
#[setters(prefix = "with_")]
pub struct ContextPolicy {
    /// Maximum number of messages kept, pinned ones included.
    #[setters(strip_option)]
    pub max_messages: Option<usize>,
    /// Maximum estimated prompt tokens kept. Players cap it at what their
    /// model's window leaves after the completion budget.
    #[setters(strip_option)]
    pub max_tokens: Option<usize>,
    /// Most recent messages that are never dropped.
    pub keep_recent: usize,
}

impl ContextPolicy {
    /// A policy that never truncates.
    pub fn unbounded() -> Self {
        Self {
            max_messages: None,
            max_tokens: None,
            keep_recent: 2,
        }
    }

    /// Returns `true` if the context is within both bounds.
    pub fn admits(&self, context: &Context) -> bool {
        let messages_ok = self.max_messages.is_none_or(|max| context.len() <= max);
        let tokens_ok = self
            .max_tokens
            .is_none_or(|max| context.estimated_tokens() <= max);
        messages_ok && tokens_ok
    }
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Ordered message history owned by exactly one player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    messages: Vec<Message>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Returns the messages in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if the context holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the estimated prompt size of the whole context.
    pub fn estimated_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| estimate_message_tokens(m.content()))
            .sum()
    }

    /// Drops everything except pinned messages.
    #[instrument(skip(self), fields(len = self.messages.len()))]
    pub fn reset(&mut self) {
        self.messages.retain(Message::is_pinned);
        debug!(kept = self.messages.len(), "Context reset");
    }

    /// Drops the oldest non-pinned messages until `policy` admits the context.
    ///
    /// Pinned messages and the `keep_recent` newest messages are never
    /// dropped, so the result may still exceed the policy when those alone
    /// are too large. Returns the number of messages dropped.
    #[instrument(skip(self, policy), fields(len = self.messages.len()))]
    pub fn enforce(&mut self, policy: &ContextPolicy) -> usize {
        let mut dropped = 0;
        while !policy.admits(self) {
            let protected_from = self.messages.len().saturating_sub(policy.keep_recent);
            let Some(idx) = self.messages[..protected_from]
                .iter()
                .position(|m| !m.is_pinned())
            else {
                break;
            };
            self.messages.remove(idx);
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, remaining = self.messages.len(), "Truncated context");
        }
        dropped
    }

    /// Returns the timestamp-free view of the context.
    pub fn snapshot(&self) -> Vec<SnapshotMessage> {
        self.messages.iter().map(Message::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(turns: usize) -> Context {
        let mut context = Context::new();
        context.push(Message::system("rules"));
        for i in 0..turns {
            context.push(Message::user(format!("prompt {i}")));
            context.push(Message::assistant(format!("answer {i}")));
        }
        context
    }

    #[test]
    fn system_messages_are_pinned() {
        assert!(Message::system("x").is_pinned());
        assert!(!Message::user("x").is_pinned());
        assert!(Message::user("x").pinned().is_pinned());
    }

    #[test]
    fn enforce_drops_oldest_unpinned_first() {
        let mut context = conversation(4);
        let policy = ContextPolicy::unbounded().with_max_messages(5);

        let dropped = context.enforce(&policy);

        assert_eq!(dropped, 4);
        assert_eq!(context.len(), 5);
        assert_eq!(context.messages()[0].content(), "rules");
        assert_eq!(context.messages()[1].content(), "prompt 2");
        assert_eq!(context.messages()[4].content(), "answer 3");
    }

    #[test]
    fn enforce_keeps_recent_messages_even_when_over_budget() {
        let mut context = conversation(3);
        let policy = ContextPolicy::unbounded()
            .with_max_messages(1)
            .with_keep_recent(2);

        context.enforce(&policy);

        let contents: Vec<_> = context.messages().iter().map(Message::content).collect();
        assert_eq!(contents, ["rules", "prompt 2", "answer 2"]);
    }

    #[test]
    fn enforce_respects_token_budget() {
        let mut context = conversation(10);
        let budget = 40;
        let policy = ContextPolicy::unbounded().with_max_tokens(budget);

        context.enforce(&policy);

        assert!(context.estimated_tokens() <= budget);
        assert_eq!(context.messages()[0].role(), Role::System);
    }

    #[test]
    fn reset_keeps_only_pinned() {
        let mut context = conversation(2);
        context.reset();
        assert_eq!(context.len(), 1);
        assert_eq!(context.messages()[0].role(), Role::System);
    }

    #[test]
    fn role_round_trips_through_strings() {
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!("user".parse::<Role>().ok(), Some(Role::User));
    }
}
