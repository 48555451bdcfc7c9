//! Role-tagged conversation shared by the generators for one goal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Append-only history that keeps every system message plus the most recent
/// `max_exchanges` user/assistant exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
    max_exchanges: usize,
}

impl ChatHistory {
    pub fn new(max_exchanges: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_exchanges,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.trim();
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::assistant(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn trim(&mut self) {
        let limit = self.max_exchanges.saturating_mul(2);
        let conversational = self
            .messages
            .iter()
            .filter(|message| message.role != Role::System)
            .count();
        let mut excess = conversational.saturating_sub(limit);
        if excess == 0 {
            return;
        }
        self.messages.retain(|message| {
            if excess > 0 && message.role != Role::System {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}
