//! Ordered message log for a single console session.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::types::{Message, Role};

/// Append-only record of conversation turns.
///
/// There is no internal locking. A session owns its conversation and mutates
/// it through `&mut self`; collaborators only ever see `&Conversation`.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Remove the first message with `id`. Does nothing if none matches.
    pub fn remove_message(&mut self, id: Uuid) {
        if let Some(pos) = self.messages.iter().position(|m| m.id() == id) {
            self.messages.remove(pos);
        }
    }

    /// Keep only the leading run of system messages and restart the clock.
    pub fn reset(&mut self) -> &mut Self {
        let keep = self
            .messages
            .iter()
            .take_while(|m| m.role() == Role::System)
            .count();
        self.messages.truncate(keep);
        self.created_at = Utc::now();
        self
    }

    /// Drop every message and restart the clock.
    pub fn clean(&mut self) -> &mut Self {
        self.messages.clear();
        self.created_at = Utc::now();
        self
    }
}
