//! Streaming completion contract.
//!
//! A [`CompletionProvider`] pushes [`CompletionEvent`]s for one request onto an
//! ordered channel: any number of chunks, then exactly one [`CompletionEvent::Done`].

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::types::{Message, Role};

/// Token accounting reported with the terminal event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One event of a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// Partial content, in generation order.
    Chunk(String),
    /// Terminal event carrying the full aggregated text.
    Done {
        content: String,
        model: String,
        usage: Usage,
    },
}

impl CompletionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CompletionEvent::Done { .. })
    }
}

/// Wire-neutral message handed to providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role(),
            content: message.content().to_string(),
        }
    }
}

/// Backend that generates a completion for a message history.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Model identifier requests are sent to.
    fn model(&self) -> &str;

    /// Stream one completion for `messages` into `events`.
    ///
    /// Must stop promptly once `cancel` fires. Returning without sending a
    /// terminal event is an error on the consumer side.
    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        events: mpsc::Sender<CompletionEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
