//! Aggregates a streamed completion into a single decision string.
//!
//! The provider runs on its own task and feeds a bounded channel. The caller
//! awaits one call and gets either the terminal text or an error.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::cancel::{Cancelled, is_cancelled};
use crate::core::conversation::Conversation;
use crate::core::fence::strip_json_fences;
use crate::io::completion::{ChatMessage, CompletionEvent, CompletionProvider};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Turns a provider's event stream into one awaited call.
pub struct CompletionBridge<P: ?Sized> {
    provider: Arc<P>,
    capacity: usize,
}

impl<P: CompletionProvider + ?Sized + 'static> CompletionBridge<P> {
    pub fn new(provider: Arc<P>, capacity: usize) -> Self {
        Self {
            provider,
            capacity: capacity.max(1),
        }
    }

    /// Request a completion for the whole conversation and wait for the terminal event.
    ///
    /// Chunks are only traced. Markdown JSON fences are stripped from the
    /// returned text. A stream that closes without a terminal event is an
    /// error, never an empty success.
    #[instrument(skip_all, fields(model = %self.provider.model(), messages = conversation.len()))]
    pub async fn complete(
        &self,
        conversation: &Conversation,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let messages: Vec<ChatMessage> = conversation
            .messages()
            .iter()
            .map(ChatMessage::from)
            .collect();
        let (tx, mut rx) = mpsc::channel(self.capacity);

        // Scoped to this request: dropping the guard stops a provider that is
        // still running after we return.
        let request_cancel = cancel.child_token();
        let _request_guard = request_cancel.clone().drop_guard();
        let provider = Arc::clone(&self.provider);
        let producer = tokio::spawn(async move {
            provider
                .stream_completion(messages, tx, request_cancel)
                .await
        });

        let mut chunks = 0usize;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    producer.abort();
                    return Err(Cancelled.into());
                }
                event = rx.recv() => event,
            };
            match event {
                Some(CompletionEvent::Chunk(text)) => {
                    chunks += 1;
                    trace!(chunk = %text, "completion chunk");
                }
                Some(CompletionEvent::Done {
                    content,
                    model,
                    usage,
                }) => {
                    debug!(
                        chunks,
                        model = %model,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        "completion finished"
                    );
                    return Ok(strip_json_fences(&content));
                }
                None => break,
            }
        }

        let produced = producer.await.context("join completion task")?;
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        match produced {
            Err(err) if is_cancelled(&err) => Err(err),
            Err(err) => Err(err.context("generate completion")),
            Ok(()) => bail!("completion stream closed without a terminal event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Message;
    use crate::io::completion::Usage;
    use async_trait::async_trait;
    use std::time::Duration;

    enum Behavior {
        Events(Vec<CompletionEvent>),
        Fail(&'static str),
        Hang,
    }

    struct FakeProvider {
        behavior: Behavior,
    }

    #[async_trait]
    impl CompletionProvider for FakeProvider {
        fn model(&self) -> &str {
            "fake"
        }

        async fn stream_completion(
            &self,
            _messages: Vec<ChatMessage>,
            events: mpsc::Sender<CompletionEvent>,
            cancel: CancellationToken,
        ) -> Result<()> {
            match &self.behavior {
                Behavior::Events(list) => {
                    for event in list {
                        events.send(event.clone()).await?;
                    }
                    Ok(())
                }
                Behavior::Fail(message) => bail!("{message}"),
                Behavior::Hang => {
                    cancel.cancelled().await;
                    Err(Cancelled.into())
                }
            }
        }
    }

    fn bridge(behavior: Behavior) -> CompletionBridge<FakeProvider> {
        CompletionBridge::new(Arc::new(FakeProvider { behavior }), 2)
    }

    fn conversation() -> Conversation {
        let mut conversation = Conversation::new();
        conversation.add_message(Message::user("list files"));
        conversation
    }

    fn done(content: &str) -> CompletionEvent {
        CompletionEvent::Done {
            content: content.to_string(),
            model: "fake".to_string(),
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn returns_terminal_text_and_ignores_chunks() {
        let bridge = bridge(Behavior::Events(vec![
            CompletionEvent::Chunk("{\"action\"".to_string()),
            CompletionEvent::Chunk(":\"ask\"}".to_string()),
            CompletionEvent::Chunk("extra".to_string()),
            done("```json\n{\"action\":\"ask\",\"question\":\"?\"}\n```"),
        ]));

        let text = bridge
            .complete(&conversation(), &CancellationToken::new())
            .await
            .expect("complete");
        assert_eq!(text, "\n{\"action\":\"ask\",\"question\":\"?\"}\n");
    }

    #[tokio::test]
    async fn closed_stream_without_terminal_is_an_error() {
        let bridge = bridge(Behavior::Events(vec![CompletionEvent::Chunk(
            "partial".to_string(),
        )]));

        let err = bridge
            .complete(&conversation(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without a terminal event"));
    }

    #[tokio::test]
    async fn provider_error_is_surfaced() {
        let bridge = bridge(Behavior::Fail("connection refused"));

        let err = bridge
            .complete(&conversation(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!is_cancelled(&err));
        assert!(format!("{err:#}").contains("connection refused"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_hanging_provider() {
        let bridge = bridge(Behavior::Hang);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            bridge.complete(&conversation(), &cancel),
        )
        .await
        .expect("bridge returned before timeout")
        .unwrap_err();
        assert!(is_cancelled(&err));
    }
}
