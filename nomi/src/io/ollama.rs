//! Ollama chat provider.
//!
//! Talks to a running Ollama server over HTTP. Chat responses are streamed as
//! newline-delimited JSON frames and forwarded as [`CompletionEvent`]s.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cancel::Cancelled;
use crate::io::completion::{ChatMessage, CompletionEvent, CompletionProvider, Usage};

pub const DEFAULT_MODEL: &str = "llama3.2:latest";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// One newline-delimited frame of a streamed `/api/chat` response.
#[derive(Debug, Default, Deserialize)]
struct ChatFrame {
    #[serde(default)]
    message: Option<FrameMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FrameMessage {
    #[serde(default)]
    content: String,
}

/// Accumulates streamed content and turns frames into events.
#[derive(Debug)]
struct StreamState {
    model: String,
    aggregated: String,
    pending: Vec<u8>,
}

impl StreamState {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            aggregated: String::new(),
            pending: Vec::new(),
        }
    }

    /// Feed raw bytes; returns the complete lines now available.
    fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(line);
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline.
    fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            self.pending.clear();
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Parse one line into an event. Blank lines yield nothing.
    fn apply_line(&mut self, line: &[u8]) -> Result<Option<CompletionEvent>> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let frame: ChatFrame = serde_json::from_str(text).context("parse chat frame")?;
        if let Some(err) = frame.error {
            bail!("ollama error: {err}");
        }
        let content = frame.message.map(|m| m.content).unwrap_or_default();
        if frame.done {
            self.aggregated.push_str(&content);
            return Ok(Some(CompletionEvent::Done {
                content: self.aggregated.clone(),
                model: self.model.clone(),
                usage: Usage {
                    prompt_tokens: frame.prompt_eval_count.unwrap_or(0),
                    completion_tokens: frame.eval_count.unwrap_or(0),
                },
            }));
        }
        self.aggregated.push_str(&content);
        Ok(Some(CompletionEvent::Chunk(content)))
    }
}

/// HTTP client for one model on one Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    request_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .context("build http client")?;
        let model = if model.trim().is_empty() {
            DEFAULT_MODEL
        } else {
            model
        };
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            model: model.to_string(),
            request_timeout,
        })
    }

    fn api_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}{path}")
    }

    /// Names of the models available on the server.
    #[instrument(skip_all, fields(base_url = %self.base_url))]
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.api_url("/api/tags"))
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| {
                format!(
                    "connect to ollama at {} (is `ollama serve` running?)",
                    self.base_url
                )
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("ollama list models failed ({status}): {body}");
        }
        let tags: TagsResponse = response.json().await.context("parse model list")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    pub async fn has_model(&self) -> Result<bool> {
        let models = self.list_models().await?;
        debug!(available = models.len(), "listed models");
        Ok(models.iter().any(|name| name == &self.model))
    }

    /// Download the configured model. Blocks until the server finishes.
    #[instrument(skip_all, fields(model = %self.model))]
    pub async fn pull_model(&self) -> Result<()> {
        info!("pulling model");
        let response = self
            .client
            .post(self.api_url("/api/pull"))
            .json(&PullRequest {
                model: &self.model,
                stream: false,
            })
            .send()
            .await
            .context("send pull request")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("ollama pull {} failed ({status}): {body}", self.model);
        }
        info!("model pulled");
        Ok(())
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        events: mpsc::Sender<CompletionEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
            format: "json",
        };
        let send = self.client.post(self.api_url("/api/chat")).json(&request).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            response = send => response.context("send chat request")?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("ollama chat failed ({status}): {body}");
        }

        let mut state = StreamState::new(&self.model);
        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                next = body.next() => next,
            };
            let Some(bytes) = next else {
                break;
            };
            let bytes = bytes.context("read chat stream")?;
            for line in state.push_bytes(&bytes) {
                if forward(&mut state, &line, &events).await? {
                    return Ok(());
                }
            }
        }

        if let Some(rest) = state.take_remainder() {
            forward(&mut state, &rest, &events).await?;
        }
        Ok(())
    }
}

/// Send the event for `line`, if any. Returns true once the terminal event went out.
async fn forward(
    state: &mut StreamState,
    line: &[u8],
    events: &mpsc::Sender<CompletionEvent>,
) -> Result<bool> {
    let Some(event) = state.apply_line(line)? else {
        return Ok(false);
    };
    let terminal = event.is_terminal();
    // A closed receiver means the caller stopped waiting for this request.
    events.send(event).await.map_err(|_| Cancelled)?;
    Ok(terminal)
}
