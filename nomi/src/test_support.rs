//! Scripted doubles for driving a session without a model server, a
//! terminal, or real interpreters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cancel::Cancelled;
use crate::io::completion::{ChatMessage, CompletionEvent, CompletionProvider, Usage};
use crate::io::executor::{ExecOutput, LanguageExecutor};
use crate::io::input::UserInput;
use crate::io::process::ProcessLimits;

/// One scripted reply from [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedCompletion {
    /// Stream the text as a chunk, then as the terminal event.
    Reply(String),
    /// Fail the request with this message.
    Fail(String),
    /// Never answer; wait for cancellation.
    Hang,
}

impl ScriptedCompletion {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }
}

/// JSON for an `ask` decision.
pub fn ask_json(question: &str) -> String {
    serde_json::json!({ "action": "ask", "question": question }).to_string()
}

/// JSON for a `code` decision.
pub fn code_json(language: &str, code: &str) -> String {
    serde_json::json!({ "action": "code", "language": language, "code": code }).to_string()
}

/// Completion provider that replays a fixed queue of replies.
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedCompletion>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedCompletion>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of completion requests received so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Message histories of every request, in order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        events: mpsc::Sender<CompletionEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(messages);
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow!("replies lock poisoned"))?
            .pop_front();

        match next {
            Some(ScriptedCompletion::Reply(text)) => {
                events.send(CompletionEvent::Chunk(text.clone())).await?;
                events
                    .send(CompletionEvent::Done {
                        content: text,
                        model: "scripted".to_string(),
                        usage: Usage::default(),
                    })
                    .await?;
                Ok(())
            }
            Some(ScriptedCompletion::Fail(message)) => bail!("{message}"),
            Some(ScriptedCompletion::Hang) => {
                cancel.cancelled().await;
                Err(Cancelled.into())
            }
            None => bail!("scripted provider has no replies left"),
        }
    }
}

/// User input that replays queued lines and confirmations.
///
/// Every prompt shown is recorded. Running out of script is an error unless
/// the input was built with [`ScriptedInput::waiting_when_exhausted`].
#[derive(Debug, Default)]
pub struct ScriptedInput {
    lines: VecDeque<String>,
    confirms: VecDeque<bool>,
    prompts: Vec<String>,
    wait_when_exhausted: bool,
}

impl ScriptedInput {
    pub fn new<S: Into<String>>(lines: Vec<S>, confirms: Vec<bool>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            confirms: confirms.into(),
            prompts: Vec::new(),
            wait_when_exhausted: false,
        }
    }

    /// Once the lines run out, block like an idle terminal until cancelled.
    pub fn waiting_when_exhausted(mut self) -> Self {
        self.wait_when_exhausted = true;
        self
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn remaining_lines(&self) -> usize {
        self.lines.len()
    }
}

#[async_trait]
impl UserInput for ScriptedInput {
    async fn read_line(&mut self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.prompts.push(prompt.to_string());
        match self.lines.pop_front() {
            Some(line) => Ok(line),
            None if self.wait_when_exhausted => {
                cancel.cancelled().await;
                Err(Cancelled.into())
            }
            None => bail!("scripted input has no lines left"),
        }
    }

    async fn confirm(
        &mut self,
        label: &str,
        _default: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.prompts.push(label.to_string());
        self.confirms
            .pop_front()
            .ok_or_else(|| anyhow!("scripted input has no confirmations left"))
    }
}

/// Language executor that returns queued exit codes and counts runs.
///
/// Once the queue is empty every run exits 0. A blocking executor never
/// finishes on its own; each run waits for cancellation.
#[derive(Debug, Default, Clone)]
pub struct ScriptedLanguageExecutor {
    exit_codes: Arc<Mutex<VecDeque<i32>>>,
    runs: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<String>>>,
    blocking: bool,
}

impl ScriptedLanguageExecutor {
    pub fn new(exit_codes: Vec<i32>) -> Self {
        Self {
            exit_codes: Arc::new(Mutex::new(exit_codes.into())),
            ..Self::default()
        }
    }

    /// An executor whose runs only end when the token fires.
    pub fn blocking_until_cancelled() -> Self {
        Self {
            blocking: true,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Code of every run, in order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl LanguageExecutor for ScriptedLanguageExecutor {
    fn run(
        &self,
        code: &str,
        _limits: &ProcessLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .map_err(|_| anyhow!("seen lock poisoned"))?
            .push(code.to_string());
        if self.blocking {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(10));
            }
            return Err(Cancelled.into());
        }
        let exit_code = self
            .exit_codes
            .lock()
            .map_err(|_| anyhow!("exit code lock poisoned"))?
            .pop_front()
            .unwrap_or(0);
        Ok(ExecOutput {
            stdout: format!("ran: {code}"),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("exit {exit_code}")
            },
            exit_code,
        })
    }
}
