//! Turn controller for one console session.
//!
//! A session alternates between the user and the model until the user stops
//! after a successful run, a fatal error occurs, or the cancellation token
//! fires:
//!
//! ```text
//! AwaitingUserInput -> AwaitingCompletion -> Deciding
//!     Deciding -> AwaitingClarification -> AwaitingUserInput
//!     Deciding -> ExecutingCode -> AwaitingCompletion      (no block succeeded)
//!     Deciding -> ExecutingCode -> AwaitingUserInput       (user continues)
//!     Deciding -> ExecutingCode -> Terminated              (user stops)
//! ```

use std::io::Write;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cancel::Cancelled;
use crate::core::budget::FailureBudget;
use crate::core::conversation::Conversation;
use crate::core::decision::{Decision, parse_decision};
use crate::core::fence::extract_code_blocks;
use crate::core::types::{ExecutionResult, Message};
use crate::io::bridge::CompletionBridge;
use crate::io::completion::CompletionProvider;
use crate::io::dispatch::Dispatcher;
use crate::io::input::UserInput;
use crate::io::prompt::render_execution_report;

pub const INPUT_PROMPT: &str = ">>> ";
pub const CONTINUE_LABEL: &str = "Do you want to continue?";
pub const STUCK_MESSAGE: &str = "Too many errors, how can I help you?";

/// Where the controller is in the turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingUserInput,
    AwaitingCompletion,
    Deciding,
    ExecutingCode,
    AwaitingClarification,
    Terminated,
}

/// Summary of a session that ended because the user stopped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Completion requests sent to the model.
    pub completions: u32,
    /// Code blocks handed to the dispatcher.
    pub executed_blocks: u32,
}

enum Flow {
    Continue,
    Finished,
}

/// Drives one conversation between the user, the model and the executors.
///
/// The session owns its [`Conversation`]; nothing else can mutate it while
/// the session runs.
pub struct Session<'a, P: ?Sized, I, W> {
    bridge: &'a CompletionBridge<P>,
    dispatcher: &'a Dispatcher,
    input: &'a mut I,
    out: W,
    conversation: Conversation,
    budget: FailureBudget,
    state: TurnState,
    completions: u32,
    executed_blocks: u32,
}

impl<'a, P, I, W> Session<'a, P, I, W>
where
    P: CompletionProvider + ?Sized + 'static,
    I: UserInput,
    W: Write,
{
    /// Create a session primed with `instruction` as its only system message.
    pub fn new(
        bridge: &'a CompletionBridge<P>,
        dispatcher: &'a Dispatcher,
        input: &'a mut I,
        out: W,
        instruction: String,
    ) -> Self {
        let mut conversation = Conversation::new();
        conversation.add_message(Message::system(instruction));
        Self {
            bridge,
            dispatcher,
            input,
            out,
            conversation,
            budget: FailureBudget::default(),
            state: TurnState::AwaitingUserInput,
            completions: 0,
            executed_blocks: 0,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.budget.consecutive()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Run the session to completion.
    ///
    /// Returns `Ok` only when the user declines to continue after a
    /// successful run. Cancellation is returned as a [`Cancelled`] error.
    #[instrument(skip_all)]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<SessionOutcome> {
        info!("starting console session");
        self.read_user_message(cancel).await?;

        loop {
            if cancel.is_cancelled() {
                self.enter(TurnState::Terminated);
                return Err(Cancelled.into());
            }

            if self.budget.is_exhausted() {
                info!(
                    failures = self.budget.consecutive(),
                    "failure budget exhausted, asking user for direction"
                );
                self.say(STUCK_MESSAGE)?;
                self.read_user_message(cancel).await?;
                self.budget.reset();
                continue;
            }

            let decision = self.request_decision(cancel).await?;
            let flow = match decision {
                Decision::Ask { question } => self.clarify(&question, cancel).await?,
                code @ Decision::Code { .. } => self.run_code(&code, cancel).await?,
            };
            if let Flow::Finished = flow {
                self.enter(TurnState::Terminated);
                return Ok(SessionOutcome {
                    completions: self.completions,
                    executed_blocks: self.executed_blocks,
                });
            }
        }
    }

    fn enter(&mut self, state: TurnState) {
        debug!(from = ?self.state, to = ?state, "turn state");
        self.state = state;
    }

    fn say(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{text}").context("write console output")
    }

    async fn read_user_message(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.enter(TurnState::AwaitingUserInput);
        let line = self
            .input
            .read_line(INPUT_PROMPT, cancel)
            .await
            .context("read input")?;
        self.conversation.add_message(Message::user(line));
        Ok(())
    }

    async fn request_decision(&mut self, cancel: &CancellationToken) -> Result<Decision> {
        self.enter(TurnState::AwaitingCompletion);
        debug!(messages = self.conversation.len(), "requesting completion");
        self.completions += 1;
        let raw = self
            .bridge
            .complete(&self.conversation, cancel)
            .await
            .context("request model decision")?;
        self.conversation.add_message(Message::assistant(raw.clone()));

        self.enter(TurnState::Deciding);
        let decision = parse_decision(&raw).context("parse model decision")?;
        debug!(?decision, "received decision");
        Ok(decision)
    }

    async fn clarify(&mut self, question: &str, cancel: &CancellationToken) -> Result<Flow> {
        self.enter(TurnState::AwaitingClarification);
        self.say(question)?;
        self.read_user_message(cancel).await?;
        Ok(Flow::Continue)
    }

    async fn run_code(&mut self, decision: &Decision, cancel: &CancellationToken) -> Result<Flow> {
        self.enter(TurnState::ExecutingCode);
        let code = decision.fenced_code().unwrap_or_default();
        let blocks = extract_code_blocks(&code);
        if blocks.is_empty() {
            info!("no code blocks found");
            return Ok(Flow::Continue);
        }

        let mut results: Vec<ExecutionResult> = Vec::with_capacity(blocks.len());
        for block in blocks {
            self.executed_blocks += 1;
            let result = self.dispatcher.execute(block, cancel).await?;
            self.say(&format!(
                "Received ({}): {}\n{}",
                result.exit_code, result.stdout, result.stderr
            ))?;
            results.push(result);
        }

        // First success in block order decides the turn; later blocks are not inspected.
        let first_success = results.iter().position(ExecutionResult::success);

        let report = render_execution_report(&results)?;
        self.conversation.add_message(Message::assistant(report));

        let Some(index) = first_success else {
            self.budget.record_failure();
            info!(
                failures = self.budget.consecutive(),
                "code execution failed"
            );
            return Ok(Flow::Continue);
        };

        info!(block = index, "code execution succeeded");
        self.budget.reset();
        self.enter(TurnState::AwaitingUserInput);
        let keep_going = self
            .input
            .confirm(CONTINUE_LABEL, false, cancel)
            .await
            .context("confirm continue")?;
        if !keep_going {
            return Ok(Flow::Finished);
        }
        self.read_user_message(cancel).await?;
        Ok(Flow::Continue)
    }
}
