//! Dispatch of extracted code blocks to registered executors.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cancel::{Cancelled, is_cancelled};
use crate::core::types::{CodeBlock, ExecutionResult, Os};
use crate::io::executor::ExecutorRegistry;
use crate::io::process::ProcessLimits;

/// Routes code blocks to executors, enforcing platform restrictions.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ExecutorRegistry>,
    os: Os,
    limits: ProcessLimits,
}

impl Dispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>, limits: ProcessLimits) -> Self {
        Self {
            registry,
            os: Os::current(),
            limits,
        }
    }

    /// Dispatch as if running on `os`.
    pub fn with_os(mut self, os: Os) -> Self {
        self.os = os;
        self
    }

    pub fn os(&self) -> Os {
        self.os
    }

    /// Language tags that can actually run on this dispatcher's OS.
    pub fn languages(&self) -> Vec<&str> {
        self.registry.languages_for(self.os)
    }

    /// Run `block` and normalize the outcome.
    ///
    /// Unsupported languages, platform mismatches, and interpreter failures
    /// all come back as results with a non-zero exit code. The only error is
    /// cancellation.
    #[instrument(skip_all, fields(language = %block.language))]
    pub async fn execute(
        &self,
        block: CodeBlock,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let Some(registration) = self.registry.get(&block.language) else {
            debug!("no executor registered");
            let reason = format!("unsupported language: {}", block.language);
            return Ok(ExecutionResult::rejected(block, reason));
        };

        if let Some(only_on) = registration.only_on
            && only_on != self.os
        {
            debug!(required = %only_on, current = %self.os, "platform mismatch");
            let reason = format!("{} is only supported on {only_on}", block.language);
            return Ok(ExecutionResult::rejected(block, reason));
        }

        let executor = Arc::clone(&registration.executor);
        let code = block.code.clone();
        let limits = self.limits.clone();
        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || executor.run(&code, &limits, &token));
        // A result that lands after cancellation is dropped with the task handle.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancelled while executor was running");
                return Err(Cancelled.into());
            }
            joined = task => joined.context("join executor task")?,
        };

        match outcome {
            Ok(output) => Ok(ExecutionResult {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
                block,
            }),
            Err(err) if is_cancelled(&err) => Err(err),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "executor failed");
                Ok(ExecutionResult::rejected(block, format!("{err:#}")))
            }
        }
    }
}
