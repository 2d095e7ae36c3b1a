//! Cancellable user input.
//!
//! Reads happen on a detached thread that hands the line back over a oneshot
//! channel. If cancellation wins the race, the receiver is dropped and the
//! late line is discarded.

use std::io::{BufRead, Write};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::Cancelled;

/// Source of user text for the console.
#[async_trait]
pub trait UserInput: Send {
    /// Show `prompt` and wait for one line (without its newline).
    async fn read_line(&mut self, prompt: &str, cancel: &CancellationToken) -> Result<String>;

    /// Ask a yes/no question; an empty answer picks `default`.
    async fn confirm(
        &mut self,
        label: &str,
        default: bool,
        cancel: &CancellationToken,
    ) -> Result<bool>;
}

/// Parse a yes/no answer. `None` means the answer was not understood.
pub fn parse_yes_no(answer: &str, default: bool) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Reads from the process's stdin and prompts on stdout.
#[derive(Debug, Default)]
pub struct StdinInput;

impl StdinInput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UserInput for StdinInput {
    async fn read_line(&mut self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let mut stdout = std::io::stdout();
        write!(stdout, "{prompt}").context("write prompt")?;
        stdout.flush().context("flush prompt")?;

        let (tx, rx) = oneshot::channel();
        thread::spawn(move || {
            let mut line = String::new();
            let read = std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map(|n| (n, line));
            // Nobody is listening if the caller was cancelled first.
            let _ = tx.send(read);
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("input read cancelled");
                Err(Cancelled.into())
            }
            read = rx => {
                let (n, line) = read
                    .map_err(|_| anyhow!("input reader stopped"))?
                    .context("read input")?;
                if n == 0 {
                    bail!("input closed");
                }
                Ok(line.trim_end_matches(['\r', '\n']).to_string())
            }
        }
    }

    async fn confirm(
        &mut self,
        label: &str,
        default: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let prompt = format!("{label} {hint} ");
        loop {
            let answer = self.read_line(&prompt, cancel).await?;
            match parse_yes_no(&answer, default) {
                Some(choice) => return Ok(choice),
                None => println!("Please answer yes or no."),
            }
        }
    }
}
