//! Per-language script executors and the registry that maps tags to them.
//!
//! The [`LanguageExecutor`] trait decouples dispatch from the actual
//! interpreter. Tests register scripted executors that return predetermined
//! outputs without spawning processes.

use std::collections::HashMap;
use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::types::Os;
use crate::io::process::{ProcessLimits, run_command};

/// Exit code reported when a script was killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the interpreter ended without one (killed by a signal).
pub const NO_EXIT_CODE: i32 = -1;

/// Captured output of one script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs code text in one interpreter.
///
/// Implementations must not share mutable state with each other. A non-zero
/// exit code is an `Ok` value; `Err` is reserved for cancellation and for
/// failures to run the interpreter at all.
pub trait LanguageExecutor: Send + Sync {
    fn run(
        &self,
        code: &str,
        limits: &ProcessLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;
}

/// Executor that writes the script to a temp file and runs an interpreter on it.
#[derive(Debug, Clone)]
pub struct InterpreterExecutor {
    program: String,
    args: Vec<String>,
    extension: String,
}

impl InterpreterExecutor {
    pub fn new(program: &str, args: &[&str], extension: &str) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            extension: extension.to_string(),
        }
    }
}

impl LanguageExecutor for InterpreterExecutor {
    #[instrument(skip_all, fields(program = %self.program))]
    fn run(
        &self,
        code: &str,
        limits: &ProcessLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        // The temp file is removed when `script` drops, whatever the outcome.
        let mut script = tempfile::Builder::new()
            .prefix("nomi-")
            .suffix(&self.extension)
            .tempfile()
            .context("create script file")?;
        script
            .write_all(code.as_bytes())
            .context("write script file")?;
        script.flush().context("flush script file")?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(script.path());

        let output = run_command(cmd, limits, cancel)
            .with_context(|| format!("run {}", self.program))?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&output.stdout_truncated_notice());
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        stderr.push_str(&output.stderr_truncated_notice());

        let exit_code = if output.timed_out {
            warn!(timeout_secs = limits.timeout.as_secs(), "script timed out");
            stderr.push_str(&format!(
                "\n[timed out after {}s]\n",
                limits.timeout.as_secs()
            ));
            TIMEOUT_EXIT_CODE
        } else {
            output.status.code().unwrap_or(NO_EXIT_CODE)
        };

        debug!(exit_code, "script finished");
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// A registered executor plus the one OS it is restricted to, if any.
#[derive(Clone)]
pub struct Registration {
    pub executor: Arc<dyn LanguageExecutor>,
    pub only_on: Option<Os>,
}

/// Fixed mapping from language tag to executor.
///
/// Built once at startup and shared by reference; adding a language is a
/// `register` call and never touches dispatch.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    entries: HashMap<String, Registration>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the interpreters the console ships with.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("bash", InterpreterExecutor::new("bash", &[], ".sh"), None)
            .register("sh", InterpreterExecutor::new("sh", &[], ".sh"), None)
            .register("python", InterpreterExecutor::new("python3", &[], ".py"), None)
            .register("python3", InterpreterExecutor::new("python3", &[], ".py"), None)
            .register(
                "osascript",
                InterpreterExecutor::new("osascript", &[], ".applescript"),
                Some(Os::MacOs),
            )
            .register(
                "powershell",
                InterpreterExecutor::new(
                    "powershell",
                    &["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"],
                    ".ps1",
                ),
                Some(Os::Windows),
            );
        registry
    }

    /// Register `executor` for `language`, replacing any earlier registration.
    pub fn register<E: LanguageExecutor + 'static>(
        &mut self,
        language: &str,
        executor: E,
        only_on: Option<Os>,
    ) -> &mut Self {
        self.entries.insert(
            language.to_string(),
            Registration {
                executor: Arc::new(executor),
                only_on,
            },
        );
        self
    }

    pub fn get(&self, language: &str) -> Option<&Registration> {
        self.entries.get(language)
    }

    /// Sorted language tags runnable on `os`.
    pub fn languages_for(&self, os: Os) -> Vec<&str> {
        let mut languages: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, reg)| reg.only_on.is_none_or(|only| only == os))
            .map(|(language, _)| language.as_str())
            .collect();
        languages.sort_unstable();
        languages
    }
}
