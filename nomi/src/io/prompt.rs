//! Prompt rendering: platform instructions and execution reports.

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{ExecutionResult, Os};

const CONSOLE_LINUX_TEMPLATE: &str = include_str!("prompts/console_linux.md");
const CONSOLE_MACOS_TEMPLATE: &str = include_str!("prompts/console_macos.md");
const EXECUTION_REPORT_TEMPLATE: &str = include_str!("prompts/execution_report.md");

/// One executed block as seen by the report template.
#[derive(Debug, Clone, Serialize)]
struct ReportEntry<'a> {
    language: &'a str,
    code: &'a str,
    exit_code: i32,
    stdout: &'a str,
    stderr: &'a str,
}

impl<'a> From<&'a ExecutionResult> for ReportEntry<'a> {
    fn from(result: &'a ExecutionResult) -> Self {
        Self {
            language: &result.block.language,
            code: &result.block.code,
            exit_code: result.exit_code,
            stdout: &result.stdout,
            stderr: &result.stderr,
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("console_linux", CONSOLE_LINUX_TEMPLATE)
            .context("load linux console template")?;
        env.add_template("console_macos", CONSOLE_MACOS_TEMPLATE)
            .context("load macos console template")?;
        env.add_template("execution_report", EXECUTION_REPORT_TEMPLATE)
            .context("load execution report template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {name} template"))?;
        Ok(rendered)
    }
}

/// System instructions for `os`, listing the `languages` runnable there.
///
/// Only Linux and macOS have instructions; any other OS is an error.
pub fn system_instruction(os: Os, languages: &[&str]) -> Result<String> {
    let name = match os {
        Os::Linux => "console_linux",
        Os::MacOs => "console_macos",
        other => bail!("unsupported OS: {other}"),
    };
    let rendered = PromptEngine::new()?.render(name, context! { languages => languages })?;
    debug!(template = name, bytes = rendered.len(), "rendered system instruction");
    Ok(rendered)
}

/// Report for the model (and the log) summarizing every executed block.
pub fn render_execution_report(results: &[ExecutionResult]) -> Result<String> {
    let entries: Vec<ReportEntry<'_>> = results.iter().map(ReportEntry::from).collect();
    let succeeded = results.iter().filter(|r| r.success()).count();
    PromptEngine::new()?.render(
        "execution_report",
        context! {
            results => entries,
            succeeded => succeeded,
        },
    )
}
