//! Console configuration loaded from TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::bridge::DEFAULT_CHANNEL_CAPACITY;
use crate::io::ollama::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::io::process::ProcessLimits;

/// Environment variable that overrides `ollama_url`.
pub const OLLAMA_URL_ENV: &str = "OLLAMA_URL";

/// Console configuration (TOML).
///
/// Missing fields default to values that work against a local Ollama server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Model used when `--model` is not given.
    pub model: String,

    /// Base URL of the Ollama server.
    pub ollama_url: String,

    /// Wall-clock limit for one script run, in seconds.
    pub exec_timeout_secs: u64,

    /// Truncate script stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Bound of the completion event channel.
    pub completion_channel_capacity: usize,

    /// Connect/list timeout for the model server, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            ollama_url: DEFAULT_BASE_URL.to_string(),
            exec_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            completion_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            request_timeout_secs: 30,
        }
    }
}

impl ConsoleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if self.ollama_url.trim().is_empty() {
            return Err(anyhow!("ollama_url must not be empty"));
        }
        if self.exec_timeout_secs == 0 {
            return Err(anyhow!("exec_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.completion_channel_capacity == 0 {
            return Err(anyhow!("completion_channel_capacity must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Apply command-line and environment overrides, then re-validate.
    ///
    /// A non-empty `model` flag beats the file; a non-empty `ollama_url` from
    /// the environment beats the file.
    pub fn with_overrides(mut self, model: Option<&str>, ollama_url: Option<&str>) -> Result<Self> {
        if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
            self.model = model.to_string();
        }
        if let Some(url) = ollama_url.map(str::trim).filter(|u| !u.is_empty()) {
            self.ollama_url = url.to_string();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn process_limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.exec_timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConsoleConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConsoleConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = ConsoleConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConsoleConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ConsoleConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "model = \"llama3.1:latest\"\nexec_timeout_secs = 5\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.model, "llama3.1:latest");
        assert_eq!(cfg.exec_timeout_secs, 5);
        assert_eq!(cfg.ollama_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.process_limits().timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "output_limit_bytes = 0\n").expect("write");

        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("output_limit_bytes must be > 0"));
    }

    #[test]
    fn overrides_take_precedence_when_non_empty() {
        let cfg = ConsoleConfig::default()
            .with_overrides(Some("mistral"), Some("http://gpu-box:11434"))
            .expect("overrides");
        assert_eq!(cfg.model, "mistral");
        assert_eq!(cfg.ollama_url, "http://gpu-box:11434");

        let cfg = ConsoleConfig::default()
            .with_overrides(Some(""), None)
            .expect("overrides");
        assert_eq!(cfg.model, DEFAULT_MODEL);
    }
}
