//! Parsing of the model's structured decision payload.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;

use crate::core::fence::{is_fenced, wrap_in_fence};

const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");

static DECISION_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(DECISION_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| err.to_string())
});

/// What the model decided to do this turn.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Decision {
    /// Ask the user a clarifying question.
    Ask { question: String },
    /// Run a script.
    Code {
        #[serde(default)]
        language: String,
        #[serde(default)]
        code: String,
    },
}

impl Decision {
    /// Code text ready for extraction.
    ///
    /// Bare scripts are wrapped in a fence tagged with `language` so the
    /// extractor sees one shape regardless of how the model answered.
    pub fn fenced_code(&self) -> Option<String> {
        match self {
            Decision::Ask { .. } => None,
            Decision::Code { language, code } => {
                if !language.is_empty() && !code.is_empty() && !is_fenced(code) {
                    Some(wrap_in_fence(language, code))
                } else {
                    Some(code.clone())
                }
            }
        }
    }
}

/// Parse raw model text into a [`Decision`].
///
/// The payload is checked against the decision schema before the typed parse.
pub fn parse_decision(raw: &str) -> Result<Decision> {
    let value: Value = serde_json::from_str(raw.trim()).context("parse decision json")?;
    let validator = match &*DECISION_VALIDATOR {
        Ok(validator) => validator,
        Err(err) => bail!("compile decision schema: {err}"),
    };
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("decision schema validation failed:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(value).context("parse decision")
}
