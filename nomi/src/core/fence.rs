//! Fenced code block extraction.
//!
//! The first language tag seen in a response selects the language for the
//! whole response; blocks tagged with anything else are dropped. The model is
//! asked for one script per turn, so this keeps a single coherent script.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::CodeBlock;

pub const FENCE: &str = "```";

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?").expect("json fence pattern is valid"));

/// Extract fenced code blocks in the selected language, in encounter order.
///
/// An unterminated trailing block is kept. An empty body is kept as empty code.
pub fn extract_code_blocks(input: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut selected: Option<String> = None;
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in input.lines() {
        if let Some(rest) = line.strip_prefix(FENCE) {
            match current.take() {
                Some((language, lines)) => {
                    push_if_selected(&mut blocks, selected.as_deref(), language, &lines);
                }
                None => {
                    let language = rest.trim().to_string();
                    if selected.is_none() {
                        selected = Some(language.clone());
                    }
                    current = Some((language, Vec::new()));
                }
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some((language, lines)) = current {
        push_if_selected(&mut blocks, selected.as_deref(), language, &lines);
    }

    blocks
}

fn push_if_selected(
    blocks: &mut Vec<CodeBlock>,
    selected: Option<&str>,
    language: String,
    lines: &[&str],
) {
    if selected == Some(language.as_str()) {
        blocks.push(CodeBlock::new(language, lines.join("\n")));
    }
}

/// Whether `code` already starts with a fence marker.
pub fn is_fenced(code: &str) -> bool {
    code.starts_with(FENCE)
}

pub fn wrap_in_fence(language: &str, code: &str) -> String {
    format!("{FENCE}{language}\n{code}\n{FENCE}")
}

/// Remove ```` ```json ```` and bare ```` ``` ```` markers from `text`.
///
/// Markers inside JSON string literals belong to the payload (a fenced
/// script in the `code` field) and are kept. This deliberately differs from
/// stripping every marker, which would unfence a multi-block script and
/// collapse it into a single block.
pub fn strip_json_fences(text: &str) -> String {
    let literals = string_literal_spans(text);
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for marker in JSON_FENCE.find_iter(text) {
        if literals.iter().any(|span| span.contains(&marker.start())) {
            continue;
        }
        out.push_str(&text[last..marker.start()]);
        last = marker.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Byte ranges of double-quoted literals; an unterminated literal runs to the end.
fn string_literal_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut open: Option<usize> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        match open {
            None if c == '"' => open = Some(i),
            None => {}
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(start) if c == '"' => {
                spans.push(start..i + 1);
                open = None;
            }
            Some(_) => {}
        }
    }
    if let Some(start) = open {
        spans.push(start..text.len());
    }
    spans
}
