//! Extraction of a structured value from free-form model output.
//!
//! Strategies are tried in a fixed order and the first success wins:
//! 1. the whole trimmed text as JSON
//! 2. the body of a fenced ```json block
//! 3. the first balanced `{...}` or `[...]` substring that parses
//! 4. the trimmed text itself as an opaque string
//!
//! The last strategy always succeeds, so parsing never fails.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

lazy_static! {
    /// Fenced code block tagged as JSON.
    pub static ref FENCED_JSON: Regex =
        Regex::new(r"(?is)```json\s*(.*?)\s*```").unwrap();
}

/// Which strategy produced the parsed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    WholeText,
    FencedBlock,
    EmbeddedValue,
    RawText,
}

/// A parsed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub value: JsonValue,
    pub strategy: ParseStrategy,
}

/// Parse a model response into a structured value.
pub fn parse_response(text: &str) -> ParsedResponse {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) {
        return ParsedResponse {
            value,
            strategy: ParseStrategy::WholeText,
        };
    }

    if let Some(value) = FENCED_JSON
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .and_then(|body| serde_json::from_str::<JsonValue>(body.as_str()).ok())
    {
        return ParsedResponse {
            value,
            strategy: ParseStrategy::FencedBlock,
        };
    }

    if let Some(value) = find_embedded_value(trimmed) {
        return ParsedResponse {
            value,
            strategy: ParseStrategy::EmbeddedValue,
        };
    }

    ParsedResponse {
        value: JsonValue::String(trimmed.to_string()),
        strategy: ParseStrategy::RawText,
    }
}

/// Find the first balanced object or array in `text` that parses as JSON.
fn find_embedded_value(text: &str) -> Option<JsonValue> {
    for (start, ch) in text.char_indices() {
        let close = match ch {
            '{' => '}',
            '[' => ']',
            _ => continue,
        };
        if let Some(end) = balanced_end(&text[start..], ch, close) {
            if let Ok(value) = serde_json::from_str::<JsonValue>(&text[start..start + end]) {
                return Some(value);
            }
        }
    }
    None
}

/// Byte length of the balanced span starting at the first char of `text`,
/// ignoring delimiters inside string literals.
fn balanced_end(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(idx + ch.len_utf8());
            }
        }
    }
    None
}
