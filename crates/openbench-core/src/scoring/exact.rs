//! Case-insensitive exact matching.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What was compared for an exact match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactMatchDetail {
    pub matched: bool,
    /// Canonical forms; absent when both sides were mappings.
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Two mappings are compared for direct equality. Anything else is reduced
/// to trimmed lower-case text, unwrapping a `{"value": ...}` expected value.
pub fn exact_match(actual: &JsonValue, expected: &JsonValue) -> ExactMatchDetail {
    if actual.is_object() && expected.is_object() {
        return ExactMatchDetail {
            matched: actual == expected,
            expected: None,
            actual: None,
        };
    }

    let expected = match expected {
        JsonValue::Object(map) => map.get("value").unwrap_or(expected),
        other => other,
    };

    let expected_text = canonical_text(expected);
    let actual_text = canonical_text(actual);
    ExactMatchDetail {
        matched: expected_text == actual_text,
        expected: Some(expected_text),
        actual: Some(actual_text),
    }
}

fn canonical_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_lowercase(),
        other => other.to_string().trim().to_lowercase(),
    }
}
