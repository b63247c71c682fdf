//! JSON Schema validation for test cases and model outputs.
//!
//! Test case documents are checked against the embedded
//! `schema/test_case.schema.json`. Model outputs are checked against the
//! per-test-case `output_schema`, compiled on demand.

use std::sync::OnceLock;
use thiserror::Error;

use crate::scoring::ScoringError;

/// Embedded test case schema (loaded at compile time).
const TEST_CASE_SCHEMA_JSON: &str = include_str!("../../schema/test_case.schema.json");

/// Compiled test case validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors from schema loading.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

fn get_validator() -> Result<&'static jsonschema::Validator, SchemaError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(TEST_CASE_SCHEMA_JSON) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(SchemaError::LoadError(e.clone())),
    }
}

/// Validate a test case document against the embedded schema.
pub fn validate_test_case_schema(document: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(document)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check a parsed model output against a test case's output schema.
///
/// Returns the list of violations (empty when valid). A schema that does not
/// compile is a malformed expectation.
pub fn validate_output(
    schema: &serde_json::Value,
    output: &serde_json::Value,
) -> Result<Vec<String>, ScoringError> {
    let validator = jsonschema::options()
        .build(schema)
        .map_err(|e| ScoringError::MalformedExpectedValue(format!("invalid output schema: {}", e)))?;

    Ok(validator
        .iter_errors(output)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_test_case_passes() {
        let doc = json!({
            "id": "tc-1",
            "title": "Capital",
            "prompt": "What is the capital of France?",
            "expected_output": "Paris"
        });
        assert!(validate_test_case_schema(&doc).is_ok());
    }

    #[test]
    fn test_missing_expected_output_fails() {
        let doc = json!({
            "id": "tc-1",
            "title": "Capital",
            "prompt": "What is the capital of France?"
        });
        let errors = validate_test_case_schema(&doc).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_unknown_field_fails() {
        let doc = json!({
            "id": "tc-1",
            "title": "Capital",
            "prompt": "p",
            "expected_output": 1,
            "difficulty": "hard"
        });
        assert!(validate_test_case_schema(&doc).is_err());
    }

    #[test]
    fn test_zero_timeout_fails() {
        let doc = json!({
            "id": "tc-1",
            "title": "Capital",
            "prompt": "p",
            "expected_output": 1,
            "timeout_seconds": 0
        });
        assert!(validate_test_case_schema(&doc).is_err());
    }

    #[test]
    fn test_output_validation_reports_violations() {
        let schema = json!({
            "type": "object",
            "properties": { "age": { "type": "integer" } },
            "required": ["age"]
        });
        assert!(validate_output(&schema, &json!({"age": 3})).unwrap().is_empty());
        let violations = validate_output(&schema, &json!({"age": "three"})).unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("age"));
    }
}
