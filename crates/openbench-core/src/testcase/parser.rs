//! Test case parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::schema::validate_test_case_schema;
use crate::scoring::{ScoringConfig, ScoringError};
use crate::types::EvaluationType;

/// Errors that can occur when loading test cases.
#[derive(Error, Debug)]
pub enum TestCaseError {
    #[error("Failed to read test case file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Test case validation failed: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Scoring(#[from] ScoringError),
}

/// A prompt with its expected output and scoring rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub category: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// User prompt sent to every model
    pub prompt: String,

    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Value the parsed response is compared against
    pub expected_output: JsonValue,

    /// Optional JSON Schema the parsed response should satisfy
    #[serde(default)]
    pub output_schema: Option<JsonValue>,

    #[serde(default = "default_evaluation_type")]
    pub evaluation_type: EvaluationType,

    /// Overrides for [`ScoringConfig`]
    #[serde(default)]
    pub evaluation_config: Option<JsonValue>,

    /// Per-task timeout override
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_evaluation_type() -> EvaluationType {
    EvaluationType::StructuredMatch
}

impl TestCase {
    /// Create a structured-match test case.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        prompt: impl Into<String>,
        expected_output: JsonValue,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            category: None,
            description: None,
            prompt: prompt.into(),
            system_prompt: None,
            expected_output,
            output_schema: None,
            evaluation_type: default_evaluation_type(),
            evaluation_config: None,
            timeout_seconds: None,
        }
    }

    pub fn with_evaluation_type(mut self, evaluation_type: EvaluationType) -> Self {
        self.evaluation_type = evaluation_type;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Parse a test case from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, TestCaseError> {
        let document: JsonValue = serde_yaml::from_str(yaml)?;
        Self::from_document(document)
    }

    /// Parse a test case from JSON string.
    pub fn from_json(json: &str) -> Result<Self, TestCaseError> {
        let document: JsonValue = serde_json::from_str(json)?;
        Self::from_document(document)
    }

    /// Load a test case from a file. `.json` files are read as JSON,
    /// everything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TestCaseError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    fn from_document(document: JsonValue) -> Result<Self, TestCaseError> {
        // Surface a typed error for bad evaluation types before the schema does.
        if let Some(kind) = document.get("evaluation_type").and_then(|v| v.as_str()) {
            kind.parse::<EvaluationType>()?;
        }

        validate_test_case_schema(&document)
            .map_err(|errors| TestCaseError::ValidationError(errors.join("; ")))?;

        let test_case: TestCase = serde_json::from_value(document)?;
        test_case.validate()?;
        Ok(test_case)
    }

    /// Check semantic constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), TestCaseError> {
        if self.id.trim().is_empty() {
            return Err(TestCaseError::ValidationError("id must not be empty".to_string()));
        }
        if self.prompt.trim().is_empty() {
            return Err(TestCaseError::ValidationError(
                "prompt must not be empty".to_string(),
            ));
        }
        if self.timeout_seconds == Some(0) {
            return Err(TestCaseError::ValidationError(
                "timeout_seconds must be positive".to_string(),
            ));
        }
        self.scoring_config()?;
        Ok(())
    }

    /// Scoring policy for this test case.
    pub fn scoring_config(&self) -> Result<ScoringConfig, ScoringError> {
        ScoringConfig::from_evaluation_config(self.evaluation_config.as_ref())
    }

    /// Per-task timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}
