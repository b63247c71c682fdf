//! Structural scoring of model responses.
//!
//! A response is first parsed into a structured value (see [`parse`]), then
//! judged against the expected output according to the evaluation type.
//! Scoring is pure and synchronous.

pub mod compare;
pub mod exact;
pub mod parse;

pub use compare::{compare, Comparison, ComparisonDetail, ElementScore, FieldScore, ValueKind};
pub use exact::{exact_match, ExactMatchDetail};
pub use parse::{parse_response, ParseStrategy, ParsedResponse};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::testcase::validate_output;
use crate::types::EvaluationType;

/// Errors raised while scoring.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringError {
    #[error("Unknown evaluation type: {0}")]
    UnknownEvaluationType(String),

    #[error("Malformed expected value: {0}")]
    MalformedExpectedValue(String),

    #[error("Invalid evaluation config: {0}")]
    InvalidConfig(String),

    #[error("Evaluation type llm_judge requires an external judge")]
    JudgeRequired,
}

/// Tolerance policy for structural comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub ignore_array_order: bool,
    pub float_tolerance: f64,
    pub ignore_extra_fields: bool,
    /// Minimum structural score counted as correct.
    pub correctness_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ignore_array_order: true,
            float_tolerance: 1e-6,
            ignore_extra_fields: true,
            correctness_threshold: 0.95,
        }
    }
}

impl ScoringConfig {
    /// Build from a test case's `evaluation_config`. Absent or null yields
    /// the defaults; unknown keys are ignored.
    pub fn from_evaluation_config(config: Option<&JsonValue>) -> Result<Self, ScoringError> {
        match config {
            None | Some(JsonValue::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ScoringError::InvalidConfig(e.to_string())),
        }
    }

    /// Float tolerance clamped to be non-negative.
    pub fn tolerance(&self) -> f64 {
        self.float_tolerance.max(0.0)
    }
}

/// Method-specific explanation attached to a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ScoreDetails {
    ExactMatch(ExactMatchDetail),
    StructuredMatch {
        comparison: ComparisonDetail,
        threshold: f64,
    },
    Judge {
        reasoning: Option<String>,
    },
    /// Scoring did not complete; see `ScoreResult::error`.
    Unscored,
}

/// Outcome of scoring one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub is_correct: bool,
    pub score: f64,
    pub details: ScoreDetails,
    pub parsed_output: JsonValue,
    pub parse_strategy: Option<ParseStrategy>,
    /// Output schema violations. Informational only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema_violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScoreResult {
    /// Zero-score result carrying the error that prevented scoring.
    pub fn degraded(parsed_output: JsonValue, error: impl Into<String>) -> Self {
        Self {
            is_correct: false,
            score: 0.0,
            details: ScoreDetails::Unscored,
            parsed_output,
            parse_strategy: None,
            schema_violations: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Score a raw response against the expected output.
///
/// `llm_judge` cannot be scored here and yields [`ScoringError::JudgeRequired`].
pub fn score(
    response: &str,
    expected: &JsonValue,
    evaluation_type: EvaluationType,
    config: &ScoringConfig,
    output_schema: Option<&JsonValue>,
) -> Result<ScoreResult, ScoringError> {
    let parsed = parse_response(response);
    let schema_violations = match output_schema {
        Some(schema) => validate_output(schema, &parsed.value)?,
        None => Vec::new(),
    };

    let (is_correct, score, details) = match evaluation_type {
        EvaluationType::ExactMatch => {
            let detail = exact_match(&parsed.value, expected);
            let score = if detail.matched { 1.0 } else { 0.0 };
            (detail.matched, score, ScoreDetails::ExactMatch(detail))
        }
        EvaluationType::StructuredMatch => {
            if expected.is_null() {
                return Err(ScoringError::MalformedExpectedValue(
                    "expected output is null".to_string(),
                ));
            }
            let comparison = compare(&parsed.value, expected, config);
            (
                comparison.score >= config.correctness_threshold,
                comparison.score,
                ScoreDetails::StructuredMatch {
                    comparison: comparison.detail,
                    threshold: config.correctness_threshold,
                },
            )
        }
        EvaluationType::LlmJudge => return Err(ScoringError::JudgeRequired),
    };

    Ok(ScoreResult {
        is_correct,
        score,
        details,
        parsed_output: parsed.value,
        parse_strategy: Some(parsed.strategy),
        schema_violations,
        error: None,
    })
}

/// Like [`score`], but any error becomes a zero-score result.
pub fn score_or_degrade(
    response: &str,
    expected: &JsonValue,
    evaluation_type: EvaluationType,
    config: &ScoringConfig,
    output_schema: Option<&JsonValue>,
) -> ScoreResult {
    match score(response, expected, evaluation_type, config, output_schema) {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(error = %e, evaluation_type = %evaluation_type, "Scoring degraded to zero");
            ScoreResult::degraded(parse_response(response).value, e.to_string())
        }
    }
}
