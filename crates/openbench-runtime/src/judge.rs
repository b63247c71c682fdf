//! Grading for `llm_judge` test cases.
//!
//! The structural scorer cannot grade free-form answers. A [`Judge`] can;
//! the orchestrator calls it for `llm_judge` test cases when one is wired
//! in, and degrades to a zero score when none is.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use openbench_core::scoring::parse_response;
use openbench_core::{ScoreDetails, ScoreResult, TestCase};

use crate::prompts::{judge_prompt, JUDGE_SYSTEM_PROMPT};
use crate::providers::{GenerateRequest, ProviderBackend, ProviderError};

/// Errors from judges.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JudgeError {
    #[error("Judge model call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Judge reply could not be read: {0}")]
    InvalidVerdict(String),

    #[error("Invalid scoring config: {0}")]
    Config(String),
}

/// Grades one response to one test case.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, test_case: &TestCase, response: &str) -> Result<ScoreResult, JudgeError>;
}

#[derive(Debug, Deserialize)]
struct Verdict {
    score: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Judge that asks a model through any provider backend.
pub struct ProviderJudge {
    backend: Arc<dyn ProviderBackend>,
    model: String,
    timeout: Duration,
}

impl ProviderJudge {
    pub fn new(backend: Arc<dyn ProviderBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Judge for ProviderJudge {
    async fn judge(&self, test_case: &TestCase, response: &str) -> Result<ScoreResult, JudgeError> {
        let threshold = test_case
            .scoring_config()
            .map_err(|e| JudgeError::Config(e.to_string()))?
            .correctness_threshold;

        let request = GenerateRequest::new(
            self.model.clone(),
            judge_prompt(&test_case.prompt, &test_case.expected_output, response),
        )
        .with_system_prompt(Some(JUDGE_SYSTEM_PROMPT.trim().to_string()))
        .with_temperature(0.0)
        .with_json_mode(true)
        .with_timeout(self.timeout);

        let reply = self.backend.generate(&request).await?;
        let verdict: Verdict = serde_json::from_value(parse_response(&reply.content).value)
            .map_err(|e| JudgeError::InvalidVerdict(e.to_string()))?;
        if !verdict.score.is_finite() {
            return Err(JudgeError::InvalidVerdict(format!(
                "score is not a number: {}",
                verdict.score
            )));
        }
        let score = verdict.score.clamp(0.0, 1.0);

        let parsed = parse_response(response);
        Ok(ScoreResult {
            is_correct: score >= threshold,
            score,
            details: ScoreDetails::Judge {
                reasoning: verdict.reasoning,
            },
            parsed_output: parsed.value,
            parse_strategy: Some(parsed.strategy),
            schema_violations: Vec::new(),
            error: None,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::providers::{Capabilities, ProviderResponse};
    use openbench_core::EvaluationType;
    use serde_json::json;

    /// Backend that always answers with the same text.
    pub(crate) struct CannedBackend(pub String);

    #[async_trait]
    impl ProviderBackend for CannedBackend {
        async fn generate(
            &self,
            request: &GenerateRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::text(self.0.clone(), request.model.clone()))
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn capital_case() -> TestCase {
        TestCase::new(
            "capital",
            "Capital of France",
            "What is the capital of France?",
            json!("Paris"),
        )
        .with_evaluation_type(EvaluationType::LlmJudge)
    }

    #[tokio::test]
    async fn test_verdict_parsed_from_fenced_reply() {
        let judge = ProviderJudge::new(
            Arc::new(CannedBackend(
                "```json\n{\"score\": 0.9, \"reasoning\": \"Correct city.\"}\n```".to_string(),
            )),
            "gpt-4",
        );
        let result = judge.judge(&capital_case(), "It is Paris.").await.unwrap();

        assert_eq!(result.score, 0.9);
        assert!(!result.is_correct, "0.9 is below the 0.95 default threshold");
        assert_eq!(
            result.details,
            ScoreDetails::Judge {
                reasoning: Some("Correct city.".to_string())
            }
        );
        assert_eq!(result.parsed_output, json!("It is Paris."));
    }

    #[tokio::test]
    async fn test_score_clamped() {
        let judge = ProviderJudge::new(Arc::new(CannedBackend(r#"{"score": 7}"#.to_string())), "m");
        let result = judge.judge(&capital_case(), "Paris").await.unwrap();
        assert_eq!(result.score, 1.0);
        assert!(result.is_correct);
    }

    #[tokio::test]
    async fn test_unreadable_verdict() {
        let judge = ProviderJudge::new(
            Arc::new(CannedBackend("I think it's fine".to_string())),
            "m",
        );
        let err = judge.judge(&capital_case(), "Paris").await.unwrap_err();
        assert!(matches!(err, JudgeError::InvalidVerdict(_)));
    }
}
