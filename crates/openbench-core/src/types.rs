//! Batch and task records shared by the scorer and the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::scoring::ScoringError;

/// Identifier of a batch.
pub type BatchId = Uuid;

/// Identifier of a single evaluation task.
pub type TaskId = Uuid;

/// How a model response is judged against the expected output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationType {
    /// Case-insensitive textual equality.
    ExactMatch,
    /// Recursive structural comparison with tolerance knobs.
    StructuredMatch,
    /// Delegated to an external judge.
    LlmJudge,
}

impl EvaluationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationType::ExactMatch => "exact_match",
            EvaluationType::StructuredMatch => "structured_match",
            EvaluationType::LlmJudge => "llm_judge",
        }
    }

    /// Whether providers should be asked for JSON output.
    pub fn wants_json(&self) -> bool {
        matches!(self, EvaluationType::StructuredMatch)
    }
}

impl fmt::Display for EvaluationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationType {
    type Err = ScoringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "exact_match" => Ok(EvaluationType::ExactMatch),
            "structured_match" => Ok(EvaluationType::StructuredMatch),
            "llm_judge" => Ok(EvaluationType::LlmJudge),
            other => Err(ScoringError::UnknownEvaluationType(other.to_string())),
        }
    }
}

/// Lifecycle of a batch. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a task. `Completed`, `Failed` and `Timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    ProviderError,
    UnknownError,
}

/// One evaluation run of a test case across a set of models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub test_case_id: String,
    /// Target models, unique, in submission order.
    pub model_ids: Vec<String>,
    pub status: BatchStatus,
    /// Number of tasks in a terminal state.
    pub progress: u32,
    pub total: u32,
    pub successful_evaluations: u32,
    pub failed_evaluations: u32,
    /// Mean score over completed tasks that produced one.
    pub aggregate_accuracy: Option<f64>,
    /// Mean latency in milliseconds over completed tasks.
    pub aggregate_latency_ms: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Create a pending batch. Duplicate model ids are dropped, keeping the
    /// first occurrence.
    pub fn new(test_case_id: impl Into<String>, model_ids: Vec<String>) -> Self {
        let model_ids = dedupe_preserving_order(model_ids);
        Self {
            id: Uuid::new_v4(),
            test_case_id: test_case_id.into(),
            total: model_ids.len() as u32,
            model_ids,
            status: BatchStatus::Pending,
            progress: 0,
            successful_evaluations: 0,
            failed_evaluations: 0,
            aggregate_accuracy: None,
            aggregate_latency_ms: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Share of tasks finished, 0-100.
    pub fn progress_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.progress) / f64::from(self.total) * 100.0
    }

    /// Wall time between start and completion, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Per-model unit of work within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTask {
    pub id: TaskId,
    pub batch_id: BatchId,
    pub model_id: String,
    pub status: TaskStatus,
    pub raw_output: Option<String>,
    pub parsed_output: Option<JsonValue>,
    pub is_correct: Option<bool>,
    pub score: Option<f64>,
    pub score_details: Option<JsonValue>,
    pub latency_ms: Option<f64>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub input_cost: Option<f64>,
    pub output_cost: Option<f64>,
    pub total_cost: Option<f64>,
    pub provider_request_id: Option<String>,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationTask {
    pub fn new(batch_id: BatchId, model_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            model_id: model_id.into(),
            status: TaskStatus::Pending,
            raw_output: None,
            parsed_output: None,
            is_correct: None,
            score: None,
            score_details: None,
            latency_ms: None,
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            input_cost: None,
            output_cost: None,
            total_cost: None,
            provider_request_id: None,
            error_type: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the task as running.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully finished.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Record a failure and make the task terminal.
    pub fn fail(&mut self, error_type: ErrorType, message: impl Into<String>) {
        self.status = match error_type {
            ErrorType::Timeout => TaskStatus::Timeout,
            ErrorType::ProviderError | ErrorType::UnknownError => TaskStatus::Failed,
        };
        self.error_type = Some(error_type);
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Output tokens generated per second of latency.
    pub fn tokens_per_second(&self) -> Option<f64> {
        let tokens = self.output_tokens?;
        let latency_ms = self.latency_ms?;
        if latency_ms <= 0.0 {
            return None;
        }
        Some(f64::from(tokens) / (latency_ms / 1000.0))
    }
}

fn dedupe_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
