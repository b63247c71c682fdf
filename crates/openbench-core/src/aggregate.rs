//! Batch tally: folds terminal task results into batch counters.
//!
//! Finalization rules:
//! 1. Deadline exceeded → FAILED, "evaluation timed out"
//! 2. Cancelled → FAILED, "evaluation cancelled"
//! 3. Else any completed task → COMPLETED
//! 4. Else → FAILED, "all evaluations failed"
//!
//! Aggregates are means over completed tasks that reported a value. Tasks
//! without a score or latency are left out rather than counted as zero.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{Batch, BatchStatus, EvaluationTask, TaskStatus};

pub const TIMED_OUT_MESSAGE: &str = "evaluation timed out";
pub const CANCELLED_MESSAGE: &str = "evaluation cancelled";
pub const ALL_FAILED_MESSAGE: &str = "all evaluations failed";

/// How the batch's fan-out ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEnd {
    /// Every task reached a terminal state.
    AllTerminal,
    DeadlineExceeded,
    Cancelled,
}

/// Running counters for one batch. Owned by a single writer.
#[derive(Debug, Clone, Default)]
pub struct BatchTally {
    total: u32,
    successful: u32,
    failed: u32,
    score_sum: f64,
    score_count: u32,
    latency_sum: f64,
    latency_count: u32,
}

impl BatchTally {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Count a terminal task. Non-terminal tasks and anything beyond `total`
    /// are ignored; returns whether the task was counted.
    pub fn record(&mut self, task: &EvaluationTask) -> bool {
        if !task.is_terminal() || self.progress() >= self.total {
            return false;
        }

        match task.status {
            TaskStatus::Completed => {
                self.successful += 1;
                if let Some(score) = task.score {
                    self.score_sum += score;
                    self.score_count += 1;
                }
                if let Some(latency) = task.latency_ms {
                    self.latency_sum += latency;
                    self.latency_count += 1;
                }
            }
            _ => self.failed += 1,
        }
        true
    }

    pub fn progress(&self) -> u32 {
        self.successful + self.failed
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn successful(&self) -> u32 {
        self.successful
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.progress() >= self.total
    }

    pub fn mean_score(&self) -> Option<f64> {
        mean(self.score_sum, self.score_count)
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        mean(self.latency_sum, self.latency_count)
    }

    /// Copy progress counters and running aggregates onto the batch.
    pub fn apply_progress(&self, batch: &mut Batch) {
        batch.progress = self.progress();
        batch.successful_evaluations = self.successful;
        batch.failed_evaluations = self.failed;
        batch.aggregate_accuracy = self.mean_score();
        batch.aggregate_latency_ms = self.mean_latency_ms();
    }

    /// Apply the final status. A batch that is already terminal is left as is.
    pub fn finalize(&self, batch: &mut Batch, end: BatchEnd) {
        if batch.is_terminal() {
            return;
        }
        self.apply_progress(batch);

        let (status, message) = match end {
            BatchEnd::DeadlineExceeded => (BatchStatus::Failed, Some(TIMED_OUT_MESSAGE)),
            BatchEnd::Cancelled => (BatchStatus::Failed, Some(CANCELLED_MESSAGE)),
            BatchEnd::AllTerminal if self.successful > 0 => (BatchStatus::Completed, None),
            BatchEnd::AllTerminal => (BatchStatus::Failed, Some(ALL_FAILED_MESSAGE)),
        };

        batch.status = status;
        batch.error_message = message.map(str::to_string);
        batch.completed_at = Some(Utc::now());
    }
}

fn mean(sum: f64, count: u32) -> Option<f64> {
    if count == 0 {
        None
    } else {
        Some(sum / f64::from(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorType;

    fn completed(batch: &Batch, model: &str, score: Option<f64>, latency: Option<f64>) -> EvaluationTask {
        let mut task = EvaluationTask::new(batch.id, model);
        task.status = TaskStatus::Completed;
        task.score = score;
        task.latency_ms = latency;
        task
    }

    fn failed(batch: &Batch, model: &str, error_type: ErrorType) -> EvaluationTask {
        let mut task = EvaluationTask::new(batch.id, model);
        task.fail(error_type, "failed");
        task
    }

    fn batch_of(n: usize) -> Batch {
        Batch::new("tc", (0..n).map(|i| format!("m{}", i)).collect())
    }

    #[test]
    fn test_one_success_two_timeouts() {
        let mut batch = batch_of(3);
        let mut tally = BatchTally::new(batch.total);
        assert!(tally.record(&failed(&batch, "m0", ErrorType::Timeout)));
        assert!(tally.record(&failed(&batch, "m1", ErrorType::Timeout)));
        assert!(tally.record(&completed(&batch, "m2", Some(0.8), Some(120.0))));
        assert!(tally.is_complete());

        tally.finalize(&mut batch, BatchEnd::AllTerminal);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.successful_evaluations, 1);
        assert_eq!(batch.failed_evaluations, 2);
        assert_eq!(batch.progress, 3);
        assert_eq!(batch.aggregate_accuracy, Some(0.8));
        assert_eq!(batch.aggregate_latency_ms, Some(120.0));
        assert!(batch.error_message.is_none());
        assert!(batch.completed_at.is_some());
    }

    #[test]
    fn test_all_failed() {
        let mut batch = batch_of(2);
        let mut tally = BatchTally::new(batch.total);
        tally.record(&failed(&batch, "m0", ErrorType::ProviderError));
        tally.record(&failed(&batch, "m1", ErrorType::UnknownError));
        tally.finalize(&mut batch, BatchEnd::AllTerminal);

        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.error_message.as_deref(), Some(ALL_FAILED_MESSAGE));
        assert!(batch.aggregate_accuracy.is_none());
    }

    #[test]
    fn test_deadline_keeps_committed_results() {
        let mut batch = batch_of(3);
        let mut tally = BatchTally::new(batch.total);
        tally.record(&completed(&batch, "m0", Some(1.0), Some(10.0)));
        tally.finalize(&mut batch, BatchEnd::DeadlineExceeded);

        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.error_message.as_deref(), Some(TIMED_OUT_MESSAGE));
        assert_eq!(batch.progress, 1);
        assert_eq!(batch.successful_evaluations, 1);
        assert_eq!(batch.aggregate_accuracy, Some(1.0));
    }

    #[test]
    fn test_unscored_tasks_excluded_from_means() {
        let batch = batch_of(3);
        let mut tally = BatchTally::new(batch.total);
        tally.record(&completed(&batch, "m0", Some(0.5), Some(100.0)));
        tally.record(&completed(&batch, "m1", None, Some(300.0)));
        tally.record(&completed(&batch, "m2", Some(1.0), None));

        assert_eq!(tally.successful(), 3);
        assert_eq!(tally.mean_score(), Some(0.75));
        assert_eq!(tally.mean_latency_ms(), Some(200.0));
    }

    #[test]
    fn test_progress_never_exceeds_total() {
        let batch = batch_of(1);
        let mut tally = BatchTally::new(batch.total);
        assert!(tally.record(&completed(&batch, "m0", Some(1.0), None)));
        assert!(!tally.record(&completed(&batch, "m0", Some(1.0), None)));
        assert_eq!(tally.progress(), 1);
    }

    #[test]
    fn test_non_terminal_tasks_ignored() {
        let batch = batch_of(1);
        let mut tally = BatchTally::new(batch.total);
        let mut task = EvaluationTask::new(batch.id, "m0");
        task.start();
        assert!(!tally.record(&task));
        assert_eq!(tally.progress(), 0);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut batch = batch_of(1);
        let mut tally = BatchTally::new(batch.total);
        tally.record(&completed(&batch, "m0", Some(1.0), None));
        tally.finalize(&mut batch, BatchEnd::AllTerminal);
        tally.finalize(&mut batch, BatchEnd::DeadlineExceeded);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.error_message.is_none());
    }
}
