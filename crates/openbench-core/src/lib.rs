//! # openbench-core
//!
//! Deterministic pieces of the OpenBench model benchmark.
//!
//! This crate answers, for a single model response:
//! - What structured value did the model produce?
//! - How close is it to the expected output?
//! - How do per-model results roll up into a batch?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same response and expectation always give the same score
//! 2. **No I/O**: Scoring never calls a model; only test case loading reads files
//! 3. **Bounded**: Every score is in `[0, 1]`
//! 4. **Explained**: Every score carries a detail tree
//!
//! ## Example
//!
//! ```rust,ignore
//! use openbench_core::{score, EvaluationType, ScoringConfig, TestCase};
//!
//! let test_case = TestCase::from_file("cases/person.yaml")?;
//! let result = score(
//!     r#"{"name": "Ada", "age": 36}"#,
//!     &test_case.expected_output,
//!     test_case.evaluation_type,
//!     &test_case.scoring_config()?,
//!     test_case.output_schema.as_ref(),
//! )?;
//! println!("{} ({})", result.score, result.is_correct);
//! ```

pub mod aggregate;
pub mod scoring;
pub mod testcase;
pub mod types;

// Re-export main types at crate root
pub use aggregate::{BatchEnd, BatchTally};
pub use scoring::{
    compare, parse_response, score, score_or_degrade, Comparison, ComparisonDetail,
    ParseStrategy, ScoreDetails, ScoreResult, ScoringConfig, ScoringError,
};
pub use testcase::{TestCase, TestCaseError};
pub use types::{
    Batch, BatchId, BatchStatus, ErrorType, EvaluationTask, EvaluationType, TaskId, TaskStatus,
};
