//! # openbench-runtime
//!
//! Concurrent evaluation runtime for OpenBench.
//!
//! `openbench-core` decides how a response is scored; this crate gets the
//! responses. It provides:
//! - the batch [`Orchestrator`], which fans a test case out to many models
//!   under a process-wide concurrency limit with per-task and per-batch
//!   deadlines
//! - provider backends behind the [`ProviderBackend`] trait and a
//!   [`ProviderRegistry`] that routes model ids to them
//! - the [`ResidencyCache`], which keeps a bounded set of local models
//!   loaded on the model server
//! - an optional [`Judge`] for `llm_judge` test cases
//!
//! Remote providers are behind cargo features (`anthropic`, `openai`,
//! `google`, `local`); without them only programmatically registered backends exist.
//!
//! ## Example
//!
//! ```rust,ignore
//! use openbench_runtime::{BatchOptions, Orchestrator, ProviderRegistry, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_file("openbench.yaml")?;
//! let mut registry = ProviderRegistry::with_defaults();
//! registry.build_from_config(&config)?;
//!
//! let orchestrator = Orchestrator::builder()
//!     .registry(Arc::new(registry))
//!     .config(config.orchestrator.clone())
//!     .build()?;
//!
//! orchestrator.put_test_case(TestCase::from_file("person.yaml")?).await?;
//! let id = orchestrator
//!     .submit_batch("person", vec!["gpt-4".into(), "llama3:8b".into()], BatchOptions::default())
//!     .await?;
//! let batch = orchestrator.wait_for_batch(id).await?;
//! println!("accuracy: {:?}", batch.aggregate_accuracy);
//! ```

pub mod cache;
pub mod config;
pub mod judge;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod residency;
pub mod store;
pub mod telemetry;

pub use cache::HealthCache;
pub use config::{
    ConfigError, LocalModelConfig, ModelRoute, OrchestratorConfig, ProviderSettings,
    RegistryConfig, ResidencyConfig, RuntimeConfig,
};
pub use judge::{Judge, JudgeError, ProviderJudge};
pub use orchestrator::{BatchOptions, Orchestrator, OrchestratorBuilder, OrchestratorError};
pub use providers::{
    ApiCredential, Capabilities, GenerateRequest, LocalBackend, LocalProviderFactory,
    ProviderBackend, ProviderError, ProviderFactory, ProviderRegistry, ProviderResponse,
    TokenUsage,
};
pub use residency::{
    HostError, LoadOutcome, ModelHost, ModelState, ModelStatus, PreloadReport, ResidencyCache,
    ResidencyEntry, ResidencyError,
};
pub use store::{EvaluationStore, InMemoryStore, StoreError};
