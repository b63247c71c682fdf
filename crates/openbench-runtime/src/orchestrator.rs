//! Batch orchestrator: fans one test case out to many models.
//!
//! Every batch gets a single runner task that owns the batch record and
//! its [`BatchTally`]. Evaluation tasks never touch the batch; they report
//! `Started`/`Finished` events over a channel and the runner persists them
//! one at a time. A process-wide semaphore bounds the number of in-flight
//! provider calls across all batches.
//!
//! Deadlines:
//! - each task is bounded by its task timeout (batch options, then the test
//!   case, then the orchestrator config);
//! - the batch is bounded by its batch timeout. When it fires, results the
//!   runner has already received are kept and everything still running is
//!   abandoned.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use openbench_core::{
    parse_response, score_or_degrade, Batch, BatchEnd, BatchId, BatchStatus, BatchTally,
    ErrorType, EvaluationTask, EvaluationType, ScoreResult, ScoringConfig, TestCase,
};

use crate::config::OrchestratorConfig;
use crate::judge::Judge;
use crate::providers::{GenerateRequest, ProviderError, ProviderRegistry};
use crate::store::{EvaluationStore, InMemoryStore, StoreError};

/// Errors from the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("At least one model id is required")]
    EmptyModelList,

    #[error("Unknown test case: {0}")]
    UnknownTestCase(String),

    #[error("Invalid test case: {0}")]
    InvalidTestCase(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Batch {0} is not running")]
    BatchNotRunning(BatchId),

    #[error("Orchestrator not configured: {0}")]
    NotConfigured(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Per-batch overrides of the orchestrator defaults.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub task_timeout: Option<Duration>,
    pub batch_timeout: Option<Duration>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Settings resolved once per batch.
struct BatchRun {
    test_case: TestCase,
    scoring: ScoringConfig,
    task_timeout: Duration,
    batch_timeout: Duration,
    temperature: f32,
    max_tokens: u32,
}

impl BatchRun {
    fn new(test_case: TestCase, config: &OrchestratorConfig, options: &BatchOptions) -> Self {
        let scoring = test_case.scoring_config().unwrap_or_default();
        let task_timeout = options
            .task_timeout
            .or_else(|| test_case.timeout())
            .unwrap_or(config.task_timeout);

        Self {
            scoring,
            task_timeout,
            batch_timeout: options.batch_timeout.unwrap_or(config.batch_timeout),
            temperature: options.temperature.unwrap_or(config.temperature),
            max_tokens: options.max_tokens.unwrap_or(config.max_tokens),
            test_case,
        }
    }

    fn request_for(&self, provider_model_id: &str) -> GenerateRequest {
        let tc = &self.test_case;
        let mut request = GenerateRequest::new(provider_model_id, tc.prompt.clone())
            .with_system_prompt(tc.system_prompt.clone())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_json_mode(tc.evaluation_type.wants_json())
            .with_timeout(self.task_timeout);
        request.output_schema = tc.output_schema.clone();
        request
    }
}

/// Live state of a running batch.
struct BatchHandle {
    cancel: Arc<watch::Sender<bool>>,
    status: watch::Receiver<Batch>,
    runner: JoinHandle<()>,
}

struct Shared {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn EvaluationStore>,
    judge: Option<Arc<dyn Judge>>,
    config: OrchestratorConfig,
    limiter: Arc<Semaphore>,
    running: Mutex<HashMap<BatchId, BatchHandle>>,
}

enum TaskEvent {
    Started(EvaluationTask),
    Finished(EvaluationTask),
}

/// Runs batches of evaluations. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.shared.registry
    }

    pub fn store(&self) -> &Arc<dyn EvaluationStore> {
        &self.shared.store
    }

    /// Store a test case so batches can reference it.
    pub async fn put_test_case(&self, test_case: TestCase) -> Result<(), OrchestratorError> {
        test_case
            .validate()
            .map_err(|e| OrchestratorError::InvalidTestCase(e.to_string()))?;
        self.shared.store.put_test_case(test_case).await?;
        Ok(())
    }

    /// Create a batch for `test_case_id` across `model_ids` and start it.
    ///
    /// Duplicate model ids are evaluated once. Returns as soon as the batch
    /// and its task records exist; use [`Orchestrator::wait_for_batch`] to
    /// wait for the outcome.
    pub async fn submit_batch(
        &self,
        test_case_id: &str,
        model_ids: Vec<String>,
        options: BatchOptions,
    ) -> Result<BatchId, OrchestratorError> {
        if model_ids.is_empty() {
            return Err(OrchestratorError::EmptyModelList);
        }

        let test_case = match self.shared.store.get_test_case(test_case_id).await {
            Ok(test_case) => test_case,
            Err(StoreError::NotFound { .. }) => {
                return Err(OrchestratorError::UnknownTestCase(test_case_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        test_case
            .validate()
            .map_err(|e| OrchestratorError::InvalidTestCase(e.to_string()))?;

        let mut batch = Batch::new(&test_case.id, model_ids);
        self.shared.store.create_batch(&batch).await?;

        let tasks: Vec<EvaluationTask> = batch
            .model_ids
            .iter()
            .map(|model_id| EvaluationTask::new(batch.id, model_id.clone()))
            .collect();
        if let Err(e) = self.start_records(&mut batch, &tasks).await {
            self.abandon_batch(batch, &e).await;
            return Err(e.into());
        }

        let run = Arc::new(BatchRun::new(test_case, &self.shared.config, &options));
        let batch_id = batch.id;
        let models = batch.model_ids.len();
        let (cancel, _) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let (status_tx, status_rx) = watch::channel(batch.clone());

        // Registered under the lock so the runner cannot deregister first.
        let mut running = self.shared.running.lock();
        let runner = tokio::spawn(
            run_batch(
                self.shared.clone(),
                run,
                batch,
                tasks,
                cancel.clone(),
                status_tx,
            )
            .instrument(info_span!("batch", batch_id = %batch_id)),
        );
        running.insert(
            batch_id,
            BatchHandle {
                cancel,
                status: status_rx,
                runner,
            },
        );
        drop(running);

        info!(
            batch_id = %batch_id,
            test_case_id = %test_case_id,
            models,
            "Batch submitted"
        );
        Ok(batch_id)
    }

    async fn start_records(
        &self,
        batch: &mut Batch,
        tasks: &[EvaluationTask],
    ) -> Result<(), StoreError> {
        for task in tasks {
            self.shared.store.create_task(task).await?;
        }
        batch.status = BatchStatus::Running;
        batch.started_at = Some(Utc::now());
        self.shared.store.update_batch(batch).await
    }

    /// Mark a batch that never got a runner as failed.
    async fn abandon_batch(&self, mut batch: Batch, error: &StoreError) {
        warn!(batch_id = %batch.id, error = %error, "Failed to start batch");
        batch.status = BatchStatus::Failed;
        batch.error_message = Some(format!("failed to start batch: {}", error));
        batch.completed_at = Some(Utc::now());
        if let Err(e) = self.shared.store.update_batch(&batch).await {
            warn!(batch_id = %batch.id, error = %e, "Failed to record batch failure");
        }
    }

    /// Current batch record.
    pub async fn get_batch_status(&self, batch_id: BatchId) -> Result<Batch, OrchestratorError> {
        match self.shared.store.get_batch(batch_id).await {
            Ok(batch) => Ok(batch),
            Err(StoreError::NotFound { .. }) => Err(OrchestratorError::BatchNotFound(batch_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Task records of a batch in submission order.
    pub async fn get_batch_tasks(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<EvaluationTask>, OrchestratorError> {
        match self.shared.store.list_tasks(batch_id).await {
            Ok(tasks) => Ok(tasks),
            Err(StoreError::NotFound { .. }) => Err(OrchestratorError::BatchNotFound(batch_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the batch is terminal and return its final record.
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> Result<Batch, OrchestratorError> {
        let status = self
            .shared
            .running
            .lock()
            .get(&batch_id)
            .map(|handle| handle.status.clone());

        if let Some(mut status) = status {
            if let Ok(batch) = status.wait_for(Batch::is_terminal).await {
                return Ok(batch.clone());
            }
        }

        let batch = self.get_batch_status(batch_id).await?;
        if batch.is_terminal() {
            Ok(batch)
        } else {
            Err(OrchestratorError::BatchNotRunning(batch_id))
        }
    }

    /// Request cancellation. Returns `false` if the batch is not running.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<bool, OrchestratorError> {
        let cancel = self
            .shared
            .running
            .lock()
            .get(&batch_id)
            .map(|handle| handle.cancel.clone());

        match cancel {
            Some(cancel) => {
                cancel.send_replace(true);
                info!(batch_id = %batch_id, "Batch cancellation requested");
                Ok(true)
            }
            None => {
                self.get_batch_status(batch_id).await?;
                Ok(false)
            }
        }
    }

    /// Ids of batches whose runner is still active.
    pub fn running_batches(&self) -> Vec<BatchId> {
        self.shared.running.lock().keys().copied().collect()
    }

    /// Cancel every running batch and wait for the runners to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<BatchHandle> = self
            .shared
            .running
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in &handles {
            handle.cancel.send_replace(true);
        }
        for handle in handles {
            if let Err(e) = handle.runner.await {
                warn!(error = %e, "Batch runner ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.shared.config)
            .field("has_judge", &self.shared.judge.is_some())
            .field("running", &self.shared.running.lock().len())
            .finish()
    }
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    registry: Option<Arc<ProviderRegistry>>,
    store: Option<Arc<dyn EvaluationStore>>,
    judge: Option<Arc<dyn Judge>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn EvaluationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Judge for `llm_judge` test cases.
    pub fn judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let registry = self.registry.ok_or_else(|| {
            OrchestratorError::NotConfigured("No provider registry set".to_string())
        })?;
        if self.config.max_concurrent_evaluations == 0 {
            return Err(OrchestratorError::NotConfigured(
                "max_concurrent_evaluations must be at least 1".to_string(),
            ));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn EvaluationStore>);

        Ok(Orchestrator {
            shared: Arc::new(Shared {
                registry,
                store,
                judge: self.judge,
                limiter: Arc::new(Semaphore::new(self.config.max_concurrent_evaluations)),
                config: self.config,
                running: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Resolves once the token is set. Never resolves if the sender is gone.
async fn cancelled(token: &mut watch::Receiver<bool>) {
    if token.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Sole writer of the batch record and its task records.
struct BatchWriter {
    store: Arc<dyn EvaluationStore>,
    batch: Batch,
    tally: BatchTally,
    status: watch::Sender<Batch>,
}

impl BatchWriter {
    async fn apply(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Started(task) => self.persist_task(&task).await,
            TaskEvent::Finished(task) => {
                self.persist_task(&task).await;
                if self.tally.record(&task) {
                    self.tally.apply_progress(&mut self.batch);
                    self.persist_batch().await;
                    self.status.send_replace(self.batch.clone());
                }
            }
        }
    }

    async fn persist_task(&self, task: &EvaluationTask) {
        if let Err(e) = self.store.update_task(task).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist task");
        }
    }

    async fn persist_batch(&self) {
        if let Err(e) = self.store.update_batch(&self.batch).await {
            warn!(error = %e, "Failed to persist batch");
        }
    }
}

async fn run_batch(
    shared: Arc<Shared>,
    run: Arc<BatchRun>,
    batch: Batch,
    tasks: Vec<EvaluationTask>,
    cancel: Arc<watch::Sender<bool>>,
    status: watch::Sender<Batch>,
) {
    let batch_id = batch.id;
    let (events_tx, mut events) = mpsc::channel(tasks.len() * 2 + 1);

    for task in tasks {
        let span = info_span!("task", task_id = %task.id, model_id = %task.model_id);
        tokio::spawn(
            run_task(
                shared.clone(),
                run.clone(),
                task,
                cancel.subscribe(),
                events_tx.clone(),
            )
            .instrument(span),
        );
    }
    drop(events_tx);

    let mut writer = BatchWriter {
        store: shared.store.clone(),
        tally: BatchTally::new(batch.total),
        batch,
        status,
    };
    let mut cancel_rx = cancel.subscribe();
    let deadline = tokio::time::sleep(run.batch_timeout);
    tokio::pin!(deadline);

    let end = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => {
                    writer.apply(event).await;
                    if writer.tally.is_complete() {
                        break BatchEnd::AllTerminal;
                    }
                }
                None => break BatchEnd::AllTerminal,
            },
            _ = &mut deadline => break BatchEnd::DeadlineExceeded,
            _ = cancelled(&mut cancel_rx) => break BatchEnd::Cancelled,
        }
    };

    if end != BatchEnd::AllTerminal {
        cancel.send_replace(true);
        events.close();
        // Results already handed over still count.
        while let Ok(event) = events.try_recv() {
            writer.apply(event).await;
        }
    }

    writer.tally.finalize(&mut writer.batch, end);
    writer.persist_batch().await;
    shared.running.lock().remove(&batch_id);
    writer.status.send_replace(writer.batch.clone());

    info!(
        status = %writer.batch.status,
        successful = writer.batch.successful_evaluations,
        failed = writer.batch.failed_evaluations,
        accuracy = ?writer.batch.aggregate_accuracy,
        "Batch finished"
    );
}

async fn run_task(
    shared: Arc<Shared>,
    run: Arc<BatchRun>,
    mut task: EvaluationTask,
    mut cancel: watch::Receiver<bool>,
    events: mpsc::Sender<TaskEvent>,
) {
    let _permit = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return,
        permit = shared.limiter.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    task.start();
    if events.send(TaskEvent::Started(task.clone())).await.is_err() {
        return;
    }

    let started = Instant::now();
    let evaluation = AssertUnwindSafe(evaluate(&shared, &run, task.clone())).catch_unwind();
    let mut finished = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => {
            debug!("Evaluation abandoned");
            return;
        }
        outcome = evaluation => match outcome {
            Ok(finished) => finished,
            Err(panic) => {
                let message = panic_message(panic);
                warn!(error = %message, "Evaluation panicked");
                task.fail(ErrorType::UnknownError, message);
                task
            }
        },
    };
    if finished.latency_ms.is_none() {
        finished.latency_ms = Some(millis(started.elapsed()));
    }

    debug!(status = %finished.status, score = ?finished.score, "Evaluation finished");
    let _ = events.send(TaskEvent::Finished(finished)).await;
}

/// Call the model and score its answer. Failures are recorded on the task.
async fn evaluate(shared: &Shared, run: &BatchRun, mut task: EvaluationTask) -> EvaluationTask {
    let resolved = match shared.registry.resolve(&task.model_id) {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(error = %e, "Model cannot be resolved");
            task.fail(ErrorType::ProviderError, e.to_string());
            return task;
        }
    };

    let request = run.request_for(&resolved.provider_model_id);
    let started = Instant::now();
    let outcome = tokio::time::timeout(run.task_timeout, resolved.backend.generate(&request)).await;
    let elapsed = started.elapsed();

    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(ProviderError::Timeout(after))) => {
            task.fail(
                ErrorType::Timeout,
                format!("provider timed out after {:?}", after),
            );
            task.latency_ms = Some(millis(elapsed));
            return task;
        }
        Ok(Err(e)) => {
            warn!(provider = %resolved.provider, error = %e, "Provider call failed");
            task.fail(ErrorType::ProviderError, e.to_string());
            task.latency_ms = Some(millis(elapsed));
            return task;
        }
        Err(_) => {
            task.fail(
                ErrorType::Timeout,
                format!("evaluation timed out after {:?}", run.task_timeout),
            );
            task.latency_ms = Some(millis(elapsed));
            return task;
        }
    };

    task.latency_ms = Some(millis(response.latency.unwrap_or(elapsed)));
    task.provider_request_id = response.request_id.clone();
    if let Some(usage) = &response.usage {
        task.input_tokens = Some(usage.prompt_tokens);
        task.output_tokens = Some(usage.completion_tokens);
        task.total_tokens = Some(usage.total());
    }
    if let Some(cost) = &response.cost {
        task.input_cost = Some(cost.input);
        task.output_cost = Some(cost.output);
        task.total_cost = Some(cost.total);
    }

    let result = score_response(shared, run, &response.content).await;
    task.raw_output = Some(response.content);
    task.is_correct = Some(result.is_correct);
    task.score = Some(result.score);
    task.score_details = serde_json::to_value(&result.details).ok();
    task.error_message = result.error;
    task.parsed_output = Some(result.parsed_output);
    task.complete();
    task
}

async fn score_response(shared: &Shared, run: &BatchRun, content: &str) -> ScoreResult {
    let tc = &run.test_case;
    match (tc.evaluation_type, &shared.judge) {
        (EvaluationType::LlmJudge, Some(judge)) => match judge.judge(tc, content).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Judge failed; scoring as zero");
                ScoreResult::degraded(parse_response(content).value, e.to_string())
            }
        },
        _ => score_or_degrade(
            content,
            &tc.expected_output,
            tc.evaluation_type,
            &run.scoring,
            tc.output_schema.as_ref(),
        ),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => format!("evaluation panicked: {}", message),
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => format!("evaluation panicked: {}", message),
            Err(_) => "evaluation panicked".to_string(),
        },
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
