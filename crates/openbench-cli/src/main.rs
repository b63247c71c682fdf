//! OpenBench CLI - run and score LLM evaluations
//!
//! ## Commands
//!
//! - `run`: evaluate a test case across models and print the batch
//! - `score`: score a saved response offline
//! - `residency`: inspect and manage locally loaded models
//! - `health`: probe every configured provider

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use openbench_core::{score, Batch, EvaluationTask, EvaluationType, ScoringConfig, TestCase};
use openbench_runtime::residency::OllamaHost;
use openbench_runtime::telemetry::init_tracing;
use openbench_runtime::{
    BatchOptions, Judge, LocalProviderFactory, Orchestrator, ProviderJudge, ProviderRegistry,
    ResidencyCache, RuntimeConfig,
};

#[derive(Parser)]
#[command(name = "openbench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Benchmark LLMs against structured test cases", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a test case across a set of models
    Run {
        /// Runtime configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Test case file (YAML or JSON)
        #[arg(short, long)]
        test_case: PathBuf,

        /// Comma-separated model ids
        #[arg(short, long, value_delimiter = ',', required = true)]
        models: Vec<String>,

        /// Model id used to grade llm_judge test cases
        #[arg(long)]
        judge_model: Option<String>,

        /// Per-task timeout override in seconds
        #[arg(long)]
        task_timeout: Option<u64>,

        /// Print the batch and tasks as JSON
        #[arg(long)]
        json_output: bool,
    },

    /// Score a saved model response against an expected value
    Score {
        /// File holding the raw model response
        #[arg(short, long)]
        response: PathBuf,

        /// File holding the expected value (JSON; anything else is a string)
        #[arg(short, long)]
        expected: PathBuf,

        /// exact_match, structured_match or llm_judge
        #[arg(short = 't', long = "type", default_value = "structured_match")]
        evaluation_type: String,

        /// Scoring config as inline JSON
        #[arg(short, long)]
        config: Option<String>,

        /// Output JSON Schema file
        #[arg(short, long)]
        schema: Option<PathBuf>,
    },

    /// Inspect and manage locally loaded models
    Residency {
        /// Runtime configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        #[command(subcommand)]
        action: ResidencyAction,
    },

    /// Probe every configured provider
    Health {
        /// Runtime configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ResidencyAction {
    /// Show configured local models and what is loaded
    Status,
    /// Load every model marked for preloading
    Preload,
    /// Load one model, evicting the least recently used if needed
    Load { model: String },
    /// Unload one model
    Unload { model: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            test_case,
            models,
            judge_model,
            task_timeout,
            json_output,
        } => {
            cmd_run(
                &config,
                &test_case,
                models,
                judge_model.as_deref(),
                task_timeout,
                json_output,
            )
            .await
        }
        Commands::Score {
            response,
            expected,
            evaluation_type,
            config,
            schema,
        } => cmd_score(
            &response,
            &expected,
            &evaluation_type,
            config.as_deref(),
            schema.as_deref(),
        ),
        Commands::Residency { config, action } => cmd_residency(&config, action).await,
        Commands::Health { config } => cmd_health(&config).await,
    }
}

fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let config = RuntimeConfig::from_file(path)
        .with_context(|| format!("Failed to load config {:?}", path))?;
    config.validate().context("Invalid runtime configuration")?;
    Ok(config)
}

/// Residency cache seeded with whatever the model server already has loaded.
async fn residency_cache(config: &RuntimeConfig) -> Result<Arc<ResidencyCache>> {
    let host = OllamaHost::new(&config.residency).context("Failed to create model host client")?;
    let cache = Arc::new(ResidencyCache::new(
        &config.residency,
        config.local_models.clone(),
        Arc::new(host),
    ));
    if let Err(e) = cache.sync_with_host().await {
        tracing::warn!(error = %e, "Could not read loaded models from model server");
    }
    Ok(cache)
}

fn build_registry(config: &RuntimeConfig, cache: Arc<ResidencyCache>) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::with_defaults();
    registry.register(Arc::new(LocalProviderFactory::new(cache)));
    registry
        .build_from_config(config)
        .context("Failed to build providers")?;
    Ok(registry)
}

async fn cmd_run(
    config_path: &Path,
    test_case_path: &Path,
    models: Vec<String>,
    judge_model: Option<&str>,
    task_timeout: Option<u64>,
    json_output: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let test_case = TestCase::from_file(test_case_path)
        .with_context(|| format!("Failed to load test case {:?}", test_case_path))?;
    let test_case_id = test_case.id.clone();

    let cache = residency_cache(&config).await?;
    let report = cache.preload().await;
    for (model, error) in &report.failed {
        tracing::warn!(model_id = %model, error = %error, "Preload failed");
    }

    let registry = Arc::new(build_registry(&config, cache)?);
    let mut builder = Orchestrator::builder()
        .registry(registry.clone())
        .config(config.orchestrator.clone());

    if let Some(judge_model) = judge_model {
        let resolved = registry
            .resolve(judge_model)
            .with_context(|| format!("Judge model '{}' is not available", judge_model))?;
        let judge: Arc<dyn Judge> = Arc::new(
            ProviderJudge::new(resolved.backend, resolved.provider_model_id)
                .with_timeout(config.orchestrator.task_timeout),
        );
        builder = builder.judge(judge);
    }

    let orchestrator = builder.build().context("Failed to build orchestrator")?;
    orchestrator.put_test_case(test_case).await?;

    let options = BatchOptions {
        task_timeout: task_timeout.map(Duration::from_secs),
        ..BatchOptions::default()
    };
    let batch_id = orchestrator
        .submit_batch(&test_case_id, models, options)
        .await
        .context("Failed to submit batch")?;
    info!(batch_id = %batch_id, "Waiting for batch");

    let batch = orchestrator.wait_for_batch(batch_id).await?;
    let tasks = orchestrator.get_batch_tasks(batch_id).await?;

    if json_output {
        let output = serde_json::json!({ "batch": batch, "tasks": tasks });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_batch(&batch, &tasks);
    }
    Ok(())
}

fn print_batch(batch: &Batch, tasks: &[EvaluationTask]) {
    println!("Batch:     {}", batch.id);
    println!("Test case: {}", batch.test_case_id);
    println!(
        "Status:    {} ({}/{} done, {} ok, {} failed)",
        batch.status,
        batch.progress,
        batch.total,
        batch.successful_evaluations,
        batch.failed_evaluations
    );
    if let Some(accuracy) = batch.aggregate_accuracy {
        println!("Accuracy:  {:.3}", accuracy);
    }
    if let Some(latency) = batch.aggregate_latency_ms {
        println!("Latency:   {:.0} ms", latency);
    }
    if let Some(message) = &batch.error_message {
        println!("Error:     {}", message);
    }
    println!();
    println!(
        "{:<32} {:<10} {:>7} {:>10} {:>10}",
        "MODEL", "STATUS", "SCORE", "LATENCY", "COST"
    );
    for task in tasks {
        println!(
            "{:<32} {:<10} {:>7} {:>10} {:>10}",
            task.model_id,
            task.status.to_string(),
            task.score.map(|s| format!("{:.3}", s)).unwrap_or_else(|| "-".into()),
            task.latency_ms
                .map(|l| format!("{:.0}ms", l))
                .unwrap_or_else(|| "-".into()),
            task.total_cost
                .map(|c| format!("${:.4}", c))
                .unwrap_or_else(|| "-".into()),
        );
        if let Some(error) = &task.error_message {
            println!("    {}", error);
        }
    }
}

fn cmd_score(
    response_path: &Path,
    expected_path: &Path,
    evaluation_type: &str,
    config: Option<&str>,
    schema_path: Option<&Path>,
) -> Result<()> {
    let response = std::fs::read_to_string(response_path)
        .with_context(|| format!("Failed to read response {:?}", response_path))?;
    let expected_text = std::fs::read_to_string(expected_path)
        .with_context(|| format!("Failed to read expected value {:?}", expected_path))?;
    let expected = serde_json::from_str::<JsonValue>(&expected_text)
        .unwrap_or_else(|_| JsonValue::String(expected_text.trim().to_string()));

    let evaluation_type: EvaluationType = evaluation_type.parse()?;
    let config_value = config
        .map(serde_json::from_str::<JsonValue>)
        .transpose()
        .context("Scoring config is not valid JSON")?;
    let scoring = ScoringConfig::from_evaluation_config(config_value.as_ref())?;

    let schema = match schema_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read schema {:?}", path))?;
            Some(serde_json::from_str::<JsonValue>(&text).context("Schema is not valid JSON")?)
        }
        None => None,
    };

    let result = score(&response, &expected, evaluation_type, &scoring, schema.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_residency(config_path: &Path, action: ResidencyAction) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = residency_cache(&config).await?;

    match action {
        ResidencyAction::Status => {
            println!("Capacity: {}", cache.capacity());
            for entry in cache.catalog() {
                let status = cache.status(&entry.model_id);
                println!(
                    "  {:<32} {:<10} {}",
                    entry.model_id, status.state, entry.display_name
                );
            }
        }
        ResidencyAction::Preload => {
            let report = cache.preload().await;
            for model in &report.loaded {
                println!("loaded  {}", model);
            }
            for (model, error) in &report.failed {
                println!("failed  {}: {}", model, error);
            }
            if !report.failed.is_empty() && report.loaded.is_empty() {
                bail!("No model could be preloaded");
            }
        }
        ResidencyAction::Load { model } => {
            let outcome = cache
                .load(&model)
                .await
                .with_context(|| format!("Failed to load '{}'", model))?;
            println!("{}: {:?}", model, outcome);
        }
        ResidencyAction::Unload { model } => {
            cache
                .unload(&model)
                .await
                .with_context(|| format!("Failed to unload '{}'", model))?;
            println!("Unloaded '{}'", model);
        }
    }
    Ok(())
}

async fn cmd_health(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = residency_cache(&config).await?;
    let registry = build_registry(&config, cache)?;

    let results = registry.health_check_all().await;
    if results.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }
    for (name, healthy) in &results {
        println!("{:<24} {}", name, if *healthy { "healthy" } else { "unhealthy" });
    }
    Ok(())
}
