//! Runtime configuration.
//!
//! Loaded from YAML or JSON. Durations are human-readable (`"30s"`, `"2m"`).
//!
//! ```yaml
//! orchestrator:
//!   max_concurrent_evaluations: 10
//!   task_timeout: 30s
//!   batch_timeout: 2m
//! residency:
//!   capacity: 2
//!   host: http://localhost:11434
//! providers:
//!   openai:
//!     type: openai
//!   local:
//!     type: local
//! models:
//!   gpt-4:
//!     provider: openai
//!   llama3:
//!     provider: local
//!     provider_model_id: llama3:8b
//! local_models:
//!   "llama3:8b":
//!     preload: true
//!     supports_json_mode: true
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde adapter for `humantime` durations.
pub(crate) mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub orchestrator: OrchestratorConfig,
    pub residency: ResidencyConfig,
    pub registry: RegistryConfig,
    /// Provider instance name → factory type and settings
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Benchmark model id → provider routing
    pub models: BTreeMap<String, ModelRoute>,
    /// Locally hosted models managed by the residency cache
    pub local_models: BTreeMap<String, LocalModelConfig>,
}

/// Fan-out limits and per-call defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Process-wide cap on in-flight provider calls
    pub max_concurrent_evaluations: usize,

    #[serde(with = "duration_human")]
    pub task_timeout: Duration,

    #[serde(with = "duration_human")]
    pub batch_timeout: Duration,

    pub temperature: f32,

    pub max_tokens: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: 10,
            task_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(120),
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

/// Model residency cache and model host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// Maximum simultaneously loaded models
    pub capacity: usize,

    /// Base URL of the model server
    pub host: String,

    #[serde(with = "duration_human")]
    pub request_timeout: Duration,

    #[serde(with = "duration_human")]
    pub smoke_test_timeout: Duration,

    #[serde(with = "duration_human")]
    pub pull_timeout: Duration,

    /// Health probe attempts before preloading gives up on the host
    pub health_probe_attempts: usize,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            host: "http://localhost:11434".to_string(),
            request_timeout: Duration::from_secs(60),
            smoke_test_timeout: Duration::from_secs(30),
            pull_timeout: Duration::from_secs(300),
            health_probe_attempts: 3,
        }
    }
}

/// Provider registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long health check results are reused
    #[serde(with = "duration_human")]
    pub health_check_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_ttl: Duration::from_secs(60),
        }
    }
}

/// A named provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Factory type, e.g. "openai", "anthropic", "google", "together", "local"
    #[serde(rename = "type")]
    pub provider_type: String,

    /// Factory-specific settings
    #[serde(default = "empty_object")]
    pub settings: JsonValue,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

/// Where a benchmark model id is served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    /// Provider instance name
    pub provider: String,

    /// Identifier sent to the provider; defaults to the model id
    #[serde(default)]
    pub provider_model_id: Option<String>,
}

impl ModelRoute {
    pub fn provider_model_id<'a>(&'a self, model_id: &'a str) -> &'a str {
        self.provider_model_id.as_deref().unwrap_or(model_id)
    }
}

/// Settings for a locally hosted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModelConfig {
    pub display_name: Option<String>,
    pub enabled: bool,
    /// Load at startup
    pub preload: bool,
    /// Per-model in-flight request limit
    pub max_concurrent: usize,
    pub context_window: u32,
    pub supports_json_mode: bool,
    pub default_temperature: f32,
    #[serde(with = "duration_human")]
    pub timeout: Duration,
    pub size_gb: Option<f64>,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            enabled: true,
            preload: false,
            max_concurrent: 1,
            context_window: 2048,
            supports_json_mode: false,
            default_temperature: 0.7,
            timeout: Duration::from_secs(30),
            size_gb: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse from YAML and validate.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` or YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.max_concurrent_evaluations == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_concurrent_evaluations must be positive".to_string(),
            ));
        }
        if o.task_timeout.is_zero() || o.batch_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "orchestrator timeouts must be positive".to_string(),
            ));
        }
        if self.residency.capacity == 0 {
            return Err(ConfigError::Invalid(
                "residency.capacity must be positive".to_string(),
            ));
        }
        if self.residency.smoke_test_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "residency.smoke_test_timeout must be positive".to_string(),
            ));
        }
        for (model_id, route) in &self.models {
            if !self.providers.contains_key(&route.provider) {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' references undeclared provider '{}'",
                    model_id, route.provider
                )));
            }
        }
        for (model_id, local) in &self.local_models {
            if local.max_concurrent == 0 {
                return Err(ConfigError::Invalid(format!(
                    "local model '{}' must allow at least one concurrent request",
                    model_id
                )));
            }
        }
        Ok(())
    }
}
