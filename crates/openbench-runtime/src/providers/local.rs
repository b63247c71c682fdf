//! Local model execution through the residency cache.
//!
//! Each request loads its model if needed, takes one of the model's
//! inference slots for the duration of the call, and hands the generation
//! to the cache's [`ModelHost`](crate::residency::ModelHost).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::{
    estimate_tokens, factory::ProviderFactory, Capabilities, GenerateRequest, ProviderBackend,
    ProviderError, ProviderResponse, TokenUsage,
};
use crate::prompts::with_json_instructions;
use crate::residency::ResidencyCache;

const DEFAULT_MAX_TOKENS: u32 = 1000;

pub const CONCURRENCY_LIMIT_MESSAGE: &str = "model is at maximum concurrent request limit";

/// Backend for models hosted on the local model server.
pub struct LocalBackend {
    cache: Arc<ResidencyCache>,
}

impl LocalBackend {
    pub fn new(cache: Arc<ResidencyCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ResidencyCache> {
        &self.cache
    }

    /// Request as sent to the host: model defaults filled in, JSON
    /// instructions added when the model has no native JSON mode.
    fn prepare(&self, request: &GenerateRequest) -> Result<GenerateRequest, ProviderError> {
        let config = self.cache.model_config(&request.model).ok_or_else(|| {
            ProviderError::NotConfigured(format!("Local model '{}' is not configured", request.model))
        })?;

        let mut prepared = request.clone();
        prepared.temperature = Some(
            request
                .temperature
                .unwrap_or(config.default_temperature),
        );
        prepared.max_tokens = Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS));
        prepared.timeout = config.timeout;

        if request.json_mode && !config.supports_json_mode {
            prepared.prompt = with_json_instructions(&request.prompt, request.output_schema.as_ref());
            prepared.json_mode = false;
        }

        Ok(prepared)
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("cache", &self.cache)
            .finish()
    }
}

#[async_trait]
impl ProviderBackend for LocalBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        let prepared = self.prepare(request)?;
        let model = prepared.model.as_str();

        if !self.cache.is_resident(model) {
            self.cache
                .load(model)
                .await
                .map_err(|e| ProviderError::remote(None, e.to_string()))?;
        }

        let _slot = match self.cache.acquire(model) {
            Some(guard) => guard,
            None if !self.cache.is_resident(model) => {
                return Err(ProviderError::remote(
                    None,
                    format!("model '{}' was evicted before inference", model),
                ))
            }
            None => return Err(ProviderError::remote(None, CONCURRENCY_LIMIT_MESSAGE)),
        };

        let started = Instant::now();
        let mut response = self.cache.host().generate(&prepared).await?;

        if response.usage.is_none() {
            response.usage = Some(TokenUsage {
                prompt_tokens: estimate_tokens(&prepared.prompt),
                completion_tokens: estimate_tokens(&response.content),
            });
        }
        let latency = *response.latency.get_or_insert_with(|| started.elapsed());

        debug!(
            model_id = %model,
            latency_ms = latency.as_millis() as u64,
            "Local generation finished"
        );

        Ok(response)
    }

    /// JSON mode varies per model; the backend-wide flags are the
    /// conservative ones and the context length is the largest configured.
    fn capabilities(&self) -> Capabilities {
        let max_context_length = self
            .cache
            .catalog()
            .iter()
            .map(|entry| entry.config.context_window)
            .max()
            .unwrap_or(2048);

        Capabilities {
            supports_structured_output: true,
            supports_json_mode: false,
            supports_function_calling: false,
            supports_system_messages: true,
            supports_streaming: false,
            max_context_length,
        }
    }

    async fn health_check(&self) -> bool {
        self.cache.host().health_check().await
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Factory for local backends; every instance shares one residency cache.
pub struct LocalProviderFactory {
    cache: Arc<ResidencyCache>,
}

impl LocalProviderFactory {
    pub fn new(cache: Arc<ResidencyCache>) -> Self {
        Self { cache }
    }
}

impl ProviderFactory for LocalProviderFactory {
    fn provider_type(&self) -> &'static str {
        "local"
    }

    fn create(&self, _settings: &JsonValue) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
        Ok(Arc::new(LocalBackend::new(self.cache.clone())))
    }

    fn validate_config(&self, _settings: &JsonValue) -> Result<(), ProviderError> {
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Local models on the residency-managed model server"
    }
}
