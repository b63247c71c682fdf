//! Ollama model server client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::host::{HostError, ModelHost};
use crate::config::ResidencyConfig;
use crate::providers::{GenerateRequest, ProviderError, ProviderResponse, TokenUsage};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// [`ModelHost`] backed by an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaHost {
    base_url: String,
    request_timeout: Duration,
    pull_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: GenerateOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TagsReply {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// `/api/ps` has the same shape as `/api/tags`.
type RunningReply = TagsReply;

impl OllamaHost {
    pub fn new(config: &ResidencyConfig) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| HostError::Unreachable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: config.host.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
            pull_timeout: config.pull_timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Names of models whose weights are on the server.
    pub async fn list_models(&self) -> Result<Vec<String>, HostError> {
        let reply: TagsReply = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?
            .json()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?;
        Ok(reply.models.into_iter().map(|m| m.name).collect())
    }

    async fn is_present(&self, model: &str) -> Result<bool, HostError> {
        let response = self
            .client
            .post(format!("{}/api/show", self.base_url))
            .json(&serde_json::json!({ "name": model }))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?;

        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(HostError::Unreachable(format!(
                "unexpected status {} from /api/show",
                status
            ))),
        }
    }

    async fn pull(&self, model: &str) -> Result<(), HostError> {
        info!(model_id = %model, "Pulling model weights");
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&serde_json::json!({ "name": model, "stream": false }))
            .timeout(self.pull_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HostError::Timeout(self.pull_timeout)
                } else {
                    HostError::Unreachable(e.to_string())
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(HostError::PullFailed {
                model: model.to_string(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl ModelHost for OllamaHost {
    async fn ensure_available(&self, model: &str) -> Result<(), HostError> {
        if self.is_present(model).await? {
            return Ok(());
        }
        self.pull(model).await?;
        if self.is_present(model).await? {
            Ok(())
        } else {
            Err(HostError::ModelNotFound(model.to_string()))
        }
    }

    async fn smoke_test(&self, model: &str, timeout: Duration) -> Result<(), HostError> {
        let request = GenerateRequest::new(model, "Hello").with_timeout(timeout);
        match self.generate(&request).await {
            Ok(response) if !response.content.trim().is_empty() => Ok(()),
            Ok(_) => Err(HostError::SmokeTestFailed {
                model: model.to_string(),
                message: "empty response".to_string(),
            }),
            Err(ProviderError::Timeout(after)) => Err(HostError::Timeout(after)),
            Err(e) => Err(HostError::SmokeTestFailed {
                model: model.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            system: request.system_prompt.as_deref(),
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
            format: request.json_mode.then_some("json"),
            keep_alive: None,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(request.timeout)
                } else {
                    ProviderError::Unknown(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::remote(Some(status.as_u16()), message));
        }

        let reply: GenerateReply = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(e.to_string()))?;
        let latency = started.elapsed();

        let usage = match (reply.prompt_eval_count, reply.eval_count) {
            (Some(prompt_tokens), Some(completion_tokens)) => Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
            }),
            _ => None,
        };

        Ok(ProviderResponse {
            content: reply.response,
            model: reply.model.unwrap_or_else(|| request.model.clone()),
            usage,
            latency: Some(latency),
            request_id: None,
            cost: None,
        })
    }

    async fn release(&self, model: &str) -> Result<(), HostError> {
        // keep_alive 0 asks the server to drop the model from memory
        let body = GenerateBody {
            model,
            prompt: "",
            stream: false,
            system: None,
            options: GenerateOptions {
                temperature: None,
                num_predict: Some(0),
            },
            format: None,
            keep_alive: Some(0),
        };
        self.client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?;
        debug!(model_id = %model, "Released model");
        Ok(())
    }

    async fn loaded_models(&self) -> Result<Vec<String>, HostError> {
        let reply: RunningReply = self
            .client
            .get(format!("{}/api/ps", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?
            .json()
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))?;
        Ok(reply.models.into_iter().map(|m| m.name).collect())
    }

    async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Model server health check failed");
                false
            }
        }
    }
}
