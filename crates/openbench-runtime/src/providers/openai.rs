//! OpenAI chat completions, and providers speaking the same protocol.
//!
//! Together AI serves an OpenAI-compatible API, so both are
//! [`OpenAiCompatibleProvider`] with different base URLs, credentials and
//! capabilities.

use super::{
    factory::ProviderFactory,
    pricing::cost_for,
    secrets::{ApiCredential, CredentialSource},
    Capabilities, ChatMessage, GenerateRequest, ProviderBackend, ProviderError, ProviderResponse,
    TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const TOGETHER_API_KEY_ENV: &str = "TOGETHER_API_KEY";

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const TOGETHER_BASE_URL: &str = "https://api.together.xyz/v1";

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

fn openai_capabilities() -> Capabilities {
    Capabilities {
        supports_structured_output: true,
        supports_json_mode: true,
        supports_function_calling: true,
        supports_system_messages: true,
        supports_streaming: true,
        max_context_length: 128_000,
    }
}

fn together_capabilities() -> Capabilities {
    Capabilities {
        supports_structured_output: false,
        supports_json_mode: true,
        supports_function_calling: false,
        supports_system_messages: true,
        supports_streaming: true,
        max_context_length: 32_768,
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatibleProvider {
    name: &'static str,
    credential: ApiCredential,
    base_url: String,
    capabilities: Capabilities,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiCompatibleProvider {
    fn build(
        name: &'static str,
        credential: ApiCredential,
        base_url: String,
        capabilities: Capabilities,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Unknown(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name,
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            capabilities,
            client,
        })
    }

    /// OpenAI with an explicit key.
    pub fn openai(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::build(
            "openai",
            ApiCredential::new(api_key, CredentialSource::Programmatic, "OpenAI API key"),
            OPENAI_BASE_URL.to_string(),
            openai_capabilities(),
        )
    }

    /// OpenAI from settings, falling back to `OPENAI_API_KEY`.
    pub fn openai_from_config(settings: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            settings,
            "api_key",
            OPENAI_API_KEY_ENV,
            "OpenAI API key",
        )?;
        let base_url = settings["base_url"].as_str().unwrap_or(OPENAI_BASE_URL);
        Self::build("openai", credential, base_url.to_string(), openai_capabilities())
    }

    /// Together AI from settings, falling back to `TOGETHER_API_KEY`.
    pub fn together_from_config(settings: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            settings,
            "api_key",
            TOGETHER_API_KEY_ENV,
            "Together API key",
        )?;
        let base_url = settings["base_url"].as_str().unwrap_or(TOGETHER_BASE_URL);
        Self::build(
            "together",
            credential,
            base_url.to_string(),
            together_capabilities(),
        )
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request(&self, request: &GenerateRequest) -> ChatRequest {
        ChatRequest {
            model: request.model.clone(),
            messages: self.format_messages(request),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: (request.json_mode && self.capabilities.supports_json_mode)
                .then(|| ResponseFormat {
                    type_: "json_object".to_string(),
                }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    type_: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl ProviderBackend for OpenAiCompatibleProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request(request);
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credential.expose())
            .timeout(request.timeout)
            .json(&body)
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
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ProviderError::remote(Some(status.as_u16()), message));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(e.to_string()))?;
        let latency = started.elapsed();

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        let usage = body.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        });
        let cost = usage.and_then(|u| cost_for(&request.model, u.prompt_tokens, u.completion_tokens));

        debug!(
            provider = self.name,
            model = %body.model,
            latency_ms = latency.as_millis() as u64,
            "Completion received"
        );

        Ok(ProviderResponse {
            content,
            model: body.model,
            usage,
            latency: Some(latency),
            request_id: body.id,
            cost,
        })
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn health_check(&self) -> bool {
        if self.credential.is_empty() {
            return false;
        }
        match self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(self.credential.expose())
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = self.name, error = %e, "Health check failed");
                false
            }
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}

fn validate_base_url(settings: &JsonValue) -> Result<(), ProviderError> {
    if let Some(url) = settings["base_url"].as_str() {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProviderError::NotConfigured(
                "base_url must start with http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}

/// Factory for OpenAI backends.
///
/// ```json
/// { "api_key": "sk-...", "base_url": "https://api.openai.com/v1" }
/// ```
pub struct OpenAiProviderFactory;

impl ProviderFactory for OpenAiProviderFactory {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, settings: &JsonValue) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
        Ok(Arc::new(OpenAiCompatibleProvider::openai_from_config(settings)?))
    }

    fn validate_config(&self, settings: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(settings, "api_key", OPENAI_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "OpenAI API key required: set 'api_key' in settings or {} env",
                OPENAI_API_KEY_ENV
            )));
        }
        validate_base_url(settings)
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "base_url": OPENAI_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "OpenAI chat completions"
    }
}

/// Factory for Together AI backends.
pub struct TogetherProviderFactory;

impl ProviderFactory for TogetherProviderFactory {
    fn provider_type(&self) -> &'static str {
        "together"
    }

    fn create(&self, settings: &JsonValue) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
        Ok(Arc::new(OpenAiCompatibleProvider::together_from_config(settings)?))
    }

    fn validate_config(&self, settings: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(settings, "api_key", TOGETHER_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "Together API key required: set 'api_key' in settings or {} env",
                TOGETHER_API_KEY_ENV
            )));
        }
        validate_base_url(settings)
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "base_url": TOGETHER_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "Together AI (OpenAI-compatible)"
    }
}
