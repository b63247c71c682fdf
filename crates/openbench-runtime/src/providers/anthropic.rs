//! Anthropic Messages API provider.
//!
//! ## Security
//!
//! The key is held as an [`ApiCredential`]; see the
//! [`secrets`](super::secrets) module.

use super::{
    factory::ProviderFactory,
    pricing::cost_for,
    secrets::{ApiCredential, CredentialSource},
    Capabilities, GenerateRequest, ProviderBackend, ProviderError, ProviderResponse, TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Environment variable name for the Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The Messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    credential: ApiCredential,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl AnthropicProvider {
    fn build(credential: ApiCredential, base_url: &str) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Unknown(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::build(
            ApiCredential::new(api_key, CredentialSource::Programmatic, "Anthropic API key"),
            ANTHROPIC_BASE_URL,
        )
    }

    /// From settings, falling back to `ANTHROPIC_API_KEY`.
    pub fn from_config(settings: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            settings,
            "api_key",
            ANTHROPIC_API_KEY_ENV,
            "Anthropic API key",
        )?;
        let base_url = settings["base_url"].as_str().unwrap_or(ANTHROPIC_BASE_URL);
        Self::build(credential, base_url)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request(&self, request: &GenerateRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system_prompt.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: vec![ContentBlock::Text {
                    text: request.prompt.clone(),
                }],
            }],
            temperature: request.temperature,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<ContentBlockResponse>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockResponse {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

#[async_trait]
impl ProviderBackend for AnthropicProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request(request);
        let started = Instant::now();

        // Only place the key is exposed
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.credential.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
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
            let message = serde_json::from_str::<AnthropicError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ProviderError::remote(Some(status.as_u16()), message));
        }

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(e.to_string()))?;
        let latency = started.elapsed();

        let content = body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        let usage = TokenUsage {
            prompt_tokens: body.usage.input_tokens,
            completion_tokens: body.usage.output_tokens,
        };

        debug!(
            provider = "anthropic",
            model = %body.model,
            latency_ms = latency.as_millis() as u64,
            "Message received"
        );

        Ok(ProviderResponse {
            content,
            cost: cost_for(&request.model, usage.prompt_tokens, usage.completion_tokens),
            model: body.model,
            usage: Some(usage),
            latency: Some(latency),
            request_id: Some(body.id),
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_structured_output: true,
            supports_json_mode: false,
            supports_function_calling: true,
            supports_system_messages: true,
            supports_streaming: true,
            max_context_length: 200_000,
        }
    }

    async fn health_check(&self) -> bool {
        // No free probe endpoint; a usable key is the best cheap signal
        !self.credential.is_empty()
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Factory for Anthropic backends.
///
/// ```json
/// {
///   "api_key": "sk-ant-...",      // Optional, falls back to ANTHROPIC_API_KEY env
///   "base_url": "https://..."      // Optional
/// }
/// ```
pub struct AnthropicProviderFactory;

impl ProviderFactory for AnthropicProviderFactory {
    fn provider_type(&self) -> &'static str {
        "anthropic"
    }

    fn create(&self, settings: &JsonValue) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
        Ok(Arc::new(AnthropicProvider::from_config(settings)?))
    }

    fn validate_config(&self, settings: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(settings, "api_key", ANTHROPIC_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "Anthropic API key required: set 'api_key' in settings or {} env",
                ANTHROPIC_API_KEY_ENV
            )));
        }

        if let Some(url) = settings["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "base_url": ANTHROPIC_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "Anthropic Messages API"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new("test-key").unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert!(!provider.capabilities().supports_json_mode);
        assert_eq!(provider.capabilities().max_context_length, 200_000);
    }

    #[test]
    fn test_request_body() {
        let provider = AnthropicProvider::new("test-key").unwrap();
        let request = GenerateRequest::new("claude-3-haiku-20240307", "Name a planet")
            .with_system_prompt(Some("One word.".to_string()));

        let body = serde_json::to_value(provider.build_request(&request)).unwrap();
        assert_eq!(body["system"], "One word.");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(body["messages"][0]["content"][0]["text"], "Name a planet");
    }

    #[test]
    fn test_factory_create_with_api_key() {
        let factory = AnthropicProviderFactory;
        assert_eq!(factory.provider_type(), "anthropic");
        let provider = factory
            .create(&serde_json::json!({"api_key": "test-api-key"}))
            .unwrap();
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn test_factory_validate_invalid_base_url() {
        let factory = AnthropicProviderFactory;
        let result = factory.validate_config(&serde_json::json!({
            "api_key": "test-key",
            "base_url": "invalid-url"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_config_tracks_source() {
        let provider = AnthropicProvider::from_config(&serde_json::json!({
            "api_key": "config-api-key",
            "base_url": "https://custom.api.com/v1"
        }))
        .unwrap();
        assert_eq!(provider.base_url, "https://custom.api.com/v1");
        assert_eq!(provider.credential.expose(), "config-api-key");
        assert_eq!(provider.credential.source(), CredentialSource::Config);
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret_key = "sk-ant-REDACTED";
        let provider = AnthropicProvider::new(secret_key).unwrap();
        let debug_output = format!("{:?}", provider);
        assert!(
            !debug_output.contains(secret_key),
            "API key was exposed in Debug output!"
        );
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_health_check_requires_key() {
        assert!(AnthropicProvider::new("sk-ant-x").unwrap().health_check().await);
        assert!(!AnthropicProvider::new("").unwrap().health_check().await);
    }
}
