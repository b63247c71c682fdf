//! Google Gemini provider (`generateContent`).
//!
//! The key travels in the `x-goog-api-key` header, never in the URL, so it
//! cannot leak through transport error messages.

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
use std::time::{Duration, Instant};
use tracing::debug;

/// Environment variable name for the Google API key.
pub const GOOGLE_API_KEY_ENV: &str = "GOOGLE_API_KEY";

const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Google Gemini provider.
pub struct GoogleProvider {
    credential: ApiCredential,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GoogleProvider {
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
            ApiCredential::new(api_key, CredentialSource::Programmatic, "Google API key"),
            GOOGLE_BASE_URL,
        )
    }

    /// From settings, falling back to `GOOGLE_API_KEY`.
    pub fn from_config(settings: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            settings,
            "api_key",
            GOOGLE_API_KEY_ENV,
            "Google API key",
        )?;
        let base_url = settings["base_url"].as_str().unwrap_or(GOOGLE_BASE_URL);
        Self::build(credential, base_url)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request(&self, request: &GenerateRequest) -> GeminiRequest {
        // Gemini gets the system prompt inline with the user turn
        let text = match request.system_prompt.as_deref() {
            Some(system) => format!("System: {}\n\nUser: {}", system, request.prompt),
            None => request.prompt.clone(),
        };
        GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                candidate_count: 1,
                max_output_tokens: request.max_tokens,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    candidate_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

/// Text of the first part of the first candidate.
fn first_candidate_text(body: &GeminiResponse) -> Result<String, ProviderError> {
    body.candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .and_then(|content| content.parts.first())
        .map(|part| part.text.clone())
        .ok_or_else(|| ProviderError::Unknown("No candidates in response".to_string()))
}

#[async_trait]
impl ProviderBackend for GoogleProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request(request);
        let started = Instant::now();

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, request.model
            ))
            .header("x-goog-api-key", self.credential.expose())
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
            let message = serde_json::from_str::<GeminiError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ProviderError::remote(Some(status.as_u16()), message));
        }

        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(e.to_string()))?;
        let latency = started.elapsed();
        let content = first_candidate_text(&body)?;

        let usage = body.usage_metadata.as_ref().map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
        });

        debug!(
            provider = "google",
            model = %request.model,
            latency_ms = latency.as_millis() as u64,
            "Content generated"
        );

        Ok(ProviderResponse {
            content,
            cost: usage
                .and_then(|u| cost_for(&request.model, u.prompt_tokens, u.completion_tokens)),
            model: request.model.clone(),
            usage,
            latency: Some(latency),
            request_id: body.response_id,
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_structured_output: false,
            supports_json_mode: false,
            supports_function_calling: true,
            supports_system_messages: true,
            supports_streaming: true,
            max_context_length: 32_000,
        }
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .header("x-goog-api-key", self.credential.expose())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn name(&self) -> &str {
        "google"
    }
}

/// Factory for Gemini backends.
///
/// ```json
/// {
///   "api_key": "AIza...",          // Optional, falls back to GOOGLE_API_KEY env
///   "base_url": "https://..."      // Optional
/// }
/// ```
pub struct GoogleProviderFactory;

impl ProviderFactory for GoogleProviderFactory {
    fn provider_type(&self) -> &'static str {
        "google"
    }

    fn create(&self, settings: &JsonValue) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
        Ok(Arc::new(GoogleProvider::from_config(settings)?))
    }

    fn validate_config(&self, settings: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(settings, "api_key", GOOGLE_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "Google API key required: set 'api_key' in settings or {} env",
                GOOGLE_API_KEY_ENV
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
        serde_json::json!({ "base_url": GOOGLE_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "Google Gemini generateContent API"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_capabilities() {
        let provider = GoogleProvider::new("test-key").unwrap();
        assert_eq!(provider.name(), "google");
        let caps = provider.capabilities();
        assert!(!caps.supports_json_mode);
        assert!(!caps.supports_structured_output);
        assert_eq!(caps.max_context_length, 32_000);
    }

    #[test]
    fn test_request_body_inlines_system_prompt() {
        let provider = GoogleProvider::new("test-key").unwrap();
        let request = GenerateRequest::new("gemini-pro", "Name a planet")
            .with_system_prompt(Some("One word.".to_string()))
            .with_temperature(0.2)
            .with_max_tokens(64);

        let body = serde_json::to_value(provider.build_request(&request)).unwrap();
        assert_eq!(
            body["contents"][0]["parts"][0]["text"],
            "System: One word.\n\nUser: Name a planet"
        );
        assert_eq!(body["generationConfig"]["candidateCount"], 1);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
        assert!((body["generationConfig"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_request_body_without_limits() {
        let provider = GoogleProvider::new("test-key").unwrap();
        let body =
            serde_json::to_value(provider.build_request(&GenerateRequest::new("gemini-pro", "hi")))
                .unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
        assert!(body["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn test_first_candidate_text() {
        let body: GeminiResponse = serde_json::from_value(serde_json::json!({
            "candidates": [
                {"content": {"parts": [{"text": "Mars"}]}, "finishReason": "STOP"}
            ],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 1}
        }))
        .unwrap();
        assert_eq!(first_candidate_text(&body).unwrap(), "Mars");
        let usage = body.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, 7);
        assert_eq!(usage.candidates_token_count, 1);
    }

    #[test]
    fn test_no_candidates_is_an_error() {
        let body: GeminiResponse =
            serde_json::from_value(serde_json::json!({ "candidates": [] })).unwrap();
        assert!(matches!(
            first_candidate_text(&body),
            Err(ProviderError::Unknown(_))
        ));
    }

    #[test]
    fn test_factory_create_with_api_key() {
        let factory = GoogleProviderFactory;
        assert_eq!(factory.provider_type(), "google");
        let provider = factory
            .create(&serde_json::json!({"api_key": "test-api-key"}))
            .unwrap();
        assert_eq!(provider.name(), "google");
    }

    #[test]
    fn test_factory_validate_invalid_base_url() {
        let result = GoogleProviderFactory.validate_config(&serde_json::json!({
            "api_key": "test-key",
            "base_url": "invalid-url"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret_key = "AIza-super-secret-key-12345";
        let provider = GoogleProvider::new(secret_key).unwrap();
        let debug_output = format!("{:?}", provider);
        assert!(!debug_output.contains(secret_key));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
