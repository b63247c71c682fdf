//! Provider backend abstractions for openbench-runtime.
//!
//! This module defines the trait every text-generation backend implements,
//! plus implementations for OpenAI-compatible APIs, Anthropic, Google Gemini
//! and locally hosted models served through the residency cache.
//!
//! ## Security
//!
//! All remote providers use the [`secrets`] module for credential handling.
//! See [`ApiCredential`] for the recommended patterns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;

mod factory;
pub mod local;
pub mod pricing;
pub mod secrets;

#[cfg(feature = "anthropic")]
mod anthropic;

#[cfg(feature = "google")]
mod google;

#[cfg(feature = "openai")]
mod openai;

pub use factory::{ProviderFactory, ProviderRegistry, ResolvedModel};
pub use local::{LocalBackend, LocalProviderFactory};
pub use pricing::{cost_for, Cost, ModelPrice};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicProvider, AnthropicProviderFactory};

#[cfg(feature = "google")]
pub use google::{GoogleProvider, GoogleProviderFactory};

#[cfg(feature = "openai")]
pub use openai::{OpenAiCompatibleProvider, OpenAiProviderFactory, TogetherProviderFactory};

/// Errors from provider backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The call exceeded its deadline.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The backend answered with an error.
    #[error("Remote error{}: {message}", status_suffix(.status))]
    RemoteError { status: Option<u16>, message: String },

    /// Transport or decoding failure.
    #[error("Provider failure: {0}")]
    Unknown(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl ProviderError {
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        ProviderError::RemoteError {
            status,
            message: message.into(),
        }
    }
}

/// Feature flags a backend advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_structured_output: bool,
    pub supports_json_mode: bool,
    pub supports_function_calling: bool,
    pub supports_system_messages: bool,
    pub supports_streaming: bool,
    pub max_context_length: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_structured_output: false,
            supports_json_mode: false,
            supports_function_calling: false,
            supports_system_messages: true,
            supports_streaming: false,
            max_context_length: 4096,
        }
    }
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Provider-side model identifier
    pub model: String,

    pub prompt: String,

    pub system_prompt: Option<String>,

    /// Sampling temperature; backends fall back to their own default
    pub temperature: Option<f32>,

    pub max_tokens: Option<u32>,

    /// Ask for a JSON-only answer
    pub json_mode: bool,

    /// Schema the answer should satisfy, used for prompting when the
    /// backend has no native JSON mode
    pub output_schema: Option<JsonValue>,

    /// Per-call deadline
    pub timeout: Duration,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            json_mode: false,
            output_schema: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A chat message sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Build the message list for a request. Backends without system-message
/// support get the system prompt prepended to the user prompt.
pub fn format_messages(request: &GenerateRequest, capabilities: &Capabilities) -> Vec<ChatMessage> {
    match request.system_prompt.as_deref() {
        Some(system) if capabilities.supports_system_messages => vec![
            ChatMessage::system(system),
            ChatMessage::user(request.prompt.clone()),
        ],
        Some(system) => vec![ChatMessage::user(format!("{}\n\n{}", system, request.prompt))],
        None => vec![ChatMessage::user(request.prompt.clone())],
    }
}

/// Token usage from a generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Response from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// Generated text
    pub content: String,

    /// Model that answered, as reported by the backend
    pub model: String,

    pub usage: Option<TokenUsage>,

    /// Latency measured by the backend
    pub latency: Option<Duration>,

    /// Provider-assigned request id
    pub request_id: Option<String>,

    pub cost: Option<Cost>,
}

impl ProviderResponse {
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage: None,
            latency: None,
            request_id: None,
            cost: None,
        }
    }
}

/// Provider abstraction that allows swapping text-generation backends.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Run one generation.
    async fn generate(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError>;

    /// Feature flags of this backend.
    fn capabilities(&self) -> Capabilities;

    /// Cheap probe. Never fails, only reports unhealthy.
    async fn health_check(&self) -> bool;

    /// Provider name for logs and metrics.
    fn name(&self) -> &str;

    /// Estimate tokens for a text.
    fn estimate_tokens(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }

    /// Messages for `request` under this backend's capabilities.
    fn format_messages(&self, request: &GenerateRequest) -> Vec<ChatMessage> {
        format_messages(request, &self.capabilities())
    }
}

/// Rough token estimate: ~4 chars per token.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_creation() {
        let system = ChatMessage::system("You are a helpful assistant.");
        assert_eq!(system.role, "system");

        let user = ChatMessage::user("Hello!");
        assert_eq!(user.role, "user");

        let assistant = ChatMessage::assistant("Hi there!");
        assert_eq!(assistant.role, "assistant");
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn test_format_messages_with_system_support() {
        let request = GenerateRequest::new("m", "What is 2+2?")
            .with_system_prompt(Some("Answer tersely.".to_string()));
        let messages = format_messages(&request, &Capabilities::default());
        assert_eq!(
            messages,
            vec![
                ChatMessage::system("Answer tersely."),
                ChatMessage::user("What is 2+2?")
            ]
        );
    }

    #[test]
    fn test_format_messages_without_system_support() {
        let request = GenerateRequest::new("m", "What is 2+2?")
            .with_system_prompt(Some("Answer tersely.".to_string()));
        let capabilities = Capabilities {
            supports_system_messages: false,
            ..Capabilities::default()
        };
        let messages = format_messages(&request, &capabilities);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "Answer tersely.\n\nWhat is 2+2?");
    }

    #[test]
    fn test_format_messages_without_system_prompt() {
        let request = GenerateRequest::new("m", "hi");
        let messages = format_messages(&request, &Capabilities::default());
        assert_eq!(messages, vec![ChatMessage::user("hi")]);
    }

    #[test]
    fn test_remote_error_display() {
        let err = ProviderError::remote(Some(503), "overloaded");
        assert_eq!(err.to_string(), "Remote error (503): overloaded");
        let err = ProviderError::remote(None, "model busy");
        assert_eq!(err.to_string(), "Remote error: model busy");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
