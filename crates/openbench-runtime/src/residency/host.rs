//! The model server behind the residency cache.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::providers::{GenerateRequest, ProviderError, ProviderResponse};

/// Failures talking to the model server.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("Model server unreachable: {0}")]
    Unreachable(String),

    #[error("Model '{0}' not found on model server")]
    ModelNotFound(String),

    #[error("Failed to pull model '{model}': {message}")]
    PullFailed { model: String, message: String },

    #[error("Smoke test failed for '{model}': {message}")]
    SmokeTestFailed { model: String, message: String },

    #[error("Model server timed out after {0:?}")]
    Timeout(Duration),
}

/// Load-side operations of a local model server.
///
/// The residency cache does the bookkeeping; the host does the work.
#[async_trait]
pub trait ModelHost: Send + Sync {
    /// Make sure the weights are present, pulling them if absent.
    async fn ensure_available(&self, model: &str) -> Result<(), HostError>;

    /// Minimal generation proving the model actually serves.
    async fn smoke_test(&self, model: &str, timeout: Duration) -> Result<(), HostError>;

    /// Run one generation against a model.
    async fn generate(&self, request: &GenerateRequest) -> Result<ProviderResponse, ProviderError>;

    /// Free the model's memory on the server. Best effort.
    async fn release(&self, _model: &str) -> Result<(), HostError> {
        Ok(())
    }

    /// Models currently loaded in the server's memory.
    async fn loaded_models(&self) -> Result<Vec<String>, HostError> {
        Ok(Vec::new())
    }

    /// Whether the server answers at all.
    async fn health_check(&self) -> bool;
}
