//! Provider factories and the provider registry.
//!
//! Factories turn JSON settings into backends. The registry is built once
//! at startup from [`RuntimeConfig`], then shared by `Arc` with everything
//! that needs to reach a model.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = ProviderRegistry::with_defaults();
//! registry.register(Arc::new(LocalProviderFactory::new(residency.clone())));
//! registry.build_from_config(&config)?;
//!
//! let resolved = registry.resolve("gpt-4")?;
//! let response = resolved.backend.generate(&request).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use super::{ProviderBackend, ProviderError};
use crate::cache::HealthCache;
use crate::config::{ModelRoute, RuntimeConfig};

/// Builds backends of one provider type from JSON settings.
pub trait ProviderFactory: Send + Sync {
    /// Type name used in config, e.g. "openai", "anthropic", "local".
    fn provider_type(&self) -> &'static str;

    fn create(&self, settings: &JsonValue) -> Result<Arc<dyn ProviderBackend>, ProviderError>;

    /// Check settings without building a backend.
    fn validate_config(&self, settings: &JsonValue) -> Result<(), ProviderError>;

    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    fn description(&self) -> &'static str {
        "Model provider"
    }
}

/// A model id resolved to the backend that serves it.
#[derive(Clone)]
pub struct ResolvedModel {
    /// Provider instance name
    pub provider: String,
    /// Identifier to send to the backend
    pub provider_model_id: String,
    pub backend: Arc<dyn ProviderBackend>,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("provider", &self.provider)
            .field("provider_model_id", &self.provider_model_id)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Factories, named backend instances, and model routing.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
    instances: BTreeMap<String, Arc<dyn ProviderBackend>>,
    routes: BTreeMap<String, ModelRoute>,
    health: HealthCache,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any with the same type.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Build a backend from a type name and settings.
    pub fn create(
        &self,
        provider_type: &str,
        settings: &JsonValue,
    ) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
        self.factory(provider_type)?.create(settings)
    }

    pub fn validate(&self, provider_type: &str, settings: &JsonValue) -> Result<(), ProviderError> {
        self.factory(provider_type)?.validate_config(settings)
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(provider_type).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                provider_type,
                self.available_types()
            ))
        })
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    pub fn default_config(&self, provider_type: &str) -> Option<JsonValue> {
        self.factories
            .get(provider_type)
            .map(|f| f.default_config())
    }

    /// Add a named backend directly.
    pub fn add_instance(&mut self, name: impl Into<String>, backend: Arc<dyn ProviderBackend>) {
        self.instances.insert(name.into(), backend);
    }

    /// Route a benchmark model id to a provider instance.
    pub fn add_route(&mut self, model_id: impl Into<String>, route: ModelRoute) {
        self.routes.insert(model_id.into(), route);
    }

    pub fn instance(&self, name: &str) -> Option<&Arc<dyn ProviderBackend>> {
        self.instances.get(name)
    }

    pub fn instance_names(&self) -> Vec<&str> {
        self.instances.keys().map(|s| s.as_str()).collect()
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.routes.keys().map(|s| s.as_str()).collect()
    }

    /// Build every configured provider instance and take over the model
    /// routing table. Settings are layered over the factory's defaults.
    pub fn build_from_config(&mut self, config: &RuntimeConfig) -> Result<(), ProviderError> {
        self.health = HealthCache::new(config.registry.health_check_ttl);

        for (name, provider) in &config.providers {
            let factory = self.factory(&provider.provider_type)?.clone();
            let settings = merge_settings(factory.default_config(), &provider.settings);
            factory.validate_config(&settings)?;
            let backend = factory.create(&settings)?;
            info!(provider = %name, provider_type = %provider.provider_type, "Provider ready");
            self.instances.insert(name.clone(), backend);
        }

        for (model_id, route) in &config.models {
            self.routes.insert(model_id.clone(), route.clone());
        }

        Ok(())
    }

    /// Find the backend serving `model_id`.
    pub fn resolve(&self, model_id: &str) -> Result<ResolvedModel, ProviderError> {
        let route = self.routes.get(model_id).ok_or_else(|| {
            ProviderError::NotConfigured(format!("Unknown model '{}'", model_id))
        })?;

        let backend = self.instances.get(&route.provider).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Provider '{}' for model '{}' is not registered",
                route.provider, model_id
            ))
        })?;

        Ok(ResolvedModel {
            provider: route.provider.clone(),
            provider_model_id: route.provider_model_id(model_id).to_string(),
            backend: backend.clone(),
        })
    }

    /// Health of one provider instance, cached for the configured TTL.
    /// `None` if no such instance exists.
    pub async fn health_check(&self, name: &str) -> Option<bool> {
        let backend = self.instances.get(name)?.clone();
        let healthy = self
            .health
            .get_or_probe(name, async move { backend.health_check().await })
            .await;
        debug!(provider = %name, healthy, "Health check");
        Some(healthy)
    }

    /// Health of every provider instance, probed concurrently.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let names: Vec<&str> = self.instance_names();
        let results = join_all(names.iter().map(|name| self.health_check(name))).await;

        names
            .into_iter()
            .zip(results)
            .map(|(name, healthy)| (name.to_string(), healthy.unwrap_or(false)))
            .collect()
    }

    /// Registry with the remote factories compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "openai")]
        {
            registry.register(Arc::new(super::OpenAiProviderFactory));
            registry.register(Arc::new(super::TogetherProviderFactory));
        }

        #[cfg(feature = "anthropic")]
        registry.register(Arc::new(super::AnthropicProviderFactory));

        #[cfg(feature = "google")]
        registry.register(Arc::new(super::GoogleProviderFactory));

        registry
    }
}

/// Shallow merge of `overrides` onto `defaults`.
fn merge_settings(defaults: JsonValue, overrides: &JsonValue) -> JsonValue {
    match (defaults, overrides) {
        (JsonValue::Object(mut base), JsonValue::Object(extra)) => {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
            JsonValue::Object(base)
        }
        (_, overrides) => overrides.clone(),
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("factories", &self.available_types())
            .field("instances", &self.instance_names())
            .field("models", &self.model_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Capabilities, GenerateRequest, ProviderResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        name: String,
        healthy: bool,
        probes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProviderBackend for MockBackend {
        async fn generate(
            &self,
            request: &GenerateRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::text("mock response", request.model.clone()))
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn health_check(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct MockFactory {
        probes: Arc<AtomicUsize>,
    }

    impl ProviderFactory for MockFactory {
        fn provider_type(&self) -> &'static str {
            "mock"
        }

        fn create(&self, settings: &JsonValue) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
            Ok(Arc::new(MockBackend {
                name: settings["name"].as_str().unwrap_or("mock").to_string(),
                healthy: settings["healthy"].as_bool().unwrap_or(true),
                probes: self.probes.clone(),
            }))
        }

        fn validate_config(&self, settings: &JsonValue) -> Result<(), ProviderError> {
            if settings["reject"].as_bool() == Some(true) {
                return Err(ProviderError::NotConfigured("rejected".to_string()));
            }
            Ok(())
        }

        fn default_config(&self) -> JsonValue {
            serde_json::json!({"name": "default-mock"})
        }
    }

    fn registry_with_mock() -> (ProviderRegistry, Arc<AtomicUsize>) {
        let probes = Arc::new(AtomicUsize::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockFactory {
            probes: probes.clone(),
        }));
        (registry, probes)
    }

    const CONFIG: &str = r#"
providers:
  primary:
    type: mock
  broken:
    type: mock
    settings:
      name: broken
      healthy: false
models:
  gpt-4:
    provider: primary
  llama3:
    provider: broken
    provider_model_id: "llama3:8b"
"#;

    #[test]
    fn test_register_and_create() {
        let (registry, _) = registry_with_mock();
        assert!(registry.has_provider("mock"));
        assert!(!registry.has_provider("unknown"));

        let backend = registry
            .create("mock", &serde_json::json!({"name": "test-mock"}))
            .unwrap();
        assert_eq!(backend.name(), "test-mock");
        assert_eq!(registry.available_types(), vec!["mock"]);
    }

    #[test]
    fn test_unknown_provider_type() {
        let registry = ProviderRegistry::new();
        match registry.create("unknown", &serde_json::json!({})) {
            Err(ProviderError::NotConfigured(msg)) => {
                assert!(msg.contains("Unknown provider type"));
            }
            _ => panic!("Expected NotConfigured error"),
        }
        assert!(registry.validate("unknown", &serde_json::json!({})).is_err());
    }

    #[test]
    fn test_build_from_config_and_resolve() {
        let (mut registry, _) = registry_with_mock();
        let config = RuntimeConfig::from_yaml(CONFIG).unwrap();
        registry.build_from_config(&config).unwrap();

        assert_eq!(registry.instance_names(), vec!["broken", "primary"]);
        assert_eq!(registry.instance("primary").unwrap().name(), "default-mock");
        assert_eq!(registry.instance("broken").unwrap().name(), "broken");

        let resolved = registry.resolve("llama3").unwrap();
        assert_eq!(resolved.provider, "broken");
        assert_eq!(resolved.provider_model_id, "llama3:8b");

        let resolved = registry.resolve("gpt-4").unwrap();
        assert_eq!(resolved.provider_model_id, "gpt-4");
    }

    #[test]
    fn test_resolve_unknown_model() {
        let (registry, _) = registry_with_mock();
        let err = registry.resolve("mystery").unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn test_resolve_route_to_missing_instance() {
        let (mut registry, _) = registry_with_mock();
        registry.add_route(
            "gpt-4",
            ModelRoute {
                provider: "nowhere".to_string(),
                provider_model_id: None,
            },
        );
        let err = registry.resolve("gpt-4").unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let (mut registry, _) = registry_with_mock();
        let config = RuntimeConfig::from_yaml(
            "providers:\n  bad:\n    type: mock\n    settings:\n      reject: true\n",
        )
        .unwrap();
        assert!(registry.build_from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_health_check_all_is_cached() {
        let (mut registry, probes) = registry_with_mock();
        let config = RuntimeConfig::from_yaml(CONFIG).unwrap();
        registry.build_from_config(&config).unwrap();

        let health = registry.health_check_all().await;
        assert_eq!(health["primary"], true);
        assert_eq!(health["broken"], false);
        assert_eq!(probes.load(Ordering::SeqCst), 2);

        registry.health_check_all().await;
        assert_eq!(probes.load(Ordering::SeqCst), 2);

        assert_eq!(registry.health_check("absent").await, None);
    }

    #[cfg(all(feature = "openai", feature = "anthropic", feature = "google"))]
    #[test]
    fn test_with_defaults_registers_remote_providers() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.available_types(),
            vec!["anthropic", "google", "openai", "together"]
        );
        let google = registry
            .create("google", &serde_json::json!({"api_key": "test-key"}))
            .unwrap();
        assert_eq!(google.name(), "google");
    }

    #[test]
    fn test_merge_settings() {
        let merged = merge_settings(
            serde_json::json!({"base_url": "a", "model": "m"}),
            &serde_json::json!({"base_url": "b"}),
        );
        assert_eq!(merged, serde_json::json!({"base_url": "b", "model": "m"}));
    }
}
