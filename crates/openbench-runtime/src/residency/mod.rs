//! Model residency cache.
//!
//! Keeps at most `capacity` local models loaded on the model server.
//! Loading a new model into a full cache evicts the least recently used
//! model that has no requests in flight; busy models are never evicted.
//! Every model also has a per-model limit on concurrent inference requests.
//!
//! All bookkeeping (entries, recency, active-request counters) sits behind
//! one mutex. Host calls (pull, smoke test, release) run outside it, and
//! loads are serialized so a load decision cannot be raced by another load.
//!
//! ```ignore
//! let cache = Arc::new(ResidencyCache::new(&config.residency, config.local_models.clone(), host));
//! cache.preload().await;
//!
//! if let Some(_guard) = cache.acquire("llama3:8b") {
//!     // request counted until the guard drops
//! }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LocalModelConfig, ResidencyConfig};

pub mod host;
#[cfg(feature = "local")]
pub mod ollama;

pub use host::{HostError, ModelHost};
#[cfg(feature = "local")]
pub use ollama::OllamaHost;

/// Errors from residency operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResidencyError {
    #[error("Cannot load model: all {capacity} resident models have active requests")]
    CapacityExceeded { capacity: usize },

    #[error("Model '{0}' is not configured")]
    NotConfigured(String),

    #[error("Model '{model}' has {active} active requests, cannot unload")]
    ActiveRequestsPreventUnload { model: String, active: usize },

    #[error("Model '{model}' is unavailable: {reason}")]
    BackendUnavailable { model: String, reason: String },

    #[error("Model '{0}' is not loaded")]
    NotLoaded(String),
}

/// Snapshot of one resident model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidencyEntry {
    pub model_id: String,
    pub loaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub active_requests: usize,
}

/// What a successful `load` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    AlreadyResident,
    Loaded { evicted: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    /// Resident and serving
    Ready,
    /// Configured but not resident
    Available,
    Unknown,
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelState::Ready => "ready",
            ModelState::Available => "available",
            ModelState::Unknown => "unknown",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub model_id: String,
    pub state: ModelState,
    pub entry: Option<ResidencyEntry>,
}

/// One configured local model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub model_id: String,
    pub display_name: String,
    pub resident: bool,
    pub config: LocalModelConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

struct Slot {
    loaded_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    active: usize,
    recency: u64,
}

#[derive(Default)]
struct State {
    slots: HashMap<String, Slot>,
    tick: u64,
}

impl State {
    fn touch(&mut self, model: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(model) {
            slot.recency = tick;
            slot.last_used = Utc::now();
        }
    }

    fn lru_idle(&self) -> Option<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.active == 0)
            .min_by_key(|(_, slot)| slot.recency)
            .map(|(model, _)| model.clone())
    }

    fn has_idle(&self) -> bool {
        self.slots.values().any(|slot| slot.active == 0)
    }

    fn snapshot(model: &str, slot: &Slot) -> ResidencyEntry {
        ResidencyEntry {
            model_id: model.to_string(),
            loaded_at: slot.loaded_at,
            last_used: slot.last_used,
            active_requests: slot.active,
        }
    }
}

/// Bounded LRU pool of loaded local models.
pub struct ResidencyCache {
    capacity: usize,
    smoke_test_timeout: Duration,
    health_probe_attempts: usize,
    models: BTreeMap<String, LocalModelConfig>,
    host: Arc<dyn ModelHost>,
    state: Mutex<State>,
    load_lock: tokio::sync::Mutex<()>,
}

impl ResidencyCache {
    pub fn new(
        config: &ResidencyConfig,
        models: BTreeMap<String, LocalModelConfig>,
        host: Arc<dyn ModelHost>,
    ) -> Self {
        Self {
            capacity: config.capacity,
            smoke_test_timeout: config.smoke_test_timeout,
            health_probe_attempts: config.health_probe_attempts,
            models,
            host,
            state: Mutex::new(State::default()),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn host(&self) -> &Arc<dyn ModelHost> {
        &self.host
    }

    /// Config of an enabled model.
    pub fn model_config(&self, model: &str) -> Option<&LocalModelConfig> {
        self.models.get(model).filter(|c| c.enabled)
    }

    pub fn is_resident(&self, model: &str) -> bool {
        self.state.lock().slots.contains_key(model)
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Load a model, evicting the least recently used idle model if full.
    ///
    /// Fetch or smoke-test failure leaves the cache as it was.
    pub async fn load(&self, model: &str) -> Result<LoadOutcome, ResidencyError> {
        if self.model_config(model).is_none() {
            return Err(ResidencyError::NotConfigured(model.to_string()));
        }

        let _serial = self.load_lock.lock().await;

        {
            let mut state = self.state.lock();
            if state.slots.contains_key(model) {
                state.touch(model);
                debug!(model_id = %model, "Model already resident");
                return Ok(LoadOutcome::AlreadyResident);
            }
            if state.slots.len() >= self.capacity && !state.has_idle() {
                return Err(ResidencyError::CapacityExceeded {
                    capacity: self.capacity,
                });
            }
        }

        info!(model_id = %model, "Loading model");
        let unavailable = |e: HostError| ResidencyError::BackendUnavailable {
            model: model.to_string(),
            reason: e.to_string(),
        };
        self.host.ensure_available(model).await.map_err(unavailable)?;
        self.host
            .smoke_test(model, self.smoke_test_timeout)
            .await
            .map_err(unavailable)?;

        let evicted = {
            let mut state = self.state.lock();
            let evicted = if state.slots.len() >= self.capacity {
                // Requests may have started on the candidate while we were fetching
                let victim = state.lru_idle().ok_or(ResidencyError::CapacityExceeded {
                    capacity: self.capacity,
                })?;
                state.slots.remove(&victim);
                Some(victim)
            } else {
                None
            };

            state.tick += 1;
            let now = Utc::now();
            let recency = state.tick;
            state.slots.insert(
                model.to_string(),
                Slot {
                    loaded_at: now,
                    last_used: now,
                    active: 0,
                    recency,
                },
            );
            evicted
        };

        if let Some(victim) = &evicted {
            info!(model_id = %victim, "Evicted model");
            self.release(victim).await;
        }
        info!(model_id = %model, "Model loaded");

        Ok(LoadOutcome::Loaded { evicted })
    }

    /// Remove a resident model with no requests in flight.
    pub async fn unload(&self, model: &str) -> Result<(), ResidencyError> {
        {
            let mut state = self.state.lock();
            let slot = state
                .slots
                .get(model)
                .ok_or_else(|| ResidencyError::NotLoaded(model.to_string()))?;
            if slot.active > 0 {
                return Err(ResidencyError::ActiveRequestsPreventUnload {
                    model: model.to_string(),
                    active: slot.active,
                });
            }
            state.slots.remove(model);
        }

        self.release(model).await;
        info!(model_id = %model, "Model unloaded");
        Ok(())
    }

    async fn release(&self, model: &str) {
        if let Err(e) = self.host.release(model).await {
            warn!(model_id = %model, error = %e, "Failed to release model on host");
        }
    }

    /// Count one request against a resident model.
    ///
    /// `false` if the model is not resident or already at its limit.
    pub fn start_inference(&self, model: &str) -> bool {
        let limit = self.model_config(model).map_or(1, |c| c.max_concurrent);
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(model) else {
            return false;
        };
        if slot.active >= limit {
            return false;
        }
        slot.active += 1;
        state.touch(model);
        true
    }

    /// Release one request slot. Never goes below zero.
    pub fn end_inference(&self, model: &str) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(model) {
            slot.active = slot.active.saturating_sub(1);
        }
    }

    /// [`start_inference`](Self::start_inference) with a guard that ends it on drop.
    pub fn acquire(&self, model: &str) -> Option<InferenceGuard<'_>> {
        self.start_inference(model).then(|| InferenceGuard {
            cache: self,
            model: model.to_string(),
        })
    }

    /// Resident models, least recently used first.
    pub fn list_resident(&self) -> Vec<ResidencyEntry> {
        let state = self.state.lock();
        let mut slots: Vec<_> = state.slots.iter().collect();
        slots.sort_by_key(|(_, slot)| slot.recency);
        slots
            .into_iter()
            .map(|(model, slot)| State::snapshot(model, slot))
            .collect()
    }

    pub fn status(&self, model: &str) -> ModelStatus {
        let entry = {
            let state = self.state.lock();
            state.slots.get(model).map(|slot| State::snapshot(model, slot))
        };
        let state = match (&entry, self.model_config(model)) {
            (Some(_), _) => ModelState::Ready,
            (None, Some(_)) => ModelState::Available,
            (None, None) => ModelState::Unknown,
        };
        ModelStatus {
            model_id: model.to_string(),
            state,
            entry,
        }
    }

    /// Every enabled configured model.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let state = self.state.lock();
        self.models
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(model, config)| CatalogEntry {
                model_id: model.clone(),
                display_name: config.display_name.clone().unwrap_or_else(|| model.clone()),
                resident: state.slots.contains_key(model),
                config: config.clone(),
            })
            .collect()
    }

    /// Adopt models the host already has in memory.
    ///
    /// Only enabled configured models are adopted, in the order the host
    /// reports them, up to capacity. Returns the adopted model ids.
    pub async fn sync_with_host(&self) -> Result<Vec<String>, HostError> {
        let loaded = self.host.loaded_models().await?;

        let _serial = self.load_lock.lock().await;
        let mut state = self.state.lock();
        let mut adopted = Vec::new();
        for model in loaded {
            if state.slots.len() >= self.capacity {
                debug!(model_id = %model, "Cache full, not adopting host model");
                continue;
            }
            if self.model_config(&model).is_none() || state.slots.contains_key(&model) {
                continue;
            }
            state.tick += 1;
            let now = Utc::now();
            let recency = state.tick;
            state.slots.insert(
                model.clone(),
                Slot {
                    loaded_at: now,
                    last_used: now,
                    active: 0,
                    recency,
                },
            );
            adopted.push(model);
        }

        if !adopted.is_empty() {
            info!(models = ?adopted, "Adopted models already loaded on host");
        }
        Ok(adopted)
    }

    /// Load every model marked `preload`. Failures are logged per model.
    pub async fn preload(&self) -> PreloadReport {
        use backon::{ExponentialBuilder, Retryable};

        let probe = || async {
            if self.host.health_check().await {
                Ok(())
            } else {
                Err(HostError::Unreachable("health probe failed".to_string()))
            }
        };
        let reachable = probe
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(500))
                    .with_max_times(self.health_probe_attempts.saturating_sub(1)),
            )
            .sleep(tokio::time::sleep)
            .notify(|err: &HostError, delay: Duration| {
                debug!(error = %err, ?delay, "Model server not ready, retrying");
            })
            .await;
        if let Err(e) = reachable {
            warn!(error = %e, "Model server unreachable, preloading anyway");
        }

        let mut report = PreloadReport::default();
        let targets: Vec<String> = self
            .models
            .iter()
            .filter(|(_, c)| c.enabled && c.preload)
            .map(|(m, _)| m.clone())
            .collect();

        for model in targets {
            match self.load(&model).await {
                Ok(_) => report.loaded.push(model),
                Err(e) => {
                    warn!(model_id = %model, error = %e, "Preload failed");
                    report.failed.push((model, e.to_string()));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Preload finished"
        );
        report
    }
}

impl std::fmt::Debug for ResidencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidencyCache")
            .field("capacity", &self.capacity)
            .field("resident", &self.list_resident())
            .finish()
    }
}

/// Holds one inference slot; ends the inference when dropped.
pub struct InferenceGuard<'a> {
    cache: &'a ResidencyCache,
    model: String,
}

impl InferenceGuard<'_> {
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Drop for InferenceGuard<'_> {
    fn drop(&mut self) {
        self.cache.end_inference(&self.model);
    }
}
