//! Registry owning one breaker per dependency key

use crate::{
    MemoryStorage, StorageBackend,
    callbacks::Callbacks,
    circuit::{BreakerConfig, CircuitBreaker, CircuitContext},
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Explicitly owned map from dependency key to its breaker
///
/// Breakers are created lazily with the registry's default configuration and
/// callbacks, and all of them share one storage backend. Each breaker keeps its
/// counters under its own instance key, so a replaced or removed breaker that
/// is still held elsewhere cannot touch its successor's counts.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    storage: Arc<dyn StorageBackend>,
    callbacks: Callbacks,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_storage(config, Arc::new(MemoryStorage::new()))
    }

    pub fn with_storage(config: BreakerConfig, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            storage,
            callbacks: Callbacks::new(),
        }
    }

    /// Callbacks installed on every breaker created afterwards
    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Breaker for `key`, created with the default configuration on first use
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(self.make(key, self.config.clone())));
        Arc::clone(breaker)
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(key).cloned()
    }

    /// Install a breaker with its own configuration, replacing any existing one
    pub fn insert_with(&self, key: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(self.make(key, config));
        self.breakers
            .write()
            .insert(key.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.breakers.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn remove(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(key)
    }

    /// Force every registered breaker back to Closed
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    fn make(&self, key: &str, config: BreakerConfig) -> CircuitBreaker {
        let context = CircuitContext::new(key, config, Arc::clone(&self.storage));
        CircuitBreaker::with_context_and_callbacks(context, self.callbacks.clone())
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("keys", &self.keys())
            .field("config", &self.config)
            .finish()
    }
}
