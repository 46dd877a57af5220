//! Builder API for ergonomic circuit breaker configuration

use crate::{
    MemoryStorage, StorageBackend,
    callbacks::{Callbacks, Observation},
    circuit::{BreakerConfig, CircuitBreaker, CircuitContext},
    clock::Clock,
    errors::ConfigError,
};
use std::sync::Arc;

/// Builder for creating circuit breakers with fluent API
///
/// Setters store values as given. [`CircuitBuilder::try_build`] rejects an
/// invalid configuration, [`CircuitBuilder::build`] normalizes it with
/// [`BreakerConfig::normalized`].
pub struct CircuitBuilder {
    name: String,
    config: BreakerConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    clock: Option<Arc<dyn Clock>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            storage: None,
            clock: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of consecutive failed calls that opens the circuit
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open, in seconds
    pub fn open_duration_secs(mut self, seconds: f64) -> Self {
        self.config.open_duration_secs = seconds;
        self
    }

    /// Set the number of trial calls admitted while half-open
    pub fn half_open_max_probes(mut self, probes: usize) -> Self {
        self.config.half_open_max_probes = probes;
        self
    }

    /// Set the measurement window in seconds (0 disables rollover)
    pub fn rolling_window_secs(mut self, seconds: f64) -> Self {
        self.config.rolling_window_secs = seconds;
        self
    }

    /// Set the cooldown jitter factor (0.0 = no jitter, 1.0 = up to double)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Set custom storage backend
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Drive the default in-memory storage from a custom clock
    ///
    /// Ignored when an explicit storage backend is set.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Install a full callback set at once
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Set the observability hook for attempts and transitions
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Observation<'_>) + Send + Sync + 'static,
    {
        self.callbacks.on_event = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate the configuration and build the circuit breaker
    pub fn try_build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    /// Build the circuit breaker, normalizing out-of-range settings
    pub fn build(mut self) -> CircuitBreaker {
        self.config = self.config.normalized();
        self.assemble()
    }

    fn assemble(self) -> CircuitBreaker {
        let storage = match (self.storage, self.clock) {
            (Some(storage), _) => storage,
            (None, Some(clock)) => Arc::new(MemoryStorage::with_clock(clock)),
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        let context = CircuitContext::new(self.name, self.config, storage);
        CircuitBreaker::with_context_and_callbacks(context, self.callbacks)
    }
}
