//! Resilient invoker composing a circuit breaker with a retry executor
//!
//! The breaker is consulted once per logical call. Each attempt the executor
//! makes is forwarded to the breaker as partial progress and to the
//! observability hook, and the call's terminal outcome is reported exactly
//! once when the executor returns.

use crate::{
    StorageBackend,
    builder::CircuitBuilder,
    callbacks::Observation,
    cancel::CancellationToken,
    circuit::{BreakerConfig, BreakerState, CircuitBreaker, Report},
    classifier::{DefaultClassifier, ErrorClassifier},
    clock::Clock,
    errors::{AbandonReason, CircuitError, ConfigError, InvokeError},
    retry::{AttemptContext, RetryConfig, RetryExecutor},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Context provided to fallback closures when the breaker rejects a call
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Circuit name
    pub circuit_name: String,
    /// Breaker state at rejection time
    pub state: BreakerState,
    /// Timestamp when the circuit opened, if it was Open
    pub opened_at: Option<f64>,
}

/// Single entry point for protected remote calls to one dependency
#[derive(Debug, Clone)]
pub struct ResilientInvoker {
    breaker: Arc<CircuitBreaker>,
    executor: RetryExecutor,
}

impl ResilientInvoker {
    pub fn new(breaker: Arc<CircuitBreaker>, executor: RetryExecutor) -> Self {
        Self { breaker, executor }
    }

    /// Create a new invoker builder
    pub fn builder(name: impl Into<String>) -> InvokerBuilder {
        InvokerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Invoke `op` under the configured overall deadline
    pub fn call<T, E, F>(&self, op: F) -> Result<T, InvokeError<E>>
    where
        E: 'static,
        F: FnMut(&AttemptContext<'_>) -> Result<T, E>,
    {
        self.call_with_cancel(op, &CancellationToken::new())
    }

    /// Invoke `op`, giving up early once `cancel` fires
    pub fn call_with_cancel<T, E, F>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> Result<T, InvokeError<E>>
    where
        E: 'static,
        F: FnMut(&AttemptContext<'_>) -> Result<T, E>,
    {
        let deadline = Instant::now() + self.executor.config().overall_deadline;
        self.call_with_deadline(op, deadline, cancel)
    }

    /// Invoke `op` with an explicit deadline
    ///
    /// A rejected call never runs `op` and leaves the executor untouched.
    pub fn call_with_deadline<T, E, F>(
        &self,
        op: F,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<T, InvokeError<E>>
    where
        E: 'static,
        F: FnMut(&AttemptContext<'_>) -> Result<T, E>,
    {
        let permit = self.breaker.admit()?;
        let callbacks = self.breaker.callbacks();
        let name = self.breaker.name();

        let result = self.executor.run(op, deadline, cancel, |attempt| {
            permit.observe(attempt.outcome);
            callbacks.trigger_attempt(name, attempt);
        });

        permit.report(report_for(&result));
        result
    }

    /// Invoke `op`, serving `fallback` instead when the breaker rejects the call
    ///
    /// An error from the fallback surfaces as `Fatal` with zero attempts.
    pub fn call_with_fallback<T, E, F, G>(&self, op: F, fallback: G) -> Result<T, InvokeError<E>>
    where
        E: 'static,
        F: FnMut(&AttemptContext<'_>) -> Result<T, E>,
        G: FnOnce(&FallbackContext) -> Result<T, E>,
    {
        match self.call(op) {
            Err(InvokeError::Rejected(rejection)) => {
                let ctx = FallbackContext {
                    circuit_name: rejection.circuit().to_string(),
                    state: self.breaker.state(),
                    opened_at: match rejection {
                        CircuitError::Open { opened_at, .. } => Some(opened_at),
                        CircuitError::HalfOpenLimitReached { .. } => None,
                    },
                };
                debug!(dependency = %ctx.circuit_name, state = %ctx.state, "serving fallback");
                fallback(&ctx).map_err(|cause| InvokeError::Fatal { attempts: 0, cause })
            }
            other => other,
        }
    }
}

/// Breaker verdict for a finished call
///
/// Caller cancellation says nothing about the dependency's health, so it is
/// the only outcome that leaves the counters alone.
fn report_for<T, E>(result: &Result<T, InvokeError<E>>) -> Report {
    match result {
        Ok(_) => Report::Success,
        Err(InvokeError::Abandoned {
            reason: AbandonReason::Cancelled,
            ..
        }) => Report::Ignored,
        Err(InvokeError::Rejected(_)) => Report::Ignored,
        Err(_) => Report::Failure,
    }
}

/// Builder for [`ResilientInvoker`]
///
/// Breaker settings, storage, clock and callbacks are forwarded to a
/// [`CircuitBuilder`], so both builders validate the same way.
pub struct InvokerBuilder {
    retry: RetryConfig,
    circuit: CircuitBuilder,
    breaker: Option<Arc<CircuitBreaker>>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl InvokerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit: CircuitBuilder::new(name),
            breaker: None,
            classifier: Arc::new(DefaultClassifier),
        }
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.retry.initial_backoff = delay;
        self
    }

    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.retry.max_backoff = delay;
        self
    }

    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.retry.jitter_fraction = fraction;
        self
    }

    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.retry.per_attempt_timeout = timeout;
        self
    }

    pub fn overall_deadline(mut self, deadline: Duration) -> Self {
        self.retry.overall_deadline = deadline;
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.circuit = self.circuit.config(config);
        self
    }

    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.circuit = self.circuit.failure_threshold(threshold);
        self
    }

    pub fn open_duration_secs(mut self, seconds: f64) -> Self {
        self.circuit = self.circuit.open_duration_secs(seconds);
        self
    }

    pub fn half_open_max_probes(mut self, probes: usize) -> Self {
        self.circuit = self.circuit.half_open_max_probes(probes);
        self
    }

    pub fn rolling_window_secs(mut self, seconds: f64) -> Self {
        self.circuit = self.circuit.rolling_window_secs(seconds);
        self
    }

    /// Use an existing breaker, e.g. one owned by a registry
    ///
    /// Breaker settings, storage and callbacks on this builder are then ignored.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.circuit = self.circuit.storage(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.circuit = self.circuit.clock(clock);
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.circuit = self.circuit.on_open(f);
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.circuit = self.circuit.on_close(f);
        self
    }

    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.circuit = self.circuit.on_half_open(f);
        self
    }

    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Observation<'_>) + Send + Sync + 'static,
    {
        self.circuit = self.circuit.on_event(f);
        self
    }

    /// Validate the configuration and build the invoker
    pub fn build(self) -> Result<ResilientInvoker, ConfigError> {
        self.retry.validate()?;

        let breaker = match self.breaker {
            Some(breaker) => breaker,
            None => Arc::new(self.circuit.try_build()?),
        };

        let executor = RetryExecutor::with_classifier(breaker.name(), self.retry, self.classifier);
        Ok(ResilientInvoker::new(breaker, executor))
    }
}
