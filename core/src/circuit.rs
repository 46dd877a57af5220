//! Circuit breaker implementation using state machines
//!
//! One breaker guards one downstream dependency. It is shared by every
//! concurrent call to that dependency, so all state reads, counter updates
//! and transitions happen inside a single critical section. Callbacks run
//! after that section is released.

use crate::{
    StorageBackend,
    callbacks::Callbacks,
    errors::{CircuitError, ConfigError},
    retry::AttemptOutcome,
    storage::BreakerCounts,
};
use parking_lot::Mutex;
use state_machines::state_machine;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failed calls that open the circuit
    pub failure_threshold: usize,

    /// Seconds the circuit stays Open before a probe is allowed
    pub open_duration_secs: f64,

    /// Probes admitted in HalfOpen; this many successes close the circuit
    pub half_open_max_probes: usize,

    /// Length of the Closed-state measurement window in seconds (0 = never roll)
    pub rolling_window_secs: f64,

    /// Cooldown jitter (0.0 = none). The open duration is stretched by up to
    /// this fraction, never shortened, using the chrono-machines formula
    /// `timeout * (1 - jitter + rand * jitter)` for the random part.
    pub jitter_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_secs: 30.0,
            half_open_max_probes: 1,
            rolling_window_secs: 60.0,
            jitter_factor: 0.0,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.half_open_max_probes == 0 {
            return Err(ConfigError::ZeroProbes);
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitter(self.jitter_factor));
        }
        if !self.open_duration_secs.is_finite() || self.open_duration_secs < 0.0 {
            return Err(ConfigError::InvalidDuration {
                field: "open_duration_secs",
                value: self.open_duration_secs,
            });
        }
        if self.open_duration_secs == 0.0 {
            return Err(ConfigError::ZeroDuration("open_duration_secs"));
        }
        if !self.rolling_window_secs.is_finite() || self.rolling_window_secs < 0.0 {
            return Err(ConfigError::InvalidDuration {
                field: "rolling_window_secs",
                value: self.rolling_window_secs,
            });
        }
        Ok(())
    }

    /// Map every out-of-range value to the nearest usable one
    ///
    /// Counts become at least 1 and jitter is clamped to `[0, 1]`. An open
    /// duration that is not a positive finite number falls back to the
    /// default, and a bad rolling window disables rollover.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();

        Self {
            failure_threshold: self.failure_threshold.max(1),
            half_open_max_probes: self.half_open_max_probes.max(1),
            jitter_factor: if self.jitter_factor.is_finite() {
                self.jitter_factor.clamp(0.0, 1.0)
            } else {
                0.0
            },
            open_duration_secs: if self.open_duration_secs.is_finite()
                && self.open_duration_secs > 0.0
            {
                self.open_duration_secs
            } else {
                defaults.open_duration_secs
            },
            rolling_window_secs: if self.rolling_window_secs.is_finite() {
                self.rolling_window_secs.max(0.0)
            } else {
                0.0
            },
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "Closed",
            BreakerState::Open => "Open",
            BreakerState::HalfOpen => "HalfOpen",
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "Open" => BreakerState::Open,
            "HalfOpen" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict for an admitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Success,
    Failure,
    /// The call was cancelled by its caller; release the permit without
    /// touching any counter
    Ignored,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    /// Storage key, unique per breaker instance even when names repeat
    pub key: String,
    pub config: BreakerConfig,
    pub storage: Arc<dyn StorageBackend>,
}

impl CircuitContext {
    /// Context with a fresh storage key derived from `name`
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let name = name.into();
        let key = format!("{}#{}", name, NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed));
        Self {
            name,
            key,
            config,
            storage,
        }
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(
            String::new(),
            BreakerConfig::default(),
            Arc::new(crate::MemoryStorage::new()),
        )
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("config", &self.config)
            .field("storage", &"<dyn StorageBackend>")
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
    pub cooldown_secs: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
    pub in_flight: usize,
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Consecutive failures reached the threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let counts = ctx.storage.counts(&ctx.key);
        counts.consecutive_failures >= ctx.config.failure_threshold.max(1)
    }
}

impl Circuit<HalfOpen> {
    /// Any failed probe reopens the circuit
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.storage.counts(&ctx.key).consecutive_failures > 0
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .map(|data| data.consecutive_successes >= ctx.config.half_open_max_probes.max(1))
            .unwrap_or(false)
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .map(|data| ctx.storage.monotonic_time() - data.opened_at >= data.cooldown_secs)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    from: BreakerState,
    to: BreakerState,
}

struct BreakerCore {
    machine: DynamicCircuit,
    /// Bumped on every transition; permits from older generations are stale
    generation: u64,
}

impl BreakerCore {
    fn state(&self) -> BreakerState {
        BreakerState::from_name(self.machine.current_state())
    }
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    core: Mutex<BreakerCore>,
    context: CircuitContext,
    callbacks: Callbacks,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let context = CircuitContext::new(name, config, Arc::new(crate::MemoryStorage::new()));

        Self::with_context_and_callbacks(context, Callbacks::new())
    }

    /// Create a circuit breaker with custom context and callbacks (used by builder)
    pub(crate) fn with_context_and_callbacks(context: CircuitContext, callbacks: Callbacks) -> Self {
        context.storage.clear(&context.key);
        let machine = DynamicCircuit::new(context.clone());

        Self {
            core: Mutex::new(BreakerCore {
                machine,
                generation: 0,
            }),
            context,
            callbacks,
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    /// Ask permission to run one call
    ///
    /// An Open circuit whose cooldown has elapsed moves to HalfOpen here,
    /// lazily, and the caller becomes a probe. The returned [`Permit`] must be
    /// reported once; dropping it unreported counts as [`Report::Ignored`].
    pub fn admit(&self) -> Result<Permit<'_>, CircuitError> {
        let (admission, transition) = {
            let mut core = self.core.lock();
            let mut transition = None;

            self.roll_window_if_closed(&core);

            if core.state() == BreakerState::Open
                && core.machine.handle(CircuitEvent::AttemptReset).is_ok()
            {
                transition = Some(self.begin_generation(&mut core, BreakerState::Open));
            }

            let generation = core.generation;
            let admission = match core.state() {
                BreakerState::Closed => Ok(false),
                BreakerState::Open => Err(CircuitError::Open {
                    circuit: self.context.name.clone(),
                    opened_at: core.machine.open_data().map(|d| d.opened_at).unwrap_or(0.0),
                }),
                BreakerState::HalfOpen => {
                    let max_probes = self.context.config.half_open_max_probes.max(1);
                    match core.machine.half_open_data_mut() {
                        Some(data) if data.in_flight + data.consecutive_successes < max_probes => {
                            data.in_flight += 1;
                            Ok(true)
                        }
                        _ => Err(CircuitError::HalfOpenLimitReached {
                            circuit: self.context.name.clone(),
                        }),
                    }
                }
            };

            (admission.map(|probe| (generation, probe)), transition)
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }

        match admission {
            Ok((generation, probe)) => Ok(Permit {
                breaker: self,
                generation,
                probe,
                settled: false,
            }),
            Err(rejection) => {
                debug!(dependency = %self.context.name, %rejection, "call rejected");
                Err(rejection)
            }
        }
    }

    /// Report the final verdict for an admitted call
    pub fn report(&self, permit: Permit<'_>, report: Report) {
        permit.report(report);
    }

    fn observe(&self, generation: u64, outcome: AttemptOutcome) {
        let core = self.core.lock();
        if core.generation != generation {
            return;
        }
        self.context
            .storage
            .record_attempt(&self.context.key, outcome.is_failure());
    }

    fn settle(&self, generation: u64, probe: bool, report: Report) {
        let transition = {
            let mut core = self.core.lock();
            if core.generation != generation {
                debug!(
                    dependency = %self.context.name,
                    generation,
                    current = core.generation,
                    "stale report ignored"
                );
                return;
            }

            if probe
                && let Some(data) = core.machine.half_open_data_mut()
            {
                data.in_flight = data.in_flight.saturating_sub(1);
            }

            match report {
                Report::Ignored => None,
                Report::Success => self.record_success_and_maybe_close(&mut core),
                Report::Failure => self.record_failure_and_maybe_trip(&mut core),
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    /// Record a successful call and drive HalfOpen -> Closed transitions
    fn record_success_and_maybe_close(&self, core: &mut BreakerCore) -> Option<Transition> {
        self.roll_window_if_closed(core);
        self.context.storage.record_success(&self.context.key);

        if core.state() != BreakerState::HalfOpen {
            return None;
        }

        if let Some(data) = core.machine.half_open_data_mut() {
            data.consecutive_successes += 1;
        }

        if core.machine.handle(CircuitEvent::Close).is_ok() {
            Some(self.begin_generation(core, BreakerState::HalfOpen))
        } else {
            None
        }
    }

    /// Record a failed call and attempt to trip the circuit
    fn record_failure_and_maybe_trip(&self, core: &mut BreakerCore) -> Option<Transition> {
        self.roll_window_if_closed(core);
        self.context.storage.record_failure(&self.context.key);

        let from = core.state();
        if core.machine.handle(CircuitEvent::Trip).is_ok() {
            return Some(self.begin_generation(core, from));
        }

        if from == BreakerState::HalfOpen
            && let Some(data) = core.machine.half_open_data_mut()
        {
            data.consecutive_successes = 0;
        }
        None
    }

    fn roll_window_if_closed(&self, core: &BreakerCore) {
        if core.state() == BreakerState::Closed
            && self
                .context
                .storage
                .roll_window(&self.context.key, self.context.config.rolling_window_secs)
        {
            debug!(dependency = %self.context.name, "measurement window rolled over");
        }
    }

    /// Apply bookkeeping for the state the machine just entered
    fn begin_generation(&self, core: &mut BreakerCore, from: BreakerState) -> Transition {
        core.generation += 1;
        self.context.storage.clear(&self.context.key);

        let to = core.state();
        if to == BreakerState::Open {
            let opened_at = self.context.storage.monotonic_time();
            let cooldown_secs = self.cooldown_secs();
            if let Some(data) = core.machine.open_data_mut() {
                data.opened_at = opened_at;
                data.cooldown_secs = cooldown_secs;
            }
        }

        Transition { from, to }
    }

    /// Open duration, stretched by the configured jitter
    fn cooldown_secs(&self) -> f64 {
        let config = &self.context.config;
        if config.jitter_factor <= 0.0 {
            return config.open_duration_secs;
        }

        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: (config.open_duration_secs * 1000.0) as u64,
            multiplier: 1.0,
            max_delay_ms: (config.open_duration_secs * 1000.0) as u64,
        };
        let jittered_ms = policy.calculate_delay(1, config.jitter_factor.min(1.0));
        let shortfall = (config.open_duration_secs - (jittered_ms as f64) / 1000.0).max(0.0);

        config.open_duration_secs + shortfall
    }

    fn announce(&self, transition: Transition) {
        let Transition { from, to } = transition;
        let name = &self.context.name;

        match to {
            BreakerState::Open => warn!(dependency = %name, %from, "circuit opened"),
            BreakerState::HalfOpen => info!(dependency = %name, %from, "circuit half-open, probing"),
            BreakerState::Closed => info!(dependency = %name, %from, "circuit closed"),
        }

        self.callbacks.trigger_transition(name, from, to);
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.context.config
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Current state, without evaluating a pending Open -> HalfOpen move
    pub fn state(&self) -> BreakerState {
        self.core.lock().state()
    }

    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BreakerState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == BreakerState::HalfOpen
    }

    /// Counters of the current generation
    pub fn counts(&self) -> BreakerCounts {
        let _core = self.core.lock();
        self.context.storage.counts(&self.context.key)
    }

    pub fn generation(&self) -> u64 {
        self.core.lock().generation
    }

    /// Monotonic timestamp of the last trip, while Open
    pub fn opened_at(&self) -> Option<f64> {
        self.core.lock().machine.open_data().map(|d| d.opened_at)
    }

    /// Clear all counters and force the circuit back to Closed
    ///
    /// Outstanding permits become stale and their reports are ignored.
    pub fn reset(&self) {
        let transition = {
            let mut core = self.core.lock();
            let from = core.state();
            core.machine = DynamicCircuit::new(self.context.clone());
            let transition = self.begin_generation(&mut core, from);
            (from != BreakerState::Closed).then_some(transition)
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        self.context.storage.remove(&self.context.key);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &core.state())
            .field("generation", &core.generation)
            .field("config", &self.context.config)
            .finish()
    }
}

/// Admission ticket for one call
///
/// Carries the generation it was issued in, so a report never acts on a
/// state that began after the admission.
#[must_use = "an unreported permit is released as ignored when dropped"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this permit is a HalfOpen trial probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record one attempt's outcome as it happens
    pub fn observe(&self, outcome: AttemptOutcome) {
        self.breaker.observe(self.generation, outcome);
    }

    /// Report the call's final verdict, consuming the permit
    pub fn report(mut self, report: Report) {
        self.settled = true;
        self.breaker.settle(self.generation, self.probe, report);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            self.breaker
                .settle(self.generation, self.probe, Report::Ignored);
        }
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("circuit", &self.breaker.name())
            .field("generation", &self.generation)
            .field("probe", &self.probe)
            .finish()
    }
}
