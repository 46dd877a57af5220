//! Callback system for attempts and breaker state transitions

use crate::circuit::BreakerState;
use crate::retry::Attempt;
use std::sync::Arc;

/// Event delivered to the observability hook
#[derive(Debug, Clone, Copy)]
pub enum Observation<'a> {
    /// An attempt finished, successfully or not
    Attempt {
        dependency: &'a str,
        attempt: &'a Attempt,
    },
    /// The breaker changed state
    Transition {
        dependency: &'a str,
        from: BreakerState,
        to: BreakerState,
    },
}

impl Observation<'_> {
    pub fn dependency(&self) -> &str {
        match self {
            Observation::Attempt { dependency, .. } | Observation::Transition { dependency, .. } => {
                dependency
            }
        }
    }

    /// New breaker state, if this observation is a transition
    pub fn new_state(&self) -> Option<BreakerState> {
        match self {
            Observation::Transition { to, .. } => Some(*to),
            Observation::Attempt { .. } => None,
        }
    }
}

pub type StateCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ObservationCallback = Arc<dyn Fn(&Observation<'_>) + Send + Sync>;

/// Callbacks for breaker and attempt events
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<StateCallback>,
    pub on_close: Option<StateCallback>,
    pub on_half_open: Option<StateCallback>,
    pub on_event: Option<ObservationCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the state callback for `to` and the generic transition event
    pub fn trigger_transition(&self, circuit: &str, from: BreakerState, to: BreakerState) {
        let state_callback = match to {
            BreakerState::Open => &self.on_open,
            BreakerState::Closed => &self.on_close,
            BreakerState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = state_callback {
            callback(circuit);
        }

        if let Some(ref callback) = self.on_event {
            callback(&Observation::Transition {
                dependency: circuit,
                from,
                to,
            });
        }
    }

    pub fn trigger_attempt(&self, circuit: &str, attempt: &Attempt) {
        if let Some(ref callback) = self.on_event {
            callback(&Observation::Attempt {
                dependency: circuit,
                attempt,
            });
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}
