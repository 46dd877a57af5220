//! Error types for resilient invocation

use std::fmt;

/// Rejections produced by the circuit breaker before any call is attempted
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitError {
    /// Circuit is open, calls are being rejected
    #[error("Circuit '{circuit}' is open (opened at {opened_at})")]
    Open { circuit: String, opened_at: f64 },
    /// Every half-open probe slot is taken
    #[error("Circuit '{circuit}' half-open request limit reached")]
    HalfOpenLimitReached { circuit: String },
}

impl CircuitError {
    pub fn circuit(&self) -> &str {
        match self {
            CircuitError::Open { circuit, .. } | CircuitError::HalfOpenLimitReached { circuit } => {
                circuit
            }
        }
    }
}

/// Why a call was cut short before it could finish retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The caller's cancellation token fired
    Cancelled,
    /// The overall deadline elapsed during an attempt or a backoff wait
    DeadlineElapsed,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::Cancelled => f.write_str("cancelled"),
            AbandonReason::DeadlineElapsed => f.write_str("deadline elapsed"),
        }
    }
}

/// Terminal failure of a resilient call
///
/// Every variant is distinguishable so operators can tell a refused call
/// (`Rejected`) from one whose downstream kept failing (`Exhausted`) or one
/// the caller stopped waiting for (`Abandoned`).
#[derive(Debug, thiserror::Error)]
pub enum InvokeError<E> {
    /// The breaker refused the call; the operation never ran
    #[error(transparent)]
    Rejected(#[from] CircuitError),
    /// A non-retryable failure
    #[error("fatal failure after {attempts} attempt(s): {cause}")]
    Fatal { attempts: u32, cause: E },
    /// Every attempt failed with a retryable cause and attempts or time ran out
    #[error("retries exhausted after {attempts} attempt(s): {cause}")]
    Exhausted { attempts: u32, cause: E },
    /// A wait or attempt was cut short
    #[error("call abandoned after {attempts} attempt(s): {reason}")]
    Abandoned {
        attempts: u32,
        reason: AbandonReason,
        cause: Option<E>,
    },
}

impl<E> InvokeError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, InvokeError::Rejected(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, InvokeError::Fatal { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, InvokeError::Exhausted { .. })
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, InvokeError::Abandoned { .. })
    }

    /// Number of times the wrapped operation actually ran
    pub fn attempts(&self) -> u32 {
        match self {
            InvokeError::Rejected(_) => 0,
            InvokeError::Fatal { attempts, .. }
            | InvokeError::Exhausted { attempts, .. }
            | InvokeError::Abandoned { attempts, .. } => *attempts,
        }
    }

    /// Last failure reported by the wrapped operation, if any
    pub fn cause(&self) -> Option<&E> {
        match self {
            InvokeError::Rejected(_) => None,
            InvokeError::Fatal { cause, .. } | InvokeError::Exhausted { cause, .. } => Some(cause),
            InvokeError::Abandoned { cause, .. } => cause.as_ref(),
        }
    }

    pub fn into_cause(self) -> Option<E> {
        match self {
            InvokeError::Rejected(_) => None,
            InvokeError::Fatal { cause, .. } | InvokeError::Exhausted { cause, .. } => Some(cause),
            InvokeError::Abandoned { cause, .. } => cause,
        }
    }
}

/// Invalid programmatic configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,
    #[error("jitter fraction must be within [0, 1] (got {0})")]
    InvalidJitter(f64),
    #[error("initial backoff {initial:?} exceeds max backoff {max:?}")]
    BackoffOrder {
        initial: std::time::Duration,
        max: std::time::Duration,
    },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },
    #[error("failure_threshold must be at least 1")]
    ZeroFailureThreshold,
    #[error("half_open_max_probes must be at least 1")]
    ZeroProbes,
}
