//! Failure classification for retry decisions
//!
//! A classifier decides whether a failed attempt is worth retrying. Every
//! failure still counts against the circuit breaker; classification only
//! decides whether the executor tries again.

use crate::status::{Status, StatusCode};
use std::any::Any;
use std::io;
use std::time::Duration;

/// Retry verdict for a single failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
}

impl Classification {
    pub fn is_retryable(self) -> bool {
        self == Classification::Retryable
    }
}

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Dependency key of the breaker guarding the call
    pub circuit_name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// 1-based attempt number that produced the error
    pub attempt: u32,
    /// How long the failed attempt ran
    pub duration: Duration,
}

/// Trait for classifying failures into retryable and fatal
///
/// # Examples
///
/// ```rust
/// use rpc_resilience::{Classification, ErrorClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct NeverRetry;
///
/// impl ErrorClassifier for NeverRetry {
///     fn classify(&self, _ctx: &FailureContext<'_>) -> Classification {
///         Classification::Fatal
///     }
/// }
/// ```
pub trait ErrorClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification;
}

/// Default classifier
///
/// Recognizes [`Status`], bare [`StatusCode`] and [`std::io::Error`].
/// Transient status codes and connection-level I/O errors are retryable.
/// Anything unrecognized is fatal, breaker rejections
/// ([`crate::CircuitError`]) included.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    fn classify_io(err: &io::Error) -> Classification {
        match err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => Classification::Retryable,
            _ => Classification::Fatal,
        }
    }

    fn classify_code(code: StatusCode) -> Classification {
        if code.is_transient() {
            Classification::Retryable
        } else {
            Classification::Fatal
        }
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        let error = ctx.error;

        if let Some(status) = error.downcast_ref::<Status>() {
            return Self::classify_code(status.code);
        }
        if let Some(code) = error.downcast_ref::<StatusCode>() {
            return Self::classify_code(*code);
        }
        if let Some(io_err) = error.downcast_ref::<io::Error>() {
            return Self::classify_io(io_err);
        }

        // Breaker rejections (`CircuitError`) land here too: retrying against
        // an open breaker is pointless
        Classification::Fatal
    }
}

/// Predicate-based classifier using a closure
///
/// Allows callers to override the defaults, optionally delegating back to
/// [`DefaultClassifier`] for errors they do not care about.
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> Classification + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> Classification + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> ErrorClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> Classification + Send + Sync,
{
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> Classification + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
