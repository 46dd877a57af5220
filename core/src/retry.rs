//! Retry executor driving repeated attempts under a deadline
//!
//! The executor owns no shared state: every [`RetryExecutor::run`] is
//! independent. Suspension happens in exactly two places, the operation
//! itself and the backoff wait, and the wait always races against both the
//! overall deadline and the caller's [`CancellationToken`].

use crate::{
    backoff::BackoffPolicy,
    cancel::CancellationToken,
    classifier::{Classification, DefaultClassifier, ErrorClassifier, FailureContext},
    errors::{AbandonReason, ConfigError, InvokeError},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Retry configuration, immutable once handed to an executor
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total invocations allowed, first attempt included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Symmetric jitter applied to each delay, within `[0, 1]`
    pub jitter_fraction: f64,
    /// Budget for a single attempt
    pub per_attempt_timeout: Duration,
    /// Budget for the whole call, retries and waits included
    pub overall_deadline: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter_fraction: 0.2,
            per_attempt_timeout: Duration::from_secs(3),
            overall_deadline: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::InvalidJitter(self.jitter_fraction));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::BackoffOrder {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("per_attempt_timeout"));
        }
        if self.overall_deadline.is_zero() {
            return Err(ConfigError::ZeroDuration("overall_deadline"));
        }
        Ok(())
    }
}

/// What a single attempt produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Retryable,
    Fatal,
}

impl AttemptOutcome {
    pub fn is_failure(self) -> bool {
        self != AttemptOutcome::Success
    }
}

/// Record of one finished attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based sequence number
    pub number: u32,
    pub started_at: Instant,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
    /// Backoff scheduled after this attempt, if another one will be made
    pub next_delay: Option<Duration>,
}

/// Budget handed to the operation for one attempt
///
/// A synchronous call cannot be interrupted from outside, so the transport is
/// expected to apply [`AttemptContext::timeout`] itself (as a socket or RPC
/// deadline) and to check [`AttemptContext::is_cancelled`] where it can.
#[derive(Debug)]
pub struct AttemptContext<'a> {
    attempt: u32,
    timeout: Duration,
    deadline: Instant,
    cancel: &'a CancellationToken,
}

impl AttemptContext<'_> {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `min(per_attempt_timeout, time left before the overall deadline)`
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Instant at which this attempt's budget runs out
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Drives repeated invocation attempts under a policy and a deadline
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: String,
    config: RetryConfig,
    backoff: BackoffPolicy,
    classifier: Arc<dyn ErrorClassifier>,
}

impl RetryExecutor {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self::with_classifier(name, config, Arc::new(DefaultClassifier))
    }

    pub fn with_classifier(
        name: impl Into<String>,
        config: RetryConfig,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        let backoff = BackoffPolicy::from_config(&config);
        Self {
            name: name.into(),
            config,
            backoff,
            classifier,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run `op` until it succeeds, fails fatally, or attempts or time run out
    ///
    /// `observe` sees every attempt as soon as it finishes, before any backoff
    /// wait, so bookkeeping stays current even if the caller later abandons
    /// the call.
    pub fn run<T, E, F, O>(
        &self,
        mut op: F,
        deadline: Instant,
        cancel: &CancellationToken,
        mut observe: O,
    ) -> Result<T, InvokeError<E>>
    where
        E: 'static,
        F: FnMut(&AttemptContext<'_>) -> Result<T, E>,
        O: FnMut(&Attempt),
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 1;
        let mut last_error: Option<E> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(InvokeError::Abandoned {
                    attempts: attempt - 1,
                    reason: AbandonReason::Cancelled,
                    cause: last_error,
                });
            }

            let started_at = Instant::now();
            let remaining = deadline.saturating_duration_since(started_at);
            if remaining.is_zero() {
                // Either the deadline was gone before the first attempt, or a
                // backoff wait ended right at it
                return Err(InvokeError::Abandoned {
                    attempts: attempt - 1,
                    reason: AbandonReason::DeadlineElapsed,
                    cause: last_error,
                });
            }

            let timeout = self.config.per_attempt_timeout.min(remaining);
            let ctx = AttemptContext {
                attempt,
                timeout,
                deadline: started_at + timeout,
                cancel,
            };

            let result = op(&ctx);
            let duration = started_at.elapsed();

            let error = match result {
                Ok(value) => {
                    debug!(dependency = %self.name, attempt, ?duration, "attempt succeeded");
                    observe(&Attempt {
                        number: attempt,
                        started_at,
                        duration,
                        outcome: AttemptOutcome::Success,
                        next_delay: None,
                    });
                    return Ok(value);
                }
                Err(error) => error,
            };

            let classification = self.classifier.classify(&FailureContext {
                circuit_name: &self.name,
                error: &error as &dyn std::any::Any,
                attempt,
                duration,
            });

            if classification == Classification::Fatal {
                debug!(dependency = %self.name, attempt, ?duration, "attempt failed fatally");
                observe(&Attempt {
                    number: attempt,
                    started_at,
                    duration,
                    outcome: AttemptOutcome::Fatal,
                    next_delay: None,
                });
                return Err(InvokeError::Fatal {
                    attempts: attempt,
                    cause: error,
                });
            }

            let now = Instant::now();
            let time_left = deadline.saturating_duration_since(now);
            let exhausted = attempt >= max_attempts || time_left.is_zero();
            let delay = if exhausted || cancel.is_cancelled() {
                None
            } else {
                Some(self.backoff.next_delay(attempt))
            };

            debug!(dependency = %self.name, attempt, ?duration, "attempt failed, retryable");
            observe(&Attempt {
                number: attempt,
                started_at,
                duration,
                outcome: AttemptOutcome::Retryable,
                next_delay: delay,
            });

            if exhausted {
                warn!(
                    dependency = %self.name,
                    attempts = attempt,
                    "retries exhausted"
                );
                return Err(InvokeError::Exhausted {
                    attempts: attempt,
                    cause: error,
                });
            }

            let Some(delay) = delay else {
                return Err(InvokeError::Abandoned {
                    attempts: attempt,
                    reason: AbandonReason::Cancelled,
                    cause: Some(error),
                });
            };

            // Never sleep past the deadline: wait only until it, then give up
            let deadline_bound = delay >= time_left;
            let wait = delay.min(time_left);
            warn!(
                dependency = %self.name,
                attempt,
                ?delay,
                "retrying after backoff"
            );

            if cancel.wait_timeout(wait) {
                return Err(InvokeError::Abandoned {
                    attempts: attempt,
                    reason: AbandonReason::Cancelled,
                    cause: Some(error),
                });
            }
            if deadline_bound {
                debug!(dependency = %self.name, attempt, "deadline elapsed during backoff");
                return Err(InvokeError::Abandoned {
                    attempts: attempt,
                    reason: AbandonReason::DeadlineElapsed,
                    cause: Some(error),
                });
            }

            last_error = Some(error);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::PredicateClassifier;
    use crate::status::Status;
    use std::cell::Cell;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter_fraction: 0.0,
            per_attempt_timeout: Duration::from_secs(1),
            overall_deadline: Duration::from_secs(5),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_success_on_first_attempt() {
        let executor = RetryExecutor::new("test", config(3));
        let calls = Cell::new(0);
        let mut attempts = Vec::new();

        let result = executor.run(
            |_ctx| {
                calls.set(calls.get() + 1);
                Ok::<_, Status>("hello")
            },
            far_deadline(),
            &CancellationToken::new(),
            |a| attempts.push(a.outcome),
        );

        assert_eq!(result.unwrap(), "hello");
        assert_eq!(calls.get(), 1);
        assert_eq!(attempts, vec![AttemptOutcome::Success]);
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new("test", config(3));
        let calls = Cell::new(0);

        let result = executor.run(
            |ctx| {
                calls.set(calls.get() + 1);
                if ctx.attempt() < 3 {
                    Err(Status::unavailable("down"))
                } else {
                    Ok(ctx.attempt())
                }
            },
            far_deadline(),
            &CancellationToken::new(),
            |_| {},
        );

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let executor = RetryExecutor::new("test", config(3));
        let calls = Cell::new(0);
        let mut waits = 0;

        let result = executor.run(
            |_ctx| {
                calls.set(calls.get() + 1);
                Err::<(), _>(Status::unavailable("connection refused"))
            },
            far_deadline(),
            &CancellationToken::new(),
            |a| {
                if a.next_delay.is_some() {
                    waits += 1;
                }
            },
        );

        match result {
            Err(InvokeError::Exhausted { attempts, cause }) => {
                assert_eq!(attempts, 3);
                assert_eq!(cause.message, "connection refused");
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(calls.get(), 3);
        assert_eq!(waits, 2);
    }

    #[test]
    fn test_fatal_is_not_retried() {
        let executor = RetryExecutor::new("test", config(5));
        let calls = Cell::new(0);

        let result = executor.run(
            |_ctx| {
                calls.set(calls.get() + 1);
                Err::<(), _>(Status::invalid_argument("Name cannot be empty"))
            },
            far_deadline(),
            &CancellationToken::new(),
            |_| {},
        );

        assert!(matches!(result, Err(InvokeError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_custom_classifier_is_used() {
        let classifier = Arc::new(PredicateClassifier::new(|_ctx| Classification::Retryable));
        let executor = RetryExecutor::with_classifier("test", config(2), classifier);
        let calls = Cell::new(0);

        let result = executor.run(
            |_ctx| {
                calls.set(calls.get() + 1);
                Err::<(), _>("plain error")
            },
            far_deadline(),
            &CancellationToken::new(),
            |_| {},
        );

        assert!(result.unwrap_err().is_exhausted());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_deadline_interrupts_backoff() {
        // First attempt takes 150ms, backoff is 300ms, deadline is 200ms
        let retry = RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            jitter_fraction: 0.0,
            per_attempt_timeout: Duration::from_secs(1),
            overall_deadline: Duration::from_millis(200),
        };
        let executor = RetryExecutor::new("test", retry);
        let calls = Cell::new(0);
        let start = Instant::now();

        let result = executor.run(
            |_ctx| {
                calls.set(calls.get() + 1);
                std::thread::sleep(Duration::from_millis(150));
                Err::<(), _>(Status::unavailable("slow"))
            },
            start + Duration::from_millis(200),
            &CancellationToken::new(),
            |_| {},
        );
        let elapsed = start.elapsed();

        match result {
            Err(InvokeError::Abandoned {
                attempts,
                reason,
                cause,
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(reason, AbandonReason::DeadlineElapsed);
                assert!(cause.is_some());
            }
            other => panic!("Expected Abandoned, got {:?}", other),
        }
        assert_eq!(calls.get(), 1, "Second attempt must never be issued");
        assert!(elapsed >= Duration::from_millis(195));
        assert!(elapsed < Duration::from_millis(400), "Waited out the full delay");
    }

    #[test]
    fn test_attempt_timeout_bounded_by_deadline() {
        let executor = RetryExecutor::new("test", config(1));
        let seen = Cell::new(Duration::ZERO);

        let _ = executor.run(
            |ctx| {
                seen.set(ctx.timeout());
                Ok::<_, Status>(())
            },
            Instant::now() + Duration::from_millis(100),
            &CancellationToken::new(),
            |_| {},
        );

        assert!(seen.get() <= Duration::from_millis(100));
        assert!(seen.get() > Duration::ZERO);
    }

    #[test]
    fn test_per_attempt_timeout_applies_with_distant_deadline() {
        let executor = RetryExecutor::new("test", config(1));
        let seen = Cell::new(Duration::ZERO);

        let _ = executor.run(
            |ctx| {
                seen.set(ctx.timeout());
                Ok::<_, Status>(())
            },
            Instant::now() + Duration::from_secs(60),
            &CancellationToken::new(),
            |_| {},
        );

        assert_eq!(seen.get(), Duration::from_secs(1));
    }

    #[test]
    fn test_expired_deadline_makes_no_attempt() {
        let executor = RetryExecutor::new("test", config(3));
        let calls = Cell::new(0);

        let result = executor.run(
            |_ctx| {
                calls.set(calls.get() + 1);
                Ok::<_, Status>(())
            },
            Instant::now(),
            &CancellationToken::new(),
            |_| {},
        );

        assert!(matches!(
            result,
            Err(InvokeError::Abandoned {
                attempts: 0,
                reason: AbandonReason::DeadlineElapsed,
                ..
            })
        ));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_deadline_passed_during_attempt_is_exhaustion() {
        let executor = RetryExecutor::new("test", config(5));
        let start = Instant::now();

        let result = executor.run(
            |_ctx| {
                std::thread::sleep(Duration::from_millis(60));
                Err::<(), _>(Status::deadline_exceeded("too slow"))
            },
            start + Duration::from_millis(50),
            &CancellationToken::new(),
            |_| {},
        );

        assert!(matches!(result, Err(InvokeError::Exhausted { attempts: 1, .. })));
    }

    #[test]
    fn test_cancellation_during_backoff() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            overall_deadline: Duration::from_secs(30),
            ..config(3)
        };
        let executor = RetryExecutor::new("test", retry);
        let token = CancellationToken::new();
        let canceller = token.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        let start = Instant::now();
        let result = executor.run(
            |_ctx| Err::<(), _>(Status::unavailable("down")),
            start + Duration::from_secs(30),
            &token,
            |_| {},
        );
        handle.join().unwrap();

        assert!(matches!(
            result,
            Err(InvokeError::Abandoned {
                attempts: 1,
                reason: AbandonReason::Cancelled,
                cause: Some(_),
            })
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancelled_before_start() {
        let executor = RetryExecutor::new("test", config(3));
        let token = CancellationToken::new();
        token.cancel();

        let result = executor.run(
            |_ctx| Ok::<_, Status>(()),
            far_deadline(),
            &token,
            |_| {},
        );

        assert!(matches!(
            result,
            Err(InvokeError::Abandoned {
                attempts: 0,
                reason: AbandonReason::Cancelled,
                cause: None,
            })
        ));
    }

    #[test]
    fn test_observer_sees_every_attempt_in_order() {
        let executor = RetryExecutor::new("test", config(3));
        let mut numbers = Vec::new();

        let _ = executor.run(
            |ctx| {
                if ctx.attempt() == 3 {
                    Ok(())
                } else {
                    Err(Status::internal("boom"))
                }
            },
            far_deadline(),
            &CancellationToken::new(),
            |a| numbers.push((a.number, a.outcome)),
        );

        assert_eq!(
            numbers,
            vec![
                (1, AttemptOutcome::Retryable),
                (2, AttemptOutcome::Retryable),
                (3, AttemptOutcome::Success),
            ]
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());

        let zero = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroMaxAttempts));

        let jitter = RetryConfig {
            jitter_fraction: 1.5,
            ..RetryConfig::default()
        };
        assert_eq!(jitter.validate(), Err(ConfigError::InvalidJitter(1.5)));

        let order = RetryConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        assert!(matches!(order.validate(), Err(ConfigError::BackoffOrder { .. })));

        let deadline = RetryConfig {
            overall_deadline: Duration::ZERO,
            ..RetryConfig::default()
        };
        assert_eq!(
            deadline.validate(),
            Err(ConfigError::ZeroDuration("overall_deadline"))
        );
    }
}
