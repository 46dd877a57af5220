//! rpc-resilience - Retry and circuit breaking for remote calls
//!
//! This crate wraps calls to unreliable downstream dependencies with:
//! - Error classification into retryable and fatal failures
//! - Exponential backoff with bounded jitter under a per-call deadline
//! - Cooperative cancellation of backoff waits
//! - A per-dependency circuit breaker (Closed → Open → HalfOpen) built on a state machine
//! - Monotonic time tracking to prevent NTP clock skew issues
//!
//! # Example
//!
//! ```rust
//! use rpc_resilience::{ResilientInvoker, Status};
//! use std::time::Duration;
//!
//! let invoker = ResilientInvoker::builder("greeter")
//!     .max_attempts(3)
//!     .initial_backoff(Duration::from_millis(10))
//!     .failure_threshold(2)
//!     .open_duration_secs(5.0)
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .expect("valid configuration");
//!
//! // Execute with retries and circuit protection
//! let reply = invoker.call(|ctx| {
//!     // Your transport call here, bounded by ctx.timeout()
//!     let _budget = ctx.timeout();
//!     Ok::<_, Status>(format!("Hello from attempt {}", ctx.attempt()))
//! });
//! assert!(reply.is_ok());
//!
//! // Check circuit state
//! if invoker.breaker().is_open() {
//!     println!("Circuit is open, skipping call");
//! }
//! ```

pub mod backoff;
pub mod builder;
pub mod callbacks;
pub mod cancel;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod errors;
pub mod invoker;
pub mod registry;
pub mod retry;
pub mod status;
pub mod storage;

pub use backoff::BackoffPolicy;
pub use builder::CircuitBuilder;
pub use callbacks::{Callbacks, Observation};
pub use cancel::CancellationToken;
pub use circuit::{BreakerConfig, BreakerState, CircuitBreaker, Permit, Report};
pub use classifier::{
    Classification, DefaultClassifier, ErrorClassifier, FailureContext, PredicateClassifier,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use errors::{AbandonReason, CircuitError, ConfigError, InvokeError};
pub use invoker::{FallbackContext, InvokerBuilder, ResilientInvoker};
pub use registry::BreakerRegistry;
pub use retry::{Attempt, AttemptContext, AttemptOutcome, RetryConfig, RetryExecutor};
pub use status::{Status, StatusCode};
pub use storage::{BreakerCounts, MemoryStorage, StorageBackend};
