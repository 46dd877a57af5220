//! Storage backends for breaker counters
//!
//! Counters are keyed per breaker instance (see [`crate::circuit::CircuitContext::key`])
//! so one backend can be shared by every breaker in a registry, and a breaker
//! that replaced another under the same name never sees its counters. The breaker serializes its own reads and writes;
//! the backend only has to keep each individual operation consistent.

use crate::clock::{Clock, MonotonicClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Counters for the current measurement window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    /// Successful calls since the last failure
    pub consecutive_successes: usize,
    /// Failed calls since the last success
    pub consecutive_failures: usize,
    /// Calls reported in this window
    pub total_requests: usize,
    /// Failed calls reported in this window
    pub total_failures: usize,
    /// Individual attempts observed in this window, retries included
    pub total_attempts: usize,
    /// Individual attempts that failed
    pub attempt_failures: usize,
}

impl BreakerCounts {
    fn on_success(&mut self) {
        self.total_requests += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_requests += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn on_attempt(&mut self, failed: bool) {
        self.total_attempts += 1;
        if failed {
            self.attempt_failures += 1;
        }
    }
}

/// Abstract storage backend for breaker counters
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Record a successful call
    fn record_success(&self, key: &str);

    /// Record a failed call
    fn record_failure(&self, key: &str);

    /// Record a single attempt without touching the consecutive counters
    fn record_attempt(&self, key: &str, failed: bool);

    /// Snapshot of the current window
    fn counts(&self, key: &str) -> BreakerCounts;

    /// Start a new window if the current one is older than `window_secs`
    ///
    /// Returns `true` when the counters were reset. A non-positive window never rolls.
    fn roll_window(&self, key: &str, window_secs: f64) -> bool;

    /// Reset counters for a circuit
    fn clear(&self, key: &str);

    /// Reset counters for all circuits
    fn clear_all(&self);

    /// Drop the counters for a breaker that no longer exists
    fn remove(&self, key: &str);

    /// Get monotonic time in seconds
    fn monotonic_time(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    counts: BreakerCounts,
    started_at: f64,
}

/// Thread-safe in-memory storage
#[derive(Debug)]
pub struct MemoryStorage {
    windows: RwLock<HashMap<String, Window>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Create storage driven by a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn update(&self, key: &str, f: impl FnOnce(&mut BreakerCounts)) {
        let now = self.monotonic_time();
        let mut windows = self.windows.write();
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| Window {
                counts: BreakerCounts::default(),
                started_at: now,
            });
        f(&mut window.counts);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn record_success(&self, key: &str) {
        self.update(key, BreakerCounts::on_success);
    }

    fn record_failure(&self, key: &str) {
        self.update(key, BreakerCounts::on_failure);
    }

    fn record_attempt(&self, key: &str, failed: bool) {
        self.update(key, |counts| counts.on_attempt(failed));
    }

    fn counts(&self, key: &str) -> BreakerCounts {
        self.windows
            .read()
            .get(key)
            .map(|w| w.counts)
            .unwrap_or_default()
    }

    fn roll_window(&self, key: &str, window_secs: f64) -> bool {
        if window_secs <= 0.0 {
            return false;
        }

        let now = self.monotonic_time();
        let mut windows = self.windows.write();
        match windows.get_mut(key) {
            Some(window) if now - window.started_at >= window_secs => {
                window.counts = BreakerCounts::default();
                window.started_at = now;
                true
            }
            Some(_) => false,
            None => {
                windows.insert(
                    key.to_string(),
                    Window {
                        counts: BreakerCounts::default(),
                        started_at: now,
                    },
                );
                false
            }
        }
    }

    fn clear(&self, key: &str) {
        let now = self.monotonic_time();
        let mut windows = self.windows.write();
        windows.insert(
            key.to_string(),
            Window {
                counts: BreakerCounts::default(),
                started_at: now,
            },
        );
    }

    fn clear_all(&self) {
        self.windows.write().clear();
    }

    fn remove(&self, key: &str) {
        self.windows.write().remove(key);
    }

    fn monotonic_time(&self) -> f64 {
        self.clock.now_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_memory_storage_record_and_count() {
        let storage = MemoryStorage::new();

        storage.record_success("test_circuit");
        storage.record_success("test_circuit");
        storage.record_failure("test_circuit");

        let counts = storage.counts("test_circuit");
        assert_eq!(counts.total_requests, 3);
        assert_eq!(counts.total_failures, 1);
        assert_eq!(counts.consecutive_failures, 1);
        assert_eq!(counts.consecutive_successes, 0);
    }

    #[test]
    fn test_consecutive_counters_are_exclusive() {
        let storage = MemoryStorage::new();

        storage.record_failure("test_circuit");
        storage.record_failure("test_circuit");
        assert_eq!(storage.counts("test_circuit").consecutive_failures, 2);

        storage.record_success("test_circuit");
        let counts = storage.counts("test_circuit");
        assert_eq!(counts.consecutive_successes, 1);
        assert_eq!(counts.consecutive_failures, 0);

        storage.record_failure("test_circuit");
        let counts = storage.counts("test_circuit");
        assert_eq!(counts.consecutive_successes, 0);
        assert_eq!(counts.consecutive_failures, 1);
    }

    #[test]
    fn test_attempts_do_not_touch_consecutive_counters() {
        let storage = MemoryStorage::new();

        storage.record_attempt("test_circuit", true);
        storage.record_attempt("test_circuit", true);
        storage.record_attempt("test_circuit", false);

        let counts = storage.counts("test_circuit");
        assert_eq!(counts.total_attempts, 3);
        assert_eq!(counts.attempt_failures, 2);
        assert_eq!(counts.consecutive_failures, 0);
        assert_eq!(counts.total_requests, 0);
    }

    #[test]
    fn test_memory_storage_clear() {
        let storage = MemoryStorage::new();

        storage.record_success("test_circuit");
        storage.record_success("other_circuit");
        storage.clear("test_circuit");

        assert_eq!(storage.counts("test_circuit"), BreakerCounts::default());
        assert_eq!(storage.counts("other_circuit").total_requests, 1);

        storage.clear_all();
        assert_eq!(storage.counts("other_circuit"), BreakerCounts::default());
    }

    #[test]
    fn test_memory_storage_remove() {
        let storage = MemoryStorage::new();

        storage.record_failure("greeter#1");
        storage.record_failure("greeter#2");
        storage.remove("greeter#1");

        assert_eq!(storage.counts("greeter#1"), BreakerCounts::default());
        assert_eq!(storage.counts("greeter#2").total_failures, 1);
        assert_eq!(storage.windows.read().len(), 1);
    }

    #[test]
    fn test_window_rollover() {
        let clock = Arc::new(ManualClock::new());
        let storage = MemoryStorage::with_clock(clock.clone());

        storage.record_failure("test_circuit");
        assert!(!storage.roll_window("test_circuit", 10.0));

        clock.advance(Duration::from_secs(9));
        assert!(!storage.roll_window("test_circuit", 10.0));
        assert_eq!(storage.counts("test_circuit").total_failures, 1);

        clock.advance(Duration::from_secs(1));
        assert!(storage.roll_window("test_circuit", 10.0));
        assert_eq!(storage.counts("test_circuit"), BreakerCounts::default());

        // The next window starts at the rollover point
        clock.advance(Duration::from_secs(5));
        assert!(!storage.roll_window("test_circuit", 10.0));
    }

    #[test]
    fn test_zero_window_never_rolls() {
        let clock = Arc::new(ManualClock::new());
        let storage = MemoryStorage::with_clock(clock.clone());

        storage.record_failure("test_circuit");
        clock.advance(Duration::from_secs(3600));

        assert!(!storage.roll_window("test_circuit", 0.0));
        assert_eq!(storage.counts("test_circuit").total_failures, 1);
    }

    #[test]
    fn test_memory_storage_monotonic_time() {
        let storage = MemoryStorage::new();

        let time1 = storage.monotonic_time();
        std::thread::sleep(Duration::from_millis(10));
        let time2 = storage.monotonic_time();

        assert!(time2 > time1);
    }

    #[test]
    fn test_concurrent_failures_are_all_recorded() {
        let storage = Arc::new(MemoryStorage::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let storage = Arc::clone(&storage);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    storage.record_failure("test_circuit");
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let counts = storage.counts("test_circuit");
        assert_eq!(counts.total_failures, 800);
        assert_eq!(counts.consecutive_failures, 800);
    }
}
