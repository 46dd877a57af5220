//! Resilient calls against a simulated flaky greeter service

use rpc_resilience::{AttemptContext, InvokeError, Observation, ResilientInvoker, Status};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Fails with a transient status on every call in `outage`, succeeds otherwise
struct FlakyGreeter {
    calls: AtomicU32,
    outage: std::ops::Range<u32>,
}

impl FlakyGreeter {
    fn say_hello(&self, ctx: &AttemptContext<'_>, name: &str) -> Result<String, Status> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5).min(ctx.timeout()));

        if self.outage.contains(&call) {
            Err(Status::unavailable("greeter is restarting"))
        } else {
            Ok(format!("Hello {}", name))
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rpc_resilience=debug")),
        )
        .init();

    println!("=== Resilient Greeter Example ===\n");

    let greeter = FlakyGreeter {
        calls: AtomicU32::new(0),
        outage: 2..12,
    };

    let invoker = ResilientInvoker::builder("greeter")
        .max_attempts(3)
        .initial_backoff(Duration::from_millis(20))
        .max_backoff(Duration::from_millis(200))
        .jitter_fraction(0.2)
        .per_attempt_timeout(Duration::from_millis(100))
        .overall_deadline(Duration::from_secs(1))
        .failure_threshold(2)
        .open_duration_secs(0.5)
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .on_event(|obs| {
            if let Observation::Attempt { attempt, .. } = obs {
                println!(
                    "   attempt {} -> {:?} after {:?}",
                    attempt.number, attempt.outcome, attempt.duration
                );
            }
        })
        .build()
        .expect("valid configuration");

    for round in 1..=8 {
        println!("--- Call {} ---", round);
        match invoker.call(|ctx| greeter.say_hello(ctx, "world")) {
            Ok(reply) => println!("✓ {}", reply),
            Err(InvokeError::Rejected(rejection)) => println!("⛔ {}", rejection),
            Err(e) => println!("✗ {}", e),
        }
        println!("State: {}\n", invoker.breaker().state_name());

        if invoker.breaker().is_open() {
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    let fallback = invoker.call_with_fallback(
        |ctx| greeter.say_hello(ctx, "fallback"),
        |ctx| Ok(format!("cached greeting (circuit {} is {})", ctx.circuit_name, ctx.state)),
    );
    println!("Fallback call: {:?}", fallback.map_err(|e| e.to_string()));

    let counts = invoker.breaker().counts();
    println!("\nFinal state: {}", invoker.breaker().state_name());
    println!(
        "Window: {} calls, {} failed, {} attempts",
        counts.total_requests, counts.total_failures, counts.total_attempts
    );
}
