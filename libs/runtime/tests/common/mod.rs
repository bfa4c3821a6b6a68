//! Shared scaffolding for the runtime integration tests.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use actor_runtime::ActorSystem;

/// Opt-in log output for debugging a failing test:
/// `RUST_LOG=actor_runtime=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One cooperative pass with a few milliseconds of budget.
pub fn tick(system: &ActorSystem) {
    system.tick(Instant::now() + Duration::from_millis(5));
}

/// Ticks the system (yielding to the async runtime in between) until
/// `condition` holds. Panics if it never does.
pub async fn run_until(system: &ActorSystem, what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tick(system);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Extra passes to check that nothing else fires after the condition of
/// interest settled.
pub async fn settle(system: &ActorSystem) {
    for _ in 0..20 {
        tick(system);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
