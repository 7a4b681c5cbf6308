// crates/rowscape-client/tests/pool_unit.rs
// ============================================================================
// Module: Pooled Executor Tests
// Description: AIMD controller and saturation behaviour of the call pool.
// Purpose: Validate cap halving, additive recovery, bounds, saturation
//          timeouts, and shutdown semantics.
// ============================================================================

//! ## Overview
//! The pool's AIMD cap must halve on capacity feedback, recover additively
//! under sustained success, and never leave `[1, pool_size]`. Saturated
//! submissions block until a permit frees or the configured timeout trips;
//! a shut-down pool refuses new work.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::thread;
use std::time::Duration;

use rowscape_client::PoolError;
use rowscape_client::PooledExecutor;
use rowscape_core::CallOutcome;
use rowscape_core::PoolSettings;
use serde_json::json;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn settings(pool_size: usize, submit_timeout_ms: u64, increase_window: u32) -> PoolSettings {
    PoolSettings {
        pool_size,
        submit_timeout_ms,
        increase_window,
    }
}

fn success() -> CallOutcome {
    CallOutcome::Success {
        response: json!({"ok": true}),
        latency_ms: 1,
    }
}

fn capacity() -> CallOutcome {
    CallOutcome::Capacity {
        status: 429,
    }
}

// ============================================================================
// SECTION: AIMD Behaviour
// ============================================================================

#[test]
fn cap_starts_at_pool_size() {
    let pool = PooledExecutor::new(settings(4, 1_000, 8));
    assert_eq!(pool.current_cap(), 4);
}

#[test]
fn capacity_feedback_halves_the_cap_but_never_below_one() {
    let pool = PooledExecutor::new(settings(4, 1_000, 8));

    let outcome = pool.execute(capacity).expect("execute");
    assert!(outcome.is_capacity());
    assert_eq!(pool.current_cap(), 2);

    pool.execute(capacity).expect("execute");
    assert_eq!(pool.current_cap(), 1);

    pool.execute(capacity).expect("execute");
    assert_eq!(pool.current_cap(), 1);
}

#[test]
fn sustained_success_restores_the_cap_additively() {
    let pool = PooledExecutor::new(settings(4, 1_000, 1));

    pool.execute(capacity).expect("execute");
    pool.execute(capacity).expect("execute");
    assert_eq!(pool.current_cap(), 1);

    pool.execute(success).expect("execute");
    assert_eq!(pool.current_cap(), 2);
    pool.execute(success).expect("execute");
    pool.execute(success).expect("execute");
    assert_eq!(pool.current_cap(), 4);

    // Cap never exceeds pool_size.
    pool.execute(success).expect("execute");
    assert_eq!(pool.current_cap(), 4);
}

#[test]
fn transient_outcomes_do_not_move_the_cap() {
    let pool = PooledExecutor::new(settings(4, 1_000, 1));
    pool.execute(|| CallOutcome::Transient {
        message: "connection reset".to_string(),
    })
    .expect("execute");
    assert_eq!(pool.current_cap(), 4);
}

// ============================================================================
// SECTION: Saturation
// ============================================================================

#[test]
fn saturated_pool_times_out_submissions() {
    let pool = PooledExecutor::new(settings(1, 50, 8));

    let slow = pool
        .submit(|| {
            thread::sleep(Duration::from_millis(400));
            success()
        })
        .expect("first submit");

    let second = pool.submit(success);
    assert!(matches!(second, Err(PoolError::Saturated { .. })));

    // The slow call still completes and frees its permit.
    let outcome = slow.recv().expect("slow outcome");
    assert!(matches!(outcome, CallOutcome::Success { .. }));
    pool.execute(success).expect("permit freed");
}

#[test]
fn submissions_proceed_once_a_permit_frees() {
    let pool = PooledExecutor::new(settings(1, 2_000, 8));

    let slow = pool
        .submit(|| {
            thread::sleep(Duration::from_millis(100));
            success()
        })
        .expect("first submit");
    // Blocks until the slow job releases its permit, then runs.
    let outcome = pool.execute(success).expect("second call");
    assert!(matches!(outcome, CallOutcome::Success { .. }));
    slow.recv().expect("slow outcome");
}

// ============================================================================
// SECTION: Shutdown
// ============================================================================

#[test]
fn shutdown_drains_and_refuses_new_work() {
    let mut pool = PooledExecutor::new(settings(2, 1_000, 8));
    pool.execute(success).expect("execute before shutdown");

    pool.shutdown();
    let refused = pool.submit(success);
    assert!(matches!(refused, Err(PoolError::ShutDown)));
}
