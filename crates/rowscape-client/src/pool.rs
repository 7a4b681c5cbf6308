// crates/rowscape-client/src/pool.rs
// ============================================================================
// Module: Rowscape Pooled Executor
// Description: Bounded worker pool with AIMD admission control.
// Purpose: Run external calls concurrently while reacting to capacity
//          feedback from the called service.
// Dependencies: rowscape-core, thiserror, tracing
// ============================================================================

//! ## Overview
//! The pooled executor owns a fixed set of worker threads and an AIMD
//! admission cap. Submissions block until an in-flight slot frees (or a
//! timeout trips); workers run one call at a time and feed the outcome back
//! into the controller: sustained success grows the cap additively, a
//! capacity outcome halves it. The cap never leaves `[1, pool_size]`.
//! Shutdown drains in-flight work, then refuses new submissions.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use rowscape_core::CallOutcome;
use rowscape_core::PoolSettings;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Pooled executor errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No permit became available inside the submit timeout.
    #[error("pool saturated: no permit after {waited_ms} ms")]
    Saturated {
        /// Milliseconds the submission waited.
        waited_ms: u64,
    },
    /// The pool has been shut down and refuses new work.
    #[error("pool is shut down")]
    ShutDown,
}

// ============================================================================
// SECTION: Jobs
// ============================================================================

/// One queued call job with its reply channel.
struct QueuedJob {
    /// Call closure executed by a worker.
    job: Box<dyn FnOnce() -> CallOutcome + Send>,
    /// Channel the outcome is delivered on.
    reply: mpsc::Sender<CallOutcome>,
}

// ============================================================================
// SECTION: Admission Control
// ============================================================================

/// Mutable AIMD controller state behind the pool mutex.
struct AdmissionState {
    /// Current in-flight cap, in `[1, pool_size]`.
    cap: usize,
    /// Calls currently holding a permit.
    in_flight: usize,
    /// Consecutive successes since the last cap change.
    consecutive_successes: u32,
    /// Set once shutdown begins; refuses new permits.
    shutting_down: bool,
}

/// Shared admission controller.
struct AdmissionController {
    /// Controller state.
    state: Mutex<AdmissionState>,
    /// Signalled when permits free or the cap changes.
    available: Condvar,
    /// Upper bound for the cap and permit count.
    pool_size: usize,
    /// Successes required before the cap grows by one.
    increase_window: u32,
}

impl AdmissionController {
    /// Creates a controller with the cap at `pool_size`.
    fn new(settings: &PoolSettings) -> Self {
        let pool_size = settings.pool_size.max(1);
        Self {
            state: Mutex::new(AdmissionState {
                cap: pool_size,
                in_flight: 0,
                consecutive_successes: 0,
                shutting_down: false,
            }),
            available: Condvar::new(),
            pool_size,
            increase_window: settings.increase_window.max(1),
        }
    }

    /// Blocks until an in-flight slot frees, or the timeout trips.
    fn acquire(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if state.shutting_down {
                return Err(PoolError::ShutDown);
            }
            if state.in_flight < state.cap {
                state.in_flight += 1;
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Saturated {
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let (next, wait) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
            if wait.timed_out() && state.in_flight >= state.cap {
                return Err(PoolError::Saturated {
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    /// Releases a permit and applies AIMD feedback from the call outcome.
    fn release(&self, outcome_was_capacity: bool, outcome_was_success: bool) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.in_flight = state.in_flight.saturating_sub(1);
        if outcome_was_capacity {
            let halved = (state.cap / 2).max(1);
            if halved != state.cap {
                debug!(cap = halved, "aimd cap halved on capacity feedback");
            }
            state.cap = halved;
            state.consecutive_successes = 0;
        } else if outcome_was_success {
            state.consecutive_successes += 1;
            if state.consecutive_successes >= self.increase_window && state.cap < self.pool_size {
                state.cap += 1;
                state.consecutive_successes = 0;
                debug!(cap = state.cap, "aimd cap increased after sustained success");
            }
        }
        drop(state);
        self.available.notify_all();
    }

    /// Marks the controller as shutting down and wakes waiters.
    fn begin_shutdown(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.shutting_down = true;
        drop(state);
        self.available.notify_all();
    }

    /// Returns the current admission cap.
    fn current_cap(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cap
    }
}

// ============================================================================
// SECTION: Pooled Executor
// ============================================================================

/// Bounded worker pool fronting all external calls of one transform.
///
/// # Invariants
/// - At most `cap <= pool_size` calls are in flight at any moment.
/// - Each call's lifetime is permit acquire, dispatch, permit release with
///   AIMD feedback.
pub struct PooledExecutor {
    /// Pool settings.
    settings: PoolSettings,
    /// Shared admission controller.
    controller: Arc<AdmissionController>,
    /// Job channel into the workers; dropped on shutdown.
    sender: Option<SyncSender<QueuedJob>>,
    /// Worker thread handles, joined on shutdown.
    workers: Vec<JoinHandle<()>>,
}

impl PooledExecutor {
    /// Spawns the worker pool.
    #[must_use]
    pub fn new(settings: PoolSettings) -> Self {
        let pool_size = settings.pool_size.max(1);
        let controller = Arc::new(AdmissionController::new(&settings));
        let (sender, receiver) = mpsc::sync_channel::<QueuedJob>(pool_size);
        let shared_receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let receiver = Arc::clone(&shared_receiver);
            let controller = Arc::clone(&controller);
            workers.push(thread::spawn(move || worker_loop(&receiver, &controller)));
        }
        Self {
            settings,
            controller,
            sender: Some(sender),
            workers,
        }
    }

    /// Returns the current AIMD admission cap.
    #[must_use]
    pub fn current_cap(&self) -> usize {
        self.controller.current_cap()
    }

    /// Submits one call job, blocking for a permit when saturated.
    ///
    /// Returns the receiver carrying the call outcome.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Saturated`] when no permit frees inside the
    /// submit timeout and [`PoolError::ShutDown`] after shutdown.
    pub fn submit(
        &self,
        job: impl FnOnce() -> CallOutcome + Send + 'static,
    ) -> Result<Receiver<CallOutcome>, PoolError> {
        let Some(sender) = &self.sender else {
            return Err(PoolError::ShutDown);
        };
        self.controller
            .acquire(Duration::from_millis(self.settings.submit_timeout_ms))?;
        let (reply, receiver) = mpsc::channel();
        let queued = QueuedJob {
            job: Box::new(job),
            reply,
        };
        if sender.send(queued).is_err() {
            self.controller.release(false, false);
            return Err(PoolError::ShutDown);
        }
        Ok(receiver)
    }

    /// Runs one call job to completion.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when submission fails or the pool dies before
    /// replying.
    pub fn execute(
        &self,
        job: impl FnOnce() -> CallOutcome + Send + 'static,
    ) -> Result<CallOutcome, PoolError> {
        let receiver = self.submit(job)?;
        receiver.recv().map_err(|_| PoolError::ShutDown)
    }

    /// Drains in-flight work and stops the workers. Further submissions are
    /// refused.
    pub fn shutdown(&mut self) {
        self.controller.begin_shutdown();
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for PooledExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// SECTION: Worker Loop
// ============================================================================

/// Worker body: take one job at a time, run it, feed AIMD, reply.
fn worker_loop(receiver: &Arc<Mutex<mpsc::Receiver<QueuedJob>>>, controller: &AdmissionController) {
    loop {
        let queued = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let Ok(queued) = queued else {
            return;
        };
        let outcome = (queued.job)();
        let was_capacity = outcome.is_capacity();
        let was_success = matches!(
            outcome,
            CallOutcome::Success {
                ..
            }
        );
        controller.release(was_capacity, was_success);
        let _ = queued.reply.send(outcome);
    }
}
