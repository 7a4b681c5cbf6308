// crates/rowscape-engine/src/retry.rs
// ============================================================================
// Module: Rowscape Retry Manager
// Description: Bounded retry with exponential backoff for transform calls.
// Purpose: Re-attempt transient plugin failures; give up with a typed error.
// Dependencies: rowscape-core, rand, thiserror
// ============================================================================

//! ## Overview
//! The retry manager consumes [`PluginCallError`] variants directly: capacity
//! and transient failures are retried up to the configured attempt cap with
//! jittered exponential backoff, fatal failures are surfaced immediately.
//! Processing results (`TransformResult::Error`) never reach this module.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::thread;
use std::time::Duration;

use rand::Rng;
use rowscape_core::PluginCallError;
use rowscape_core::RetrySettings;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Raised when every permitted attempt has failed.
#[derive(Debug, Error)]
#[error("operation failed after {attempts} attempts: {last_error}")]
pub struct MaxRetriesExceeded {
    /// Number of attempts made, including the first.
    pub attempts: u32,
    /// The failure from the final attempt.
    pub last_error: PluginCallError,
}

// ============================================================================
// SECTION: Retry Manager
// ============================================================================

/// Bounded retry executor for transform calls.
#[derive(Debug, Clone)]
pub struct RetryManager {
    /// Retry policy.
    settings: RetrySettings,
}

impl RetryManager {
    /// Creates a retry manager with the given policy.
    #[must_use]
    pub const fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
        }
    }

    /// Returns the configured attempt cap.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }

    /// Runs an operation, retrying retryable failures with backoff.
    ///
    /// The operation receives the attempt number (starting at zero) so each
    /// attempt can be recorded separately in the audit trail.
    ///
    /// # Errors
    ///
    /// Returns [`MaxRetriesExceeded`] once attempts are exhausted or the
    /// failure is not retryable.
    pub fn execute_with_retry<T>(
        &self,
        mut operation: impl FnMut(u32) -> Result<T, PluginCallError>,
    ) -> Result<T, MaxRetriesExceeded> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let next_attempt = attempt + 1;
                    if !error.is_retryable() || next_attempt >= max_attempts {
                        return Err(MaxRetriesExceeded {
                            attempts: next_attempt,
                            last_error: error,
                        });
                    }
                    thread::sleep(self.backoff_delay(attempt));
                    attempt = next_attempt;
                }
            }
        }
    }

    /// Returns the backoff delay for the given completed attempt.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let exponential =
            self.settings.base_delay_ms.saturating_mul(1_u64 << shift).min(self.settings.max_delay_ms);
        let millis = if self.settings.jitter && exponential > 1 {
            let half = exponential / 2;
            half + rand::thread_rng().gen_range(0..=half)
        } else {
            exponential
        };
        Duration::from_millis(millis)
    }
}
