// crates/rowscape-core/src/core/time.rs
// ============================================================================
// Module: Rowscape Time Model
// Description: UTC timestamps with sub-second precision for audit records.
// Purpose: Provide a single replay-stable time representation for the landscape.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Every audit record carries a [`Timestamp`] in unix microseconds. The wire
//! form is a plain integer so canonical JSON stays stable across platforms;
//! RFC 3339 rendering is available for human-facing output. Ordering of
//! timestamps combined with identifier tie-breakers is the basis for
//! deterministic export.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when rendering timestamps.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The microsecond value does not map to a representable instant.
    #[error("timestamp out of range: {0}")]
    OutOfRange(i64),
    /// RFC 3339 formatting failed.
    #[error("timestamp formatting failed: {0}")]
    Format(String),
}

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// UTC timestamp in unix microseconds.
///
/// # Invariants
/// - The inner value is microseconds since the unix epoch, UTC.
/// - Comparisons are plain integer comparisons; no timezone logic applies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from unix microseconds.
    #[must_use]
    pub const fn from_unix_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        let micros = now.unix_timestamp_nanos() / 1_000;
        Self(clamp_i128(micros))
    }

    /// Returns the timestamp as unix microseconds.
    #[must_use]
    pub const fn as_unix_micros(self) -> i64 {
        self.0
    }

    /// Returns the whole seconds elapsed from `self` to `later`, or zero when
    /// `later` precedes `self`.
    #[must_use]
    pub const fn elapsed_secs(self, later: Self) -> u64 {
        let delta = later.0.saturating_sub(self.0);
        if delta <= 0 {
            0
        } else {
            (delta / 1_000_000) as u64
        }
    }

    /// Renders the timestamp as an RFC 3339 string with microsecond precision.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError`] when the value cannot be represented or
    /// formatted.
    pub fn to_rfc3339(self) -> Result<String, TimestampError> {
        let nanos = i128::from(self.0) * 1_000;
        let instant = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|_| TimestampError::OutOfRange(self.0))?;
        instant.format(&Rfc3339).map_err(|err| TimestampError::Format(err.to_string()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Clamps an i128 microsecond count into the i64 range.
#[allow(clippy::cast_possible_truncation, reason = "Value is range-checked before the cast.")]
const fn clamp_i128(value: i128) -> i64 {
    if value > i64::MAX as i128 {
        i64::MAX
    } else if value < i64::MIN as i128 {
        i64::MIN
    } else {
        value as i64
    }
}
