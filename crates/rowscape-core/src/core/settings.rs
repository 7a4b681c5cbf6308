// crates/rowscape-core/src/core/settings.rs
// ============================================================================
// Module: Rowscape Engine Settings
// Description: Resolved settings structures consumed at the engine boundary.
// Purpose: Carry aggregation, gate, retry, and pool configuration into the core.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Configuration parsing and profile merging are host concerns; the core only
//! consumes the resolved structures defined here. Defaults follow the
//! conservative side: single attempt retries off, pool size one, no custom
//! triggers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::records::TriggerKind;

// ============================================================================
// SECTION: Aggregation Settings
// ============================================================================

/// Flush trigger declared for an aggregation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSettings {
    /// Flush when the buffer reaches `n` tokens.
    Count {
        /// Buffer size that fires the flush.
        n: usize,
    },
    /// Flush when the oldest buffered token exceeds the given age.
    Timeout {
        /// Maximum buffered age in seconds.
        secs: u64,
    },
    /// Flush only when the source is exhausted.
    EndOfSource,
    /// Flush when a host-supplied evaluator fires.
    Custom,
}

impl TriggerSettings {
    /// Returns the trigger kind recorded on batches fired by this trigger.
    #[must_use]
    pub const fn kind(&self) -> TriggerKind {
        match self {
            Self::Count {
                ..
            } => TriggerKind::Count,
            Self::Timeout {
                ..
            } => TriggerKind::Timeout,
            Self::EndOfSource => TriggerKind::EndOfSource,
            Self::Custom => TriggerKind::Custom,
        }
    }
}

/// Output cardinality of an aggregation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// N buffered rows produce one aggregated row.
    Single,
    /// N buffered rows pass through enriched, one output per input.
    Passthrough,
    /// N buffered rows produce M new rows with fresh tokens.
    Transform,
}

/// Resolved settings for one aggregation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSettings {
    /// Flush trigger.
    pub trigger: TriggerSettings,
    /// Output cardinality.
    pub output_mode: OutputMode,
}

// ============================================================================
// SECTION: Config Gates
// ============================================================================

/// Action a config-driven gate takes for a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateAction {
    /// Token continues to the next step.
    Continue,
    /// Token routes to the named sink.
    RouteTo {
        /// Destination sink name.
        sink: String,
    },
    /// Token forks into one child per branch.
    ForkToPaths {
        /// Branch names, one child each.
        branches: Vec<String>,
    },
}

/// Routing rule evaluated by a config-driven gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateRule {
    /// Always take the given action.
    Always {
        /// Action taken for every token.
        action: GateAction,
    },
    /// Compare a row field against a constant and branch on the result.
    FieldEquals {
        /// Row field to inspect.
        field: String,
        /// Constant compared against the field value.
        value: Value,
        /// Action when the field equals the constant.
        when_true: GateAction,
        /// Action when the field differs or is absent.
        when_false: GateAction,
    },
}

/// Resolved settings for one config-driven gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    /// Gate name, unique among config gates.
    pub name: String,
    /// Routing rule.
    pub rule: GateRule,
}

// ============================================================================
// SECTION: Retry Settings
// ============================================================================

/// Retry policy for transform execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to jitter backoff delays.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

/// Returns the default maximum attempt count.
const fn default_max_attempts() -> u32 {
    3
}

/// Returns the default base backoff delay.
const fn default_base_delay_ms() -> u64 {
    100
}

/// Returns the default backoff delay ceiling.
const fn default_max_delay_ms() -> u64 {
    5_000
}

/// Returns the default jitter flag.
const fn default_jitter() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

// ============================================================================
// SECTION: Pool Settings
// ============================================================================

/// Settings for one pooled external-call executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Worker count and AIMD admission ceiling.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Maximum time a submit may block waiting for a permit, in milliseconds.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Consecutive successes required before the AIMD cap grows by one.
    #[serde(default = "default_increase_window")]
    pub increase_window: u32,
}

/// Returns the default pool size.
const fn default_pool_size() -> usize {
    1
}

/// Returns the default submit timeout.
const fn default_submit_timeout_ms() -> u64 {
    30_000
}

/// Returns the default AIMD additive-increase window.
const fn default_increase_window() -> u32 {
    8
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            submit_timeout_ms: default_submit_timeout_ms(),
            increase_window: default_increase_window(),
        }
    }
}
