// crates/rowscape-core/src/core/tokens.rs
// ============================================================================
// Module: Rowscape Tokens
// Description: In-flight token values, terminal outcomes, and row results.
// Purpose: Model one concurrent flow of work over one row and how it ends.
// Dependencies: serde, crate::core::{identifiers, row}
// ============================================================================

//! ## Overview
//! A [`Token`] is the unit the scheduler schedules: one live flow of work
//! carrying one row along one path of the pipeline. Forking creates sibling
//! tokens, expansion creates children, coalescing merges siblings. Every
//! token leaves the pipeline with exactly one [`TokenOutcome`], recorded
//! exactly once in the landscape together with its referent.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::BatchId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::TokenId;
use crate::core::row::PipelineRow;

// ============================================================================
// SECTION: Token
// ============================================================================

/// One live unit of work carrying one row through the pipeline.
///
/// # Invariants
/// - `row_id` never changes across fork, expand, or data updates.
/// - Lineage markers (`branch_name`, group ids) survive
///   [`Token::with_row_data`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row this token carries.
    pub row_id: RowId,
    /// Current row data for this flow of work.
    pub row_data: PipelineRow,
    /// Branch name when this token was created by a fork.
    pub branch_name: Option<String>,
    /// Fork group shared with sibling tokens from the same fork.
    pub fork_group_id: Option<GroupId>,
    /// Expand group shared with sibling tokens from the same expansion.
    pub expand_group_id: Option<GroupId>,
    /// Join group assigned when this token was created by a coalesce.
    pub join_group_id: Option<GroupId>,
}

impl Token {
    /// Creates a token with no lineage markers.
    #[must_use]
    pub const fn new(token_id: TokenId, row_id: RowId, row_data: PipelineRow) -> Self {
        Self {
            token_id,
            row_id,
            row_data,
            branch_name: None,
            fork_group_id: None,
            expand_group_id: None,
            join_group_id: None,
        }
    }

    /// Returns a token with the same identity and lineage but new row data.
    #[must_use]
    pub fn with_row_data(&self, row_data: PipelineRow) -> Self {
        Self {
            token_id: self.token_id.clone(),
            row_id: self.row_id.clone(),
            row_data,
            branch_name: self.branch_name.clone(),
            fork_group_id: self.fork_group_id.clone(),
            expand_group_id: self.expand_group_id.clone(),
            join_group_id: self.join_group_id.clone(),
        }
    }
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Terminal outcome kind for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Token reached the end of the pipeline.
    Completed,
    /// Token failed after retries were exhausted or a fatal error.
    Failed,
    /// Token was routed to a named sink.
    Routed,
    /// Token forked into branch children.
    Forked,
    /// Token expanded into row children.
    Expanded,
    /// Token was produced by merging coalesced siblings, or absorbed into one.
    Coalesced,
    /// Token is buffered at an aggregation node (non-terminal bookkeeping).
    Buffered,
    /// Token was consumed by an aggregation batch.
    ConsumedInBatch,
    /// Token was quarantined at ingestion or by error routing.
    Quarantined,
}

impl OutcomeKind {
    /// Returns the stable storage label for the outcome kind.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Routed => "routed",
            Self::Forked => "forked",
            Self::Expanded => "expanded",
            Self::Coalesced => "coalesced",
            Self::Buffered => "buffered",
            Self::ConsumedInBatch => "consumed_in_batch",
            Self::Quarantined => "quarantined",
        }
    }

    /// Parses a stored outcome label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns the offending label when it names no known outcome.
    pub fn parse(label: &str) -> Result<Self, String> {
        match label {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "routed" => Ok(Self::Routed),
            "forked" => Ok(Self::Forked),
            "expanded" => Ok(Self::Expanded),
            "coalesced" => Ok(Self::Coalesced),
            "buffered" => Ok(Self::Buffered),
            "consumed_in_batch" => Ok(Self::ConsumedInBatch),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(other.to_string()),
        }
    }
}

/// Terminal outcome paired with the referent appropriate to its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenOutcome {
    /// Token reached the end of the pipeline.
    Completed,
    /// Token failed; carries the truncated error hash.
    Failed {
        /// Truncated hash of the error detail.
        error_hash: String,
    },
    /// Token was routed to a named sink.
    Routed {
        /// Destination sink name.
        sink_name: String,
    },
    /// Token forked into branch children.
    Forked {
        /// Group shared by the fork children.
        fork_group_id: GroupId,
    },
    /// Token expanded into row children.
    Expanded {
        /// Group shared by the expansion children.
        expand_group_id: GroupId,
    },
    /// Token participated in a coalesce (as parent or merged child).
    Coalesced {
        /// Group shared by the join parents and the merged token.
        join_group_id: GroupId,
    },
    /// Token is buffered at an aggregation node awaiting flush.
    Buffered {
        /// Batch the token is buffered into, when one is open.
        batch_id: Option<BatchId>,
    },
    /// Token was consumed by an aggregation batch.
    ConsumedInBatch {
        /// Batch that consumed the token, when one is open.
        batch_id: Option<BatchId>,
    },
    /// Token was quarantined.
    Quarantined {
        /// Truncated hash of the quarantine error, when one exists.
        error_hash: Option<String>,
    },
}

impl TokenOutcome {
    /// Returns the outcome kind for this outcome.
    #[must_use]
    pub const fn kind(&self) -> OutcomeKind {
        match self {
            Self::Completed => OutcomeKind::Completed,
            Self::Failed {
                ..
            } => OutcomeKind::Failed,
            Self::Routed {
                ..
            } => OutcomeKind::Routed,
            Self::Forked {
                ..
            } => OutcomeKind::Forked,
            Self::Expanded {
                ..
            } => OutcomeKind::Expanded,
            Self::Coalesced {
                ..
            } => OutcomeKind::Coalesced,
            Self::Buffered {
                ..
            } => OutcomeKind::Buffered,
            Self::ConsumedInBatch {
                ..
            } => OutcomeKind::ConsumedInBatch,
            Self::Quarantined {
                ..
            } => OutcomeKind::Quarantined,
        }
    }
}

// ============================================================================
// SECTION: Row Results
// ============================================================================

/// Structured failure detail attached to failed row results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Failure classification (e.g. `transform_error`, `max_retries_exceeded`).
    pub error_kind: String,
    /// Human-readable failure message.
    pub message: String,
}

impl FailureInfo {
    /// Creates a failure detail value.
    #[must_use]
    pub fn new(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_kind: error_kind.into(),
            message: message.into(),
        }
    }
}

/// Terminal result for one token leaving the row processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    /// Token the result belongs to.
    pub token: Token,
    /// Final row data at termination.
    pub final_data: PipelineRow,
    /// Terminal outcome kind.
    pub outcome: OutcomeKind,
    /// Destination sink when the outcome is `routed`.
    pub sink_name: Option<String>,
    /// Failure detail when the outcome is `failed`.
    pub error: Option<FailureInfo>,
}

impl RowResult {
    /// Creates a result with no sink or error detail.
    #[must_use]
    pub fn new(token: Token, outcome: OutcomeKind) -> Self {
        let final_data = token.row_data.clone();
        Self {
            token,
            final_data,
            outcome,
            sink_name: None,
            error: None,
        }
    }

    /// Creates a `routed` result carrying the destination sink name.
    #[must_use]
    pub fn routed(token: Token, sink_name: impl Into<String>) -> Self {
        let final_data = token.row_data.clone();
        Self {
            token,
            final_data,
            outcome: OutcomeKind::Routed,
            sink_name: Some(sink_name.into()),
            error: None,
        }
    }

    /// Creates a `failed` result carrying failure detail.
    #[must_use]
    pub fn failed(token: Token, error: FailureInfo) -> Self {
        let final_data = token.row_data.clone();
        Self {
            token,
            final_data,
            outcome: OutcomeKind::Failed,
            sink_name: None,
            error: Some(error),
        }
    }
}
