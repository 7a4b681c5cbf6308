// crates/rowscape-engine/src/coalesce.rs
// ============================================================================
// Module: Rowscape Coalesce Executor
// Description: Fork/join buffering and branch merging.
// Purpose: Hold fork children until all siblings arrive, then merge them.
// Dependencies: rowscape-core
// ============================================================================

//! ## Overview
//! Fork children that share a coalesce point are held here keyed by
//! `(row_id, coalesce_name)` until every expected sibling has arrived. The
//! merge folds branch row data in arrival order (later branches win on key
//! conflict) and creates the merged token through the token manager, which
//! also records the parents' `coalesced` outcomes atomically.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;

use rowscape_core::PipelineRow;
use rowscape_core::RowId;
use rowscape_core::RunId;
use rowscape_core::Token;

use crate::error::EngineError;
use crate::tokens::TokenManager;

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Result of submitting a token to a coalesce point.
#[derive(Debug)]
pub enum CoalesceOutcome {
    /// Token absorbed; siblings are still outstanding.
    Held,
    /// All siblings arrived; the merged token replaces them.
    Merged(Token),
}

// ============================================================================
// SECTION: Coalesce Executor
// ============================================================================

/// Holds pending fork branches and merges them once complete.
pub struct CoalesceExecutor {
    /// Expected branch count per coalesce point.
    expected_branches: HashMap<String, usize>,
    /// Held tokens keyed by row and coalesce point.
    pending: HashMap<(RowId, String), Vec<Token>>,
}

impl CoalesceExecutor {
    /// Creates a coalesce executor with the expected branch counts.
    #[must_use]
    pub fn new(expected_branches: HashMap<String, usize>) -> Self {
        Self {
            expected_branches,
            pending: HashMap::new(),
        }
    }

    /// Returns the number of tokens currently held for a coalesce point.
    #[must_use]
    pub fn pending_count(&self, row_id: &RowId, coalesce_name: &str) -> usize {
        self.pending
            .get(&(row_id.clone(), coalesce_name.to_string()))
            .map_or(0, Vec::len)
    }

    /// Submits a fork child to its coalesce point.
    ///
    /// Returns [`CoalesceOutcome::Held`] until the final sibling arrives, at
    /// which point the branches merge into one token in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvariantViolation`] for unknown coalesce
    /// points and [`EngineError`] when the merge cannot be recorded.
    pub fn accept(
        &mut self,
        token_manager: &TokenManager,
        run_id: &RunId,
        token: Token,
        coalesce_name: &str,
        step_in_pipeline: u32,
    ) -> Result<CoalesceOutcome, EngineError> {
        let Some(expected) = self.expected_branches.get(coalesce_name).copied() else {
            return Err(EngineError::InvariantViolation(format!(
                "unknown coalesce point: {coalesce_name}"
            )));
        };
        let key = (token.row_id.clone(), coalesce_name.to_string());
        let held = self.pending.entry(key.clone()).or_default();
        held.push(token);
        if held.len() < expected {
            return Ok(CoalesceOutcome::Held);
        }

        let parents = self.pending.remove(&key).unwrap_or_default();
        let merged_data = merge_branch_data(&parents);
        let merged =
            token_manager.coalesce_tokens(run_id, &parents, merged_data, step_in_pipeline)?;
        Ok(CoalesceOutcome::Merged(merged))
    }
}

// ============================================================================
// SECTION: Merge Policy
// ============================================================================

/// Folds branch row data in arrival order; later branches win on conflict.
fn merge_branch_data(parents: &[Token]) -> PipelineRow {
    let mut merged = rowscape_core::RowData::new();
    for parent in parents {
        for (key, value) in parent.row_data.as_map() {
            merged.insert(key.clone(), value.clone());
        }
    }
    PipelineRow::observed(merged)
}
