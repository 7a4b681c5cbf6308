// crates/rowscape-engine/src/tokens.rs
// ============================================================================
// Module: Rowscape Token Manager
// Description: Token creation, fork, expand, coalesce, and data updates.
// Purpose: Pair every token mutation with its landscape write.
// Dependencies: rowscape-core, serde_json
// ============================================================================

//! ## Overview
//! The token manager is the only component that creates tokens. Each public
//! method updates in-memory state and writes to the landscape in one store
//! transaction. Fork and expand children receive independent deep copies of
//! their row data: downstream code mutates row maps freely, and a shared
//! reference between siblings would corrupt branches silently.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use rowscape_core::GroupId;
use rowscape_core::Landscape;
use rowscape_core::PipelineRow;
use rowscape_core::RowData;
use rowscape_core::RowId;
use rowscape_core::RunId;
use rowscape_core::SourceRow;
use rowscape_core::Token;
use rowscape_core::TokenOutcome;
use rowscape_core::hashing::short_error_hash;

use crate::error::EngineError;

// ============================================================================
// SECTION: Token Manager
// ============================================================================

/// Creates and evolves tokens, recording every mutation in the landscape.
pub struct TokenManager {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
}

impl TokenManager {
    /// Creates a token manager over a shared landscape handle.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self {
            landscape,
        }
    }

    /// Creates a row and its first token from a valid source row.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the landscape writes fail.
    pub fn create_initial_token(
        &self,
        run_id: &RunId,
        source_node_id: &rowscape_core::NodeId,
        row_index: u64,
        source_row: &SourceRow,
    ) -> Result<Token, EngineError> {
        let row =
            self.landscape.create_row(run_id, source_node_id, row_index, &source_row.row)?;
        let record = self.landscape.create_token(run_id, &row.row_id, 0)?;
        Ok(Token::new(record.token_id, row.row_id, source_row.row.clone()))
    }

    /// Creates a quarantined row, its token, and the quarantine outcome.
    ///
    /// The row record keeps the raw source bytes and the ingestion error; the
    /// token is terminal immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the landscape writes fail.
    pub fn create_quarantined_token(
        &self,
        run_id: &RunId,
        source_node_id: &rowscape_core::NodeId,
        row_index: u64,
        source_row: &SourceRow,
    ) -> Result<Token, EngineError> {
        let Some(quarantine) = &source_row.quarantine else {
            return Err(EngineError::InvariantViolation(
                "quarantined token requested for a valid source row".to_string(),
            ));
        };
        let row = self.landscape.create_quarantined_row(
            run_id,
            source_node_id,
            row_index,
            &quarantine.raw_data,
            &quarantine.error,
        )?;
        let record = self.landscape.create_token(run_id, &row.row_id, 0)?;
        let token = Token::new(record.token_id, row.row_id, source_row.row.clone());
        self.landscape.record_token_outcome(run_id, &token.token_id, &TokenOutcome::Quarantined {
            error_hash: Some(short_error_hash(&quarantine.error)),
        })?;
        Ok(token)
    }

    /// Creates a fresh token for a row that already exists (resume path).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the landscape write fails.
    pub fn create_token_for_existing_row(
        &self,
        run_id: &RunId,
        row_id: &RowId,
        row_data: PipelineRow,
    ) -> Result<Token, EngineError> {
        let record = self.landscape.create_token(run_id, row_id, 0)?;
        Ok(Token::new(record.token_id, row_id.clone(), row_data))
    }

    /// Forks a token into one child per branch.
    ///
    /// Children share the parent's `row_id` and one fresh fork group; each
    /// child's row data is an independent deep copy of the parent's data (or
    /// of the supplied override), so sibling mutations can never leak across
    /// branches.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the landscape write fails.
    pub fn fork_token(
        &self,
        run_id: &RunId,
        parent: &Token,
        branches: &[String],
        step_in_pipeline: u32,
        row_data: Option<&PipelineRow>,
    ) -> Result<(Vec<Token>, GroupId), EngineError> {
        let (records, fork_group_id) = self.landscape.fork_token(
            run_id,
            &parent.token_id,
            &parent.row_id,
            branches,
            step_in_pipeline,
        )?;
        let source_data = row_data.unwrap_or(&parent.row_data);
        let children = records
            .into_iter()
            .map(|record| Token {
                token_id: record.token_id,
                row_id: record.row_id,
                row_data: source_data.clone(),
                branch_name: record.branch_name,
                fork_group_id: record.fork_group_id,
                expand_group_id: None,
                join_group_id: None,
            })
            .collect();
        Ok((children, fork_group_id))
    }

    /// Expands a token into one child per output row.
    ///
    /// Each child receives its own deep-copied row data under an observed
    /// contract inferred from that row's fields.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the landscape write fails.
    pub fn expand_token(
        &self,
        run_id: &RunId,
        parent: &Token,
        expanded_rows: &[RowData],
        step_in_pipeline: u32,
    ) -> Result<(Vec<Token>, GroupId), EngineError> {
        let (records, expand_group_id) = self.landscape.expand_token(
            run_id,
            &parent.token_id,
            &parent.row_id,
            expanded_rows.len(),
            step_in_pipeline,
        )?;
        let children = records
            .into_iter()
            .zip(expanded_rows.iter())
            .map(|(record, data)| Token {
                token_id: record.token_id,
                row_id: record.row_id,
                row_data: PipelineRow::observed(data.clone()),
                branch_name: None,
                fork_group_id: None,
                expand_group_id: record.expand_group_id,
                join_group_id: None,
            })
            .collect();
        Ok((children, expand_group_id))
    }

    /// Coalesces sibling tokens into one merged child referencing all
    /// parents. The parents receive their `coalesced` outcomes inside the
    /// same store transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the landscape write fails or no parents
    /// are supplied.
    pub fn coalesce_tokens(
        &self,
        run_id: &RunId,
        parents: &[Token],
        merged_data: PipelineRow,
        step_in_pipeline: u32,
    ) -> Result<Token, EngineError> {
        let Some(first) = parents.first() else {
            return Err(EngineError::InvariantViolation(
                "coalesce requires at least one parent token".to_string(),
            ));
        };
        let parent_ids: Vec<_> = parents.iter().map(|parent| parent.token_id.clone()).collect();
        let (record, _join_group_id) = self.landscape.coalesce_tokens(
            run_id,
            &parent_ids,
            &first.row_id,
            step_in_pipeline,
        )?;
        Ok(Token {
            token_id: record.token_id,
            row_id: record.row_id,
            row_data: merged_data,
            branch_name: None,
            fork_group_id: None,
            expand_group_id: None,
            join_group_id: record.join_group_id,
        })
    }

    /// Returns a token with the same identity but updated row data.
    ///
    /// Lineage markers (`branch_name` and the group ids) are preserved; this
    /// is the only sanctioned way to carry new data forward on a live token.
    #[must_use]
    pub fn update_row_data(&self, token: &Token, new_data: PipelineRow) -> Token {
        token.with_row_data(new_data)
    }
}
