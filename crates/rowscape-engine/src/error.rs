// crates/rowscape-engine/src/error.rs
// ============================================================================
// Module: Rowscape Engine Errors
// Description: Hard-error taxonomy for the DAG runtime.
// Purpose: Separate engine invariant violations from recoverable plugin failures.
// Dependencies: rowscape-core, thiserror
// ============================================================================

//! ## Overview
//! The row processor recovers plugin-level failures into structured row
//! results; [`EngineError`] covers everything it cannot recover from: store
//! failures, canonicalization failures, its own invariant violations, and
//! run cancellation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rowscape_core::LandscapeError;
use rowscape_core::hashing::HashError;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Hard errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Landscape store failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Canonicalization failure while hashing row data.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// The per-row work queue exceeded its iteration guard.
    #[error("work queue exceeded {limit} iterations; possible loop in pipeline")]
    IterationCapExceeded {
        /// Configured iteration limit.
        limit: u32,
    },
    /// The pipeline violated an engine invariant.
    #[error("pipeline invariant violated: {0}")]
    InvariantViolation(String),
    /// The run was cancelled by the orchestrator.
    #[error("run cancelled")]
    Cancelled,
}
