// crates/rowscape-store-sqlite/src/lib.rs
// ============================================================================
// Module: Rowscape SQLite Store Library
// Description: SQLite-backed landscape store.
// Purpose: Expose the durable Landscape implementation.
// Dependencies: crate::store
// ============================================================================

//! ## Overview
//! This crate provides [`SqliteLandscape`], the durable implementation of the
//! `rowscape-core` `Landscape` contract over `SQLite`. It supports an
//! in-memory mode for tests and a WAL-backed file mode for real runs; every
//! mutating call is a single transaction and every reader orders by
//! deterministic composite keys.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SqliteJournalMode;
pub use store::SqliteLandscape;
pub use store::SqliteLandscapeConfig;
pub use store::SqliteSyncMode;
