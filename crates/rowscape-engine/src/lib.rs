// crates/rowscape-engine/src/lib.rs
// ============================================================================
// Module: Rowscape Engine Library
// Description: Token-level DAG runtime for auditable row pipelines.
// Purpose: Expose the row processor and its supporting executors.
// Dependencies: crate::{aggregation, coalesce, error, executors, processor,
//               retry, tokens}
// ============================================================================

//! ## Overview
//! The engine crate drives one source row at a time through a resolved
//! pipeline of transforms, gates, and aggregations, recording every decision
//! in the landscape before it becomes visible to later steps. Concurrency
//! between rows belongs to the orchestrator; the engine guarantees per-row
//! determinism and exactly one recorded outcome per token.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod aggregation;
pub mod coalesce;
pub mod error;
pub mod executors;
pub mod processor;
pub mod retry;
pub mod tokens;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use aggregation::AggregationClock;
pub use aggregation::AggregationExecutor;
pub use aggregation::CustomTrigger;
pub use aggregation::FlushExecution;
pub use coalesce::CoalesceExecutor;
pub use coalesce::CoalesceOutcome;
pub use error::EngineError;
pub use executors::GateExecution;
pub use executors::GateExecutor;
pub use executors::GateOutcome;
pub use executors::RouteTarget;
pub use executors::TransformExecution;
pub use executors::TransformExecutor;
pub use processor::MAX_WORK_QUEUE_ITERATIONS;
pub use processor::ProcessorWiring;
pub use processor::RowProcessor;
pub use retry::MaxRetriesExceeded;
pub use retry::RetryManager;
pub use tokens::TokenManager;
