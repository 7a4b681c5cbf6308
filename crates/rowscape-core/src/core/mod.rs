// crates/rowscape-core/src/core/mod.rs
// ============================================================================
// Module: Rowscape Core Types
// Description: Identifiers, time, hashing, rows, tokens, records, settings.
// Purpose: Group the canonical value types shared by every Rowscape crate.
// Dependencies: crate::core submodules
// ============================================================================

//! ## Overview
//! The `core` module holds the value types of the audit model: opaque
//! identifiers, timestamps, canonical hashing, immutable pipeline rows,
//! tokens and their outcomes, the persisted record shapes, and the resolved
//! settings structures consumed at the engine boundary.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod hashing;
pub mod identifiers;
pub mod records;
pub mod row;
pub mod settings;
pub mod time;
pub mod tokens;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use identifiers::ArtifactId;
pub use identifiers::BatchId;
pub use identifiers::CallId;
pub use identifiers::EdgeId;
pub use identifiers::GroupId;
pub use identifiers::NodeId;
pub use identifiers::RowId;
pub use identifiers::RunId;
pub use identifiers::StateId;
pub use identifiers::TokenId;
pub use records::ArtifactRecord;
pub use records::BatchMemberRecord;
pub use records::BatchRecord;
pub use records::BatchStatus;
pub use records::CallRecord;
pub use records::CallStatus;
pub use records::CallType;
pub use records::DeterminismKind;
pub use records::EdgeRecord;
pub use records::EnumParseError;
pub use records::NodeRecord;
pub use records::NodeStateRecord;
pub use records::NodeStateStatus;
pub use records::NodeType;
pub use records::PayloadRecord;
pub use records::RoutingEventRecord;
pub use records::RoutingMode;
pub use records::RowRecord;
pub use records::RunRecord;
pub use records::RunStatus;
pub use records::TokenOutcomeRecord;
pub use records::TokenParentRecord;
pub use records::TokenRecord;
pub use records::TriggerKind;
pub use row::FieldContract;
pub use row::PipelineRow;
pub use row::RowData;
pub use row::SchemaConfig;
pub use row::SchemaContract;
pub use row::SchemaMode;
pub use settings::AggregationSettings;
pub use settings::GateAction;
pub use settings::GateRule;
pub use settings::GateSettings;
pub use settings::OutputMode;
pub use settings::PoolSettings;
pub use settings::RetrySettings;
pub use settings::TriggerSettings;
pub use time::Timestamp;
pub use time::TimestampError;
pub use tokens::FailureInfo;
pub use tokens::OutcomeKind;
pub use tokens::RowResult;
pub use tokens::Token;
pub use tokens::TokenOutcome;
