// crates/rowscape-core/src/core/records.rs
// ============================================================================
// Module: Rowscape Landscape Records
// Description: Persisted record types and closed enums for the audit store.
// Purpose: Define the canonical shapes the landscape persists and exports.
// Dependencies: serde, serde_json, crate::core
// ============================================================================

//! ## Overview
//! These are the record shapes held by the landscape store and emitted by the
//! exporter. In-memory values and persisted rows carry the same fields. Every
//! enum has a stable storage label; parsing a stored label fails closed on
//! unknown values because silent coercion would corrupt the audit trail.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::CallId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::row::SchemaMode;
use crate::core::time::Timestamp;
use crate::core::tokens::OutcomeKind;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Error raised when a stored enum label does not parse.
///
/// # Invariants
/// - Raised on read, never silently coerced; a corrupt label fails the run.
#[derive(Debug, Error)]
#[error("invalid stored {field} value: {value}")]
pub struct EnumParseError {
    /// Field the label was read from.
    pub field: &'static str,
    /// Offending stored value.
    pub value: String,
}

impl EnumParseError {
    /// Creates a parse error for the given field and stored value.
    #[must_use]
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

// ============================================================================
// SECTION: Enums
// ============================================================================

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is executing.
    Running,
    /// Run finished with all rows processed.
    Completed,
    /// Run failed on a hard error.
    Failed,
    /// Run was cancelled before completion.
    Aborted,
}

impl RunStatus {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(EnumParseError::new("run status", other)),
        }
    }
}

/// Kind of a pipeline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Produces rows.
    Source,
    /// Maps rows to rows.
    Transform,
    /// Routes tokens.
    Gate,
    /// Buffers and flushes batches.
    Aggregation,
    /// Writes artifacts.
    Sink,
}

impl NodeType {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Transform => "transform",
            Self::Gate => "gate",
            Self::Aggregation => "aggregation",
            Self::Sink => "sink",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "source" => Ok(Self::Source),
            "transform" => Ok(Self::Transform),
            "gate" => Ok(Self::Gate),
            "aggregation" => Ok(Self::Aggregation),
            "sink" => Ok(Self::Sink),
            other => Err(EnumParseError::new("node type", other)),
        }
    }
}

/// Reproducibility class declared for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeterminismKind {
    /// Same input always yields the same output.
    Deterministic,
    /// Output may vary run to run.
    NonDeterministic,
    /// Output depends on an external service.
    ExternalCall,
}

impl DeterminismKind {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::NonDeterministic => "non_deterministic",
            Self::ExternalCall => "external_call",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "deterministic" => Ok(Self::Deterministic),
            "non_deterministic" => Ok(Self::NonDeterministic),
            "external_call" => Ok(Self::ExternalCall),
            other => Err(EnumParseError::new("determinism", other)),
        }
    }
}

/// Routing mode for an edge traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Token moves along the edge.
    Move,
    /// Token is copied along the edge.
    Copy,
}

impl RoutingMode {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Copy => "copy",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "move" => Ok(Self::Move),
            "copy" => Ok(Self::Copy),
            other => Err(EnumParseError::new("routing mode", other)),
        }
    }
}

/// Lifecycle status of one (token, node) execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    /// Execution is in flight.
    Running,
    /// Execution finished successfully.
    Completed,
    /// Execution failed.
    Failed,
}

impl NodeStateStatus {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EnumParseError::new("node state status", other)),
        }
    }
}

/// Lifecycle status of an aggregation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Batch is accepting members.
    Draft,
    /// Batch transform is executing.
    Executing,
    /// Batch completed.
    Completed,
    /// Batch failed.
    Failed,
}

impl BatchStatus {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "draft" => Ok(Self::Draft),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EnumParseError::new("batch status", other)),
        }
    }
}

/// Cause that fired an aggregation flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Buffer reached the configured count.
    Count,
    /// Oldest buffered token exceeded the configured age.
    Timeout,
    /// The source was exhausted.
    EndOfSource,
    /// A custom evaluator fired.
    Custom,
}

impl TriggerKind {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Timeout => "timeout",
            Self::EndOfSource => "end_of_source",
            Self::Custom => "custom",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "count" => Ok(Self::Count),
            "timeout" => Ok(Self::Timeout),
            "end_of_source" => Ok(Self::EndOfSource),
            "custom" => Ok(Self::Custom),
            other => Err(EnumParseError::new("trigger type", other)),
        }
    }
}

/// Kind of outbound external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// LLM completion call.
    Llm,
    /// Plain HTTP API call.
    Http,
}

impl CallType {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Http => "http",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "llm" => Ok(Self::Llm),
            "http" => Ok(Self::Http),
            other => Err(EnumParseError::new("call type", other)),
        }
    }
}

/// Outcome status of an outbound external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Call succeeded and the response was recorded.
    Success,
    /// Call failed.
    Error,
}

impl CallStatus {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parses a stored label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`EnumParseError`] for unknown labels.
    pub fn parse(label: &str) -> Result<Self, EnumParseError> {
        match label {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(EnumParseError::new("call status", other)),
        }
    }
}

// ============================================================================
// SECTION: Run / Node / Edge Records
// ============================================================================

/// One end-to-end pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: RunId,
    /// Start time.
    pub started_at: Timestamp,
    /// Completion time, set exactly once.
    pub completed_at: Option<Timestamp>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Canonicalization scheme version used for hashing in this run.
    pub canonical_version: String,
    /// Canonical hash of the resolved settings snapshot.
    pub config_hash: String,
    /// Resolved settings snapshot.
    pub settings: Value,
}

/// One registered pipeline node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identifier, unique within the run.
    pub node_id: NodeId,
    /// Owning run.
    pub run_id: RunId,
    /// Plugin name the node was built from.
    pub plugin_name: String,
    /// Plugin version.
    pub plugin_version: String,
    /// Node kind.
    pub node_type: NodeType,
    /// Resolved node configuration.
    pub config: Value,
    /// Canonical hash of the resolved configuration.
    pub config_hash: String,
    /// Canonical hash of the schema declaration.
    pub schema_hash: String,
    /// Declared schema mode.
    pub schema_mode: SchemaMode,
    /// Explicit schema field list, absent for observed schemas.
    pub schema_fields: Option<Vec<String>>,
    /// Reproducibility class.
    pub determinism: DeterminismKind,
    /// Position of the node in the resolved pipeline.
    pub sequence_in_pipeline: u32,
    /// Registration time.
    pub created_at: Timestamp,
}

/// One routing possibility between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Edge identifier.
    pub edge_id: EdgeId,
    /// Owning run.
    pub run_id: RunId,
    /// Origin node.
    pub from_node_id: NodeId,
    /// Destination node.
    pub to_node_id: NodeId,
    /// Edge label (`continue` or a branch name).
    pub label: String,
    /// Default routing mode for the edge.
    pub default_mode: RoutingMode,
    /// Registration time.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Row / Token Records
// ============================================================================

/// One source row, created once and immortal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    /// Row identifier.
    pub row_id: RowId,
    /// Owning run.
    pub run_id: RunId,
    /// Node that produced the row.
    pub source_node_id: NodeId,
    /// Position of the row in the source.
    pub row_index: u64,
    /// Canonical hash of the row data as produced by the source.
    pub source_data_hash: String,
    /// Content-addressed payload reference, absent after purge.
    pub data_ref: Option<String>,
    /// Ingestion error string for rows quarantined at the source boundary.
    pub quarantine_error: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
}

/// One persisted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token identifier.
    pub token_id: TokenId,
    /// Owning run.
    pub run_id: RunId,
    /// Row the token carries.
    pub row_id: RowId,
    /// Branch name for fork children.
    pub branch_name: Option<String>,
    /// Fork group shared by fork siblings.
    pub fork_group_id: Option<GroupId>,
    /// Expand group shared by expansion siblings.
    pub expand_group_id: Option<GroupId>,
    /// Join group for coalesced tokens.
    pub join_group_id: Option<GroupId>,
    /// Pipeline step at which the token was born.
    pub step_in_pipeline: u32,
    /// Creation time.
    pub created_at: Timestamp,
}

/// One parent link in the token lineage table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParentRecord {
    /// Child token.
    pub token_id: TokenId,
    /// Parent token.
    pub parent_token_id: TokenId,
    /// Position among the child's parents.
    pub ordinal: u32,
}

/// One recorded terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcomeRecord {
    /// Token the outcome belongs to.
    pub token_id: TokenId,
    /// Owning run.
    pub run_id: RunId,
    /// Outcome kind.
    pub outcome: OutcomeKind,
    /// Destination sink for `routed` outcomes.
    pub sink_name: Option<String>,
    /// Batch referent for buffered/consumed outcomes.
    pub batch_id: Option<BatchId>,
    /// Fork group referent for `forked` outcomes.
    pub fork_group_id: Option<GroupId>,
    /// Expand group referent for `expanded` outcomes.
    pub expand_group_id: Option<GroupId>,
    /// Join group referent for `coalesced` outcomes.
    pub join_group_id: Option<GroupId>,
    /// Truncated error hash for failed/quarantined outcomes.
    pub error_hash: Option<String>,
    /// Recording time.
    pub recorded_at: Timestamp,
}

// ============================================================================
// SECTION: Node-State / Routing Records
// ============================================================================

/// One (token, node) execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateRecord {
    /// State identifier.
    pub state_id: StateId,
    /// Owning run.
    pub run_id: RunId,
    /// Token being executed.
    pub token_id: TokenId,
    /// Node being executed.
    pub node_id: NodeId,
    /// Step index in the resolved pipeline (1-based).
    pub step_index: u32,
    /// Retry attempt number, starting at zero.
    pub attempt: u32,
    /// Execution status.
    pub status: NodeStateStatus,
    /// Canonical hash of the input row data.
    pub input_hash: String,
    /// Canonical hash of the output row data, once completed.
    pub output_hash: Option<String>,
    /// Wall-clock duration in milliseconds, once completed.
    pub duration_ms: Option<u64>,
    /// Start time.
    pub started_at: Timestamp,
    /// Completion time.
    pub completed_at: Option<Timestamp>,
}

/// One routing decision attached to a node-state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEventRecord {
    /// Event identifier.
    pub event_id: String,
    /// Node-state that produced the decision.
    pub state_id: StateId,
    /// Edge taken.
    pub edge_id: EdgeId,
    /// Routing mode applied.
    pub mode: RoutingMode,
    /// Small structured reason object.
    pub reason: Value,
    /// Recording time.
    pub recorded_at: Timestamp,
}

// ============================================================================
// SECTION: Batch Records
// ============================================================================

/// One aggregation flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Owning run.
    pub run_id: RunId,
    /// Aggregation node that produced the batch.
    pub aggregation_node_id: NodeId,
    /// Retry attempt number, starting at zero.
    pub attempt: u32,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// Cause that fired the flush, set at completion.
    pub trigger_type: Option<TriggerKind>,
    /// Structured trigger detail.
    pub trigger_reason: Option<Value>,
    /// Node-state that flushed the batch.
    pub aggregation_state_id: Option<StateId>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Completion time.
    pub completed_at: Option<Timestamp>,
}

/// One token membership in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMemberRecord {
    /// Owning batch.
    pub batch_id: BatchId,
    /// Member token.
    pub token_id: TokenId,
    /// Deterministic position inside the batch.
    pub ordinal: u32,
}

// ============================================================================
// SECTION: Call / Artifact Records
// ============================================================================

/// One outbound external call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call identifier.
    pub call_id: CallId,
    /// Owning run.
    pub run_id: RunId,
    /// Node-state the call was made under.
    pub state_id: StateId,
    /// Disambiguating index within `(state_id, call_type)`.
    pub call_index: u32,
    /// Call kind.
    pub call_type: CallType,
    /// Outcome status.
    pub status: CallStatus,
    /// Canonical hash of the request payload.
    pub request_hash: String,
    /// Canonical hash of the response payload, when one was received.
    pub response_hash: Option<String>,
    /// Content-addressed request payload reference, absent after purge.
    pub request_ref: Option<String>,
    /// Content-addressed response payload reference, absent after purge or
    /// when no response was ever received.
    pub response_ref: Option<String>,
    /// Wall-clock call latency in milliseconds.
    pub latency_ms: u64,
    /// Recording time.
    pub created_at: Timestamp,
}

/// One artifact written by a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Artifact identifier.
    pub artifact_id: ArtifactId,
    /// Owning run.
    pub run_id: RunId,
    /// Node-state that produced the artifact.
    pub produced_by_state_id: StateId,
    /// Sink node that wrote the artifact.
    pub sink_node_id: NodeId,
    /// Artifact kind label (host-defined).
    pub artifact_type: String,
    /// Destination path or URI.
    pub path_or_uri: String,
    /// Content hash of the written bytes.
    pub content_hash: String,
    /// Size of the written bytes.
    pub size_bytes: u64,
    /// Optional idempotency key supplied by the sink.
    pub idempotency_key: Option<String>,
    /// Recording time.
    pub created_at: Timestamp,
}

/// One content-addressed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRecord {
    /// Content hash addressing the payload.
    pub content_hash: String,
    /// Payload bytes, absent after purge.
    pub body: Option<Vec<u8>>,
    /// Size of the payload at write time.
    pub size_bytes: u64,
    /// First-write time.
    pub created_at: Timestamp,
}
