// crates/rowscape-core/src/interfaces/mod.rs
// ============================================================================
// Module: Rowscape Interfaces
// Description: Store, plugin, and call contracts consumed by the engine.
// Purpose: Define the seams between the core and its collaborators.
// Dependencies: serde, serde_json, thiserror, crate::core
// ============================================================================

//! ## Overview
//! These interfaces are the only surfaces the engine touches: the
//! [`Landscape`] store trait, the closed set of plugin behaviour traits, and
//! the result sum types that replace exception-style control flow. Capacity
//! and batch-pending conditions are values, not panics, so the retry manager
//! and pool can consume them directly.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::hashing::HashError;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::records::ArtifactRecord;
use crate::core::records::BatchMemberRecord;
use crate::core::records::BatchRecord;
use crate::core::records::BatchStatus;
use crate::core::records::CallRecord;
use crate::core::records::CallStatus;
use crate::core::records::CallType;
use crate::core::records::DeterminismKind;
use crate::core::records::EdgeRecord;
use crate::core::records::EnumParseError;
use crate::core::records::NodeRecord;
use crate::core::records::NodeStateRecord;
use crate::core::records::NodeStateStatus;
use crate::core::records::NodeType;
use crate::core::records::PayloadRecord;
use crate::core::records::RoutingEventRecord;
use crate::core::records::RoutingMode;
use crate::core::records::RowRecord;
use crate::core::records::RunRecord;
use crate::core::records::RunStatus;
use crate::core::records::TokenOutcomeRecord;
use crate::core::records::TokenParentRecord;
use crate::core::records::TokenRecord;
use crate::core::records::TriggerKind;
use crate::core::row::PipelineRow;
use crate::core::row::RowData;
use crate::core::row::SchemaConfig;
use crate::core::settings::GateAction;
use crate::core::tokens::Token;
use crate::core::tokens::TokenOutcome;

// ============================================================================
// SECTION: Landscape Errors
// ============================================================================

/// Landscape store errors.
///
/// # Invariants
/// - `Corrupt` is raised on invalid stored values and is never coerced away.
#[derive(Debug, Error)]
pub enum LandscapeError {
    /// Store I/O error.
    #[error("landscape io error: {0}")]
    Io(String),
    /// Database engine error.
    #[error("landscape db error: {0}")]
    Db(String),
    /// Stored data is corrupt or fails integrity checks.
    #[error("landscape corruption: {0}")]
    Corrupt(String),
    /// Referenced record does not exist.
    #[error("landscape record not found: {0}")]
    NotFound(String),
    /// Operation conflicts with recorded state (e.g. duplicate outcome).
    #[error("landscape conflict: {0}")]
    Conflict(String),
    /// Invalid arguments or payloads supplied by the caller.
    #[error("landscape invalid data: {0}")]
    Invalid(String),
}

impl From<EnumParseError> for LandscapeError {
    fn from(error: EnumParseError) -> Self {
        Self::Corrupt(error.to_string())
    }
}

impl From<HashError> for LandscapeError {
    fn from(error: HashError) -> Self {
        Self::Invalid(error.to_string())
    }
}

// ============================================================================
// SECTION: Reader Paging
// ============================================================================

/// Paging window for list-returning readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Number of leading records to skip.
    pub offset: u64,
    /// Maximum records to return, unbounded when absent.
    pub limit: Option<u64>,
}

impl Page {
    /// Returns a window covering every record.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            offset: 0,
            limit: None,
        }
    }

    /// Returns a bounded window.
    #[must_use]
    pub const fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::all()
    }
}

// ============================================================================
// SECTION: Mutation Parameter Shapes
// ============================================================================

/// Parameters for registering one pipeline node.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    /// Owning run.
    pub run_id: RunId,
    /// Explicit node identifier; generated when absent.
    pub node_id: Option<NodeId>,
    /// Plugin name the node is built from.
    pub plugin_name: String,
    /// Plugin version.
    pub plugin_version: String,
    /// Node kind.
    pub node_type: NodeType,
    /// Resolved node configuration.
    pub config: Value,
    /// Schema declaration at this node boundary.
    pub schema: SchemaConfig,
    /// Reproducibility class.
    pub determinism: DeterminismKind,
    /// Position in the resolved pipeline.
    pub sequence_in_pipeline: u32,
}

/// Parameters for recording one outbound external call.
///
/// The store canonicalises and hashes the payloads itself so every recorded
/// hash goes through one code path.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// Owning run.
    pub run_id: RunId,
    /// Node-state the call was made under.
    pub state_id: StateId,
    /// Call kind.
    pub call_type: CallType,
    /// Index previously allocated for `(state_id, call_type)`.
    pub call_index: u32,
    /// Outcome status.
    pub status: CallStatus,
    /// Request payload.
    pub request_data: Value,
    /// Response payload, when one was received.
    pub response_data: Option<Value>,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
}

/// Parameters for registering one sink artifact.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    /// Owning run.
    pub run_id: RunId,
    /// Node-state that produced the artifact.
    pub produced_by_state_id: StateId,
    /// Sink node that wrote the artifact.
    pub sink_node_id: NodeId,
    /// Descriptor returned by the sink.
    pub descriptor: ArtifactDescriptor,
    /// Optional idempotency key.
    pub idempotency_key: Option<String>,
}

// ============================================================================
// SECTION: Landscape Store Contract
// ============================================================================

/// Transactional audit store shared by every component of a run.
///
/// # Invariants
/// - Each mutating call is a single transaction; multi-row operations (fork,
///   expand, coalesce, batch retry) are atomic.
/// - Every list-returning reader orders by a deterministic composite key
///   (creation time plus an insertion-stable tie-breaker) so repeated
///   exports are byte-identical.
/// - Node registration fails once the run has produced tokens.
#[allow(clippy::too_many_arguments, reason = "Store mutators mirror the audit record shapes.")]
pub trait Landscape: Send + Sync {
    /// Begins a new run with the resolved settings snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the run cannot be created.
    fn begin_run(&self, settings: &Value, canonical_version: &str)
    -> Result<RunRecord, LandscapeError>;

    /// Finalises a run exactly once with its terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Conflict`] when the run is already final.
    fn complete_run(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord, LandscapeError>;

    /// Loads a run by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>, LandscapeError>;

    /// Registers a node; frozen once the run has tokens.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Conflict`] when tokens already exist.
    fn register_node(&self, registration: NodeRegistration) -> Result<NodeRecord, LandscapeError>;

    /// Lists the nodes of a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_nodes(&self, run_id: &RunId) -> Result<Vec<NodeRecord>, LandscapeError>;

    /// Registers a routing edge.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the edge cannot be created.
    fn register_edge(
        &self,
        run_id: &RunId,
        from_node_id: &NodeId,
        to_node_id: &NodeId,
        label: &str,
        default_mode: RoutingMode,
    ) -> Result<EdgeRecord, LandscapeError>;

    /// Lists the edges of a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_edges(&self, run_id: &RunId) -> Result<Vec<EdgeRecord>, LandscapeError>;

    /// Creates a source row, persisting its data content-addressed.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the row cannot be created.
    fn create_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        data: &PipelineRow,
    ) -> Result<RowRecord, LandscapeError>;

    /// Creates a quarantined row from raw source bytes and an error string.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the row cannot be created.
    fn create_quarantined_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        raw_data: &str,
        error: &str,
    ) -> Result<RowRecord, LandscapeError>;

    /// Lists rows in deterministic order within the paging window.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_rows(&self, run_id: &RunId, page: Page) -> Result<Vec<RowRecord>, LandscapeError>;

    /// Creates a parentless token for a row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the token cannot be created.
    fn create_token(
        &self,
        run_id: &RunId,
        row_id: &RowId,
        step_in_pipeline: u32,
    ) -> Result<TokenRecord, LandscapeError>;

    /// Forks a token into one child per branch; atomic.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the fork cannot be recorded.
    fn fork_token(
        &self,
        run_id: &RunId,
        parent_token_id: &TokenId,
        row_id: &RowId,
        branches: &[String],
        step_in_pipeline: u32,
    ) -> Result<(Vec<TokenRecord>, GroupId), LandscapeError>;

    /// Expands a token into `child_count` children; atomic.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the expansion cannot be recorded.
    fn expand_token(
        &self,
        run_id: &RunId,
        parent_token_id: &TokenId,
        row_id: &RowId,
        child_count: usize,
        step_in_pipeline: u32,
    ) -> Result<(Vec<TokenRecord>, GroupId), LandscapeError>;

    /// Coalesces parent tokens into one merged child; atomic. Each parent
    /// also receives its `coalesced` outcome inside the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the coalesce cannot be recorded.
    fn coalesce_tokens(
        &self,
        run_id: &RunId,
        parent_token_ids: &[TokenId],
        row_id: &RowId,
        step_in_pipeline: u32,
    ) -> Result<(TokenRecord, GroupId), LandscapeError>;

    /// Lists tokens in deterministic order within the paging window.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_tokens(&self, run_id: &RunId, page: Page) -> Result<Vec<TokenRecord>, LandscapeError>;

    /// Loads one token.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_token(&self, token_id: &TokenId) -> Result<Option<TokenRecord>, LandscapeError>;

    /// Lists all parent links for a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_token_parents(&self, run_id: &RunId)
    -> Result<Vec<TokenParentRecord>, LandscapeError>;

    /// Records a token's terminal outcome exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Conflict`] when an outcome already exists.
    fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        outcome: &TokenOutcome,
    ) -> Result<(), LandscapeError>;

    /// Loads the outcome for one token, when recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcomeRecord>, LandscapeError>;

    /// Lists all recorded outcomes for a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_token_outcomes(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TokenOutcomeRecord>, LandscapeError>;

    /// Opens a node-state for one (token, node) execution attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the state cannot be created.
    fn begin_node_state(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: &str,
    ) -> Result<NodeStateRecord, LandscapeError>;

    /// Completes a node-state with its terminal status and output hash.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] when the state does not exist.
    fn complete_node_state(
        &self,
        state_id: &StateId,
        status: NodeStateStatus,
        output_hash: Option<&str>,
    ) -> Result<NodeStateRecord, LandscapeError>;

    /// Lists node-states for one token in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_node_states_for_token(
        &self,
        token_id: &TokenId,
    ) -> Result<Vec<NodeStateRecord>, LandscapeError>;

    /// Lists all node-states for a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_node_states(&self, run_id: &RunId) -> Result<Vec<NodeStateRecord>, LandscapeError>;

    /// Records a routing decision against a node-state.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the event cannot be recorded.
    fn record_routing_event(
        &self,
        state_id: &StateId,
        edge_id: &EdgeId,
        mode: RoutingMode,
        reason: &Value,
    ) -> Result<RoutingEventRecord, LandscapeError>;

    /// Lists routing events for a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_routing_events(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<RoutingEventRecord>, LandscapeError>;

    /// Allocates the next call index for `(state_id, call_type)`; strictly
    /// monotonic across concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when allocation fails.
    fn allocate_call_index(
        &self,
        state_id: &StateId,
        call_type: CallType,
    ) -> Result<u32, LandscapeError>;

    /// Records one external call, persisting payloads content-addressed.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the call cannot be recorded.
    fn record_call(&self, call: CallSpec) -> Result<CallRecord, LandscapeError>;

    /// Lists calls for a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_calls(&self, run_id: &RunId) -> Result<Vec<CallRecord>, LandscapeError>;

    /// Lists calls matching a request hash, ordered by creation then id, so
    /// duplicate identical requests replay in recording order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn find_calls_by_request_hash(
        &self,
        run_id: &RunId,
        call_type: CallType,
        request_hash: &str,
    ) -> Result<Vec<CallRecord>, LandscapeError>;

    /// Creates a draft batch for an aggregation node.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch cannot be created.
    fn create_batch(
        &self,
        run_id: &RunId,
        aggregation_node_id: &NodeId,
        attempt: u32,
    ) -> Result<BatchRecord, LandscapeError>;

    /// Adds a member token to a batch at the given ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the member cannot be added.
    fn add_batch_member(
        &self,
        batch_id: &BatchId,
        token_id: &TokenId,
        ordinal: u32,
    ) -> Result<(), LandscapeError>;

    /// Updates a batch's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] when the batch does not exist.
    fn update_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
    ) -> Result<BatchRecord, LandscapeError>;

    /// Completes a batch with trigger metadata and the flushing state.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] when the batch does not exist.
    fn complete_batch(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
        trigger_type: TriggerKind,
        trigger_reason: Option<&Value>,
        aggregation_state_id: Option<&StateId>,
    ) -> Result<BatchRecord, LandscapeError>;

    /// Creates a fresh batch attempt copying the prior batch's members.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] when the batch does not exist.
    fn retry_batch(&self, batch_id: &BatchId) -> Result<BatchRecord, LandscapeError>;

    /// Loads one batch.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, LandscapeError>;

    /// Lists batches for a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_batches(&self, run_id: &RunId) -> Result<Vec<BatchRecord>, LandscapeError>;

    /// Lists batch members in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_batch_members(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<BatchMemberRecord>, LandscapeError>;

    /// Registers a sink artifact; append-only.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the artifact cannot be recorded.
    fn register_artifact(&self, artifact: ArtifactSpec) -> Result<ArtifactRecord, LandscapeError>;

    /// Lists artifacts for a run in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_artifacts(&self, run_id: &RunId) -> Result<Vec<ArtifactRecord>, LandscapeError>;

    /// Loads a content-addressed payload; the record survives purge.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_payload(&self, content_hash: &str) -> Result<Option<PayloadRecord>, LandscapeError>;

    /// Purges a payload body, keeping the addressing record. Returns whether
    /// a body was removed.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the purge fails.
    fn purge_payload(&self, content_hash: &str) -> Result<bool, LandscapeError>;
}

// ============================================================================
// SECTION: Source Contract
// ============================================================================

/// Quarantine detail attached to rows rejected at the source boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineInfo {
    /// Destination sink for the quarantined row, when configured.
    pub destination: Option<String>,
    /// Ingestion error string.
    pub error: String,
    /// Raw source bytes as text, kept for the audit record.
    pub raw_data: String,
}

/// One row yielded by a source, possibly quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    /// Row data under its admission contract.
    pub row: PipelineRow,
    /// Quarantine detail when the row failed ingestion.
    pub quarantine: Option<QuarantineInfo>,
}

impl SourceRow {
    /// Creates a valid source row.
    #[must_use]
    pub const fn valid(row: PipelineRow) -> Self {
        Self {
            row,
            quarantine: None,
        }
    }

    /// Creates a quarantined source row.
    #[must_use]
    pub const fn quarantined(row: PipelineRow, quarantine: QuarantineInfo) -> Self {
        Self {
            row,
            quarantine: Some(quarantine),
        }
    }

    /// Returns `true` when the row was quarantined at ingestion.
    #[must_use]
    pub const fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }
}

// ============================================================================
// SECTION: Transform Contract
// ============================================================================

/// Processing result returned by a transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransformResult {
    /// One output row.
    Success {
        /// Output row data.
        row: PipelineRow,
    },
    /// Multiple output rows (deaggregation or batch output).
    SuccessMulti {
        /// Output rows in order.
        rows: Vec<RowData>,
    },
    /// Processing error; never retried.
    Error {
        /// Structured error reason.
        reason: Value,
        /// Whether the caller may route the row onward for reprocessing.
        retryable: bool,
    },
}

impl TransformResult {
    /// Creates a single-row success.
    #[must_use]
    pub const fn success(row: PipelineRow) -> Self {
        Self::Success {
            row,
        }
    }

    /// Creates a multi-row success.
    #[must_use]
    pub const fn success_multi(rows: Vec<RowData>) -> Self {
        Self::SuccessMulti {
            rows,
        }
    }

    /// Creates a non-retryable processing error.
    #[must_use]
    pub const fn error(reason: Value) -> Self {
        Self::Error {
            reason,
            retryable: false,
        }
    }

    /// Returns `true` for multi-row successes.
    #[must_use]
    pub const fn is_multi_row(&self) -> bool {
        matches!(
            self,
            Self::SuccessMulti {
                ..
            }
        )
    }
}

/// Machinery-level failure surfaced by a plugin call.
///
/// These are distinct from [`TransformResult::Error`]: a processing error is
/// a result and is never retried, while capacity and transient failures are
/// retry candidates.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginCallError {
    /// External service signalled saturation (HTTP 429 or 503).
    #[error("external capacity error: status {status}")]
    Capacity {
        /// HTTP status code that signalled saturation.
        status: u16,
    },
    /// Transient failure (network, timeout, 5xx non-capacity).
    #[error("transient plugin failure: {message}")]
    Transient {
        /// Failure detail.
        message: String,
    },
    /// Non-retryable failure (template rendering, programming error).
    #[error("fatal plugin failure: {message}")]
    Fatal {
        /// Failure detail.
        message: String,
    },
}

impl PluginCallError {
    /// Returns `true` when the retry manager may re-attempt the call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Capacity {
                ..
            } | Self::Transient {
                ..
            }
        )
    }
}

// ============================================================================
// SECTION: Gate Contract
// ============================================================================

/// Routing decision returned by a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingDecision {
    /// Token continues to the next step.
    Continue,
    /// Token is terminal, routed to the named sink.
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

impl From<GateAction> for RoutingDecision {
    fn from(action: GateAction) -> Self {
        match action {
            GateAction::Continue => Self::Continue,
            GateAction::RouteTo {
                sink,
            } => Self::RouteTo {
                sink,
            },
            GateAction::ForkToPaths {
                branches,
            } => Self::ForkToPaths {
                branches,
            },
        }
    }
}

// ============================================================================
// SECTION: Plugin Header and Context
// ============================================================================

/// Identity and capability header carried by every plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginHeader {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Reproducibility class of the plugin's behaviour.
    pub determinism: DeterminismKind,
}

impl PluginHeader {
    /// Creates a header value.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        determinism: DeterminismKind,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            determinism,
        }
    }
}

/// Per-invocation context handed to plugins.
///
/// # Invariants
/// - `state_id` is set by the executor before each plugin call so audited
///   external calls are recorded against the correct node-state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginContext {
    /// Owning run.
    pub run_id: RunId,
    /// Node the plugin is executing as.
    pub node_id: NodeId,
    /// Current node-state, set for the duration of one plugin call.
    pub state_id: Option<StateId>,
    /// Opaque checkpoint blob, serialised by the engine on suspend.
    pub checkpoint: Option<Value>,
    /// Additional context metadata.
    pub metadata: RowData,
}

impl PluginContext {
    /// Creates a context for one node of a run.
    #[must_use]
    pub fn new(run_id: RunId, node_id: NodeId) -> Self {
        Self {
            run_id,
            node_id,
            state_id: None,
            checkpoint: None,
            metadata: RowData::new(),
        }
    }
}

// ============================================================================
// SECTION: Plugin Behaviour Traits
// ============================================================================

/// Row source.
pub trait SourcePlugin: Send {
    /// Returns the plugin header.
    fn header(&self) -> &PluginHeader;

    /// Loads the source rows, including quarantined rows.
    ///
    /// # Errors
    ///
    /// Returns [`PluginCallError`] when the source cannot be opened.
    fn load(
        &mut self,
        ctx: &mut PluginContext,
    ) -> Result<Box<dyn Iterator<Item = SourceRow> + '_>, PluginCallError>;
}

/// Row transform; batch awareness is a capability flag, not a subtype.
pub trait TransformPlugin: Send {
    /// Returns the plugin header.
    fn header(&self) -> &PluginHeader;

    /// Returns `true` when the transform consumes buffered row batches.
    fn is_batch_aware(&self) -> bool {
        false
    }

    /// Returns `true` when multi-row results are allowed (deaggregation).
    fn creates_tokens(&self) -> bool {
        false
    }

    /// Returns the error sink for processing errors; `None` means discard.
    fn error_sink(&self) -> Option<&str> {
        None
    }

    /// Processes one row.
    ///
    /// # Errors
    ///
    /// Returns [`PluginCallError`] for machinery failures; processing errors
    /// are expressed through [`TransformResult::Error`].
    fn process(
        &self,
        row: &PipelineRow,
        ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError>;

    /// Processes a buffered batch of rows; only called when
    /// [`Self::is_batch_aware`] returns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginCallError::Fatal`] by default for batch-unaware
    /// transforms.
    fn process_batch(
        &self,
        rows: &[PipelineRow],
        ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        let _ = (rows, ctx);
        Err(PluginCallError::Fatal {
            message: format!("transform '{}' is not batch aware", self.header().name),
        })
    }
}

/// Token router.
pub trait GatePlugin: Send {
    /// Returns the plugin header.
    fn header(&self) -> &PluginHeader;

    /// Evaluates the routing decision for a token.
    ///
    /// # Errors
    ///
    /// Returns [`PluginCallError`] when evaluation fails.
    fn evaluate(
        &self,
        token: &Token,
        ctx: &mut PluginContext,
    ) -> Result<RoutingDecision, PluginCallError>;
}

/// Artifact descriptor returned by sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Artifact kind label.
    pub artifact_type: String,
    /// Destination path or URI.
    pub path_or_uri: String,
    /// Content hash of the written bytes.
    pub content_hash: String,
    /// Size of the written bytes.
    pub size_bytes: u64,
}

/// Artifact writer.
pub trait SinkPlugin: Send {
    /// Returns the plugin header.
    fn header(&self) -> &PluginHeader;

    /// Writes rows and returns the artifact descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PluginCallError`] when the write fails.
    fn write(
        &mut self,
        rows: &[PipelineRow],
        ctx: &mut PluginContext,
    ) -> Result<ArtifactDescriptor, PluginCallError>;
}

/// Request middleware applied by the audited call client before hashing.
pub trait LlmMiddleware: Send + Sync {
    /// Transforms an outbound request payload.
    fn before_request(&self, request: Value) -> Value;
}

// ============================================================================
// SECTION: Pipeline Steps
// ============================================================================

/// Behaviour variant for one resolved pipeline step.
pub enum StepKind {
    /// Transform step.
    Transform(Box<dyn TransformPlugin>),
    /// Gate step.
    Gate(Box<dyn GatePlugin>),
}

impl std::fmt::Debug for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transform(plugin) => {
                f.debug_tuple("Transform").field(&plugin.header().name).finish()
            }
            Self::Gate(plugin) => f.debug_tuple("Gate").field(&plugin.header().name).finish(),
        }
    }
}

/// One resolved pipeline step handed to the row processor.
#[derive(Debug)]
pub struct PipelineStep {
    /// Node the step executes as.
    pub node_id: NodeId,
    /// Step behaviour.
    pub kind: StepKind,
}

impl PipelineStep {
    /// Creates a transform step.
    #[must_use]
    pub fn transform(node_id: NodeId, plugin: Box<dyn TransformPlugin>) -> Self {
        Self {
            node_id,
            kind: StepKind::Transform(plugin),
        }
    }

    /// Creates a gate step.
    #[must_use]
    pub fn gate(node_id: NodeId, plugin: Box<dyn GatePlugin>) -> Self {
        Self {
            node_id,
            kind: StepKind::Gate(plugin),
        }
    }
}

// ============================================================================
// SECTION: External Call Outcomes
// ============================================================================

/// Outcome of one pooled external call.
///
/// Replaces exception-style control flow: capacity and transient failures
/// are values the retry manager and AIMD controller consume directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallOutcome {
    /// Call succeeded.
    Success {
        /// Response payload.
        response: Value,
        /// Wall-clock latency in milliseconds.
        latency_ms: u64,
    },
    /// External service signalled saturation (HTTP 429 or 503).
    Capacity {
        /// HTTP status code.
        status: u16,
    },
    /// Transient failure worth retrying.
    Transient {
        /// Failure detail.
        message: String,
    },
    /// Terminal failure; retrying cannot help.
    Terminal {
        /// Failure detail.
        message: String,
    },
}

impl CallOutcome {
    /// Returns `true` for capacity outcomes.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::Capacity {
                ..
            }
        )
    }
}

/// State of an external batch call that may complete asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchCallState {
    /// Batch is still executing remotely.
    Pending {
        /// Remote batch identifier.
        remote_batch_id: String,
        /// Remote status label.
        status: String,
        /// Suggested poll delay in seconds.
        check_after_secs: u64,
    },
    /// Batch completed with output rows.
    Completed {
        /// Output rows in order.
        rows: Vec<RowData>,
    },
    /// Batch failed remotely.
    Failed {
        /// Failure detail.
        message: String,
    },
}
