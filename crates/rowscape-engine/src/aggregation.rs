// crates/rowscape-engine/src/aggregation.rs
// ============================================================================
// Module: Rowscape Aggregation Executor
// Description: Per-node buffering, flush triggers, and batch lifecycle.
// Purpose: Collect tokens at aggregation nodes and flush them as audited batches.
// Dependencies: rowscape-core, serde, serde_json, tracing
// ============================================================================

//! ## Overview
//! Each aggregation node owns a buffer of tokens and a flush trigger. Tokens
//! enter the buffer together with their batch membership; when the trigger
//! fires, the batch-aware transform runs over the buffered rows under a fresh
//! node-state and the batch progresses `draft → executing → completed|failed`.
//! Buffer state snapshots round-trip through the landscape for crash
//! recovery.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rowscape_core::AggregationSettings;
use rowscape_core::BatchId;
use rowscape_core::BatchStatus;
use rowscape_core::Landscape;
use rowscape_core::NodeId;
use rowscape_core::NodeStateStatus;
use rowscape_core::PluginCallError;
use rowscape_core::PluginContext;
use rowscape_core::RunId;
use rowscape_core::StateId;
use rowscape_core::Timestamp;
use rowscape_core::Token;
use rowscape_core::TransformPlugin;
use rowscape_core::TransformResult;
use rowscape_core::TriggerKind;
use rowscape_core::TriggerSettings;
use rowscape_core::hashing::stable_hash;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug_span;

use crate::error::EngineError;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Host-supplied evaluator for `custom` flush triggers.
pub type CustomTrigger = Box<dyn Fn(&[Token]) -> bool + Send>;

/// Time source for `timeout` flush triggers, supplied by the orchestrator.
pub type AggregationClock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Result of one audited batch flush.
#[derive(Debug)]
pub struct FlushExecution {
    /// Transform outcome over the buffered rows.
    pub outcome: Result<TransformResult, PluginCallError>,
    /// Tokens that were buffered when the flush fired, in buffer order.
    pub buffered: Vec<Token>,
    /// Batch the flush produced.
    pub batch_id: BatchId,
    /// Node-state the flush was recorded under.
    pub state_id: StateId,
}

/// Buffer state for one aggregation node.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeBuffer {
    /// Buffered tokens in arrival order.
    buffered: Vec<Token>,
    /// Open draft batch, created on first buffer.
    batch_id: Option<BatchId>,
    /// Buffer time of the oldest token, for timeout triggers.
    oldest_buffered_at: Option<Timestamp>,
}

// ============================================================================
// SECTION: Aggregation Executor
// ============================================================================

/// Buffers tokens per aggregation node and executes audited flushes.
pub struct AggregationExecutor {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
    /// Owning run.
    run_id: RunId,
    /// Resolved settings per aggregation node.
    settings: HashMap<NodeId, AggregationSettings>,
    /// Buffer state per node.
    buffers: HashMap<NodeId, NodeBuffer>,
    /// Host-supplied evaluators for custom triggers.
    custom_triggers: HashMap<NodeId, CustomTrigger>,
    /// Time source for timeout triggers.
    clock: AggregationClock,
    /// Set once the orchestrator signals source exhaustion.
    end_of_source: bool,
}

impl AggregationExecutor {
    /// Creates an aggregation executor with the wall clock as time source.
    #[must_use]
    pub fn new(
        landscape: Arc<dyn Landscape>,
        run_id: RunId,
        settings: HashMap<NodeId, AggregationSettings>,
    ) -> Self {
        Self {
            landscape,
            run_id,
            settings,
            buffers: HashMap::new(),
            custom_triggers: HashMap::new(),
            clock: Arc::new(Timestamp::now),
            end_of_source: false,
        }
    }

    /// Replaces the time source used by timeout triggers.
    pub fn set_clock(&mut self, clock: AggregationClock) {
        self.clock = clock;
    }

    /// Installs the evaluator backing a node's `custom` trigger.
    pub fn set_custom_trigger(&mut self, node_id: NodeId, evaluator: CustomTrigger) {
        self.custom_triggers.insert(node_id, evaluator);
    }

    /// Returns the settings declared for a node, when it aggregates.
    #[must_use]
    pub fn settings(&self, node_id: &NodeId) -> Option<&AggregationSettings> {
        self.settings.get(node_id)
    }

    /// Returns the open batch for a node, when one exists.
    #[must_use]
    pub fn batch_id(&self, node_id: &NodeId) -> Option<BatchId> {
        self.buffers.get(node_id).and_then(|buffer| buffer.batch_id.clone())
    }

    /// Returns the buffered token count for a node.
    #[must_use]
    pub fn buffered_count(&self, node_id: &NodeId) -> usize {
        self.buffers.get(node_id).map_or(0, |buffer| buffer.buffered.len())
    }

    /// Returns the nodes that still hold buffered tokens.
    #[must_use]
    pub fn pending_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.buffered.is_empty())
            .map(|(node_id, _)| node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Marks the source as exhausted, arming end-of-source triggers.
    pub fn signal_end_of_source(&mut self) {
        self.end_of_source = true;
    }

    /// Buffers a token at a node, opening a draft batch on first use and
    /// recording batch membership at the next ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the landscape writes fail.
    pub fn buffer_row(&mut self, node_id: &NodeId, token: Token) -> Result<BatchId, EngineError> {
        let buffer = self.buffers.entry(node_id.clone()).or_default();
        let batch_id = match &buffer.batch_id {
            Some(batch_id) => batch_id.clone(),
            None => {
                let batch = self.landscape.create_batch(&self.run_id, node_id, 0)?;
                buffer.batch_id = Some(batch.batch_id.clone());
                batch.batch_id
            }
        };
        let ordinal = u32::try_from(buffer.buffered.len())
            .map_err(|_| EngineError::InvariantViolation("aggregation buffer overflow".to_string()))?;
        self.landscape.add_batch_member(&batch_id, &token.token_id, ordinal)?;
        if buffer.oldest_buffered_at.is_none() {
            buffer.oldest_buffered_at = Some((self.clock)());
        }
        buffer.buffered.push(token);
        Ok(batch_id)
    }

    /// Returns whether the node's trigger has fired.
    #[must_use]
    pub fn should_flush(&self, node_id: &NodeId) -> bool {
        let Some(settings) = self.settings.get(node_id) else {
            return false;
        };
        let Some(buffer) = self.buffers.get(node_id) else {
            return false;
        };
        if buffer.buffered.is_empty() {
            return false;
        }
        match &settings.trigger {
            TriggerSettings::Count {
                n,
            } => buffer.buffered.len() >= *n,
            TriggerSettings::Timeout {
                secs,
            } => buffer
                .oldest_buffered_at
                .is_some_and(|oldest| oldest.elapsed_secs((self.clock)()) >= *secs),
            TriggerSettings::EndOfSource => self.end_of_source,
            TriggerSettings::Custom => self
                .custom_triggers
                .get(node_id)
                .is_some_and(|evaluator| evaluator(&buffer.buffered)),
        }
    }

    /// Returns the trigger kind that would be recorded for a flush now.
    #[must_use]
    pub fn trigger_kind(&self, node_id: &NodeId) -> TriggerKind {
        if self.end_of_source {
            return TriggerKind::EndOfSource;
        }
        self.settings
            .get(node_id)
            .map_or(TriggerKind::Count, |settings| settings.trigger.kind())
    }

    /// Flushes a node's buffer through its batch-aware transform.
    ///
    /// Takes the buffered tokens, progresses the batch through
    /// `executing → completed|failed`, and records the flush under its own
    /// node-state owned by the most recently buffered token.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the buffer is empty or audit recording
    /// fails; transform failures are returned inside
    /// [`FlushExecution::outcome`].
    pub fn execute_flush(
        &mut self,
        node_id: &NodeId,
        transform: &dyn TransformPlugin,
        ctx: &mut PluginContext,
        step_in_pipeline: u32,
        trigger: TriggerKind,
    ) -> Result<FlushExecution, EngineError> {
        let buffer = self.buffers.entry(node_id.clone()).or_default();
        let buffered = std::mem::take(&mut buffer.buffered);
        let batch_id = buffer.batch_id.take();
        buffer.oldest_buffered_at = None;
        let Some(last) = buffered.last() else {
            return Err(EngineError::InvariantViolation(format!(
                "flush requested with empty buffer at node {node_id}"
            )));
        };
        let Some(batch_id) = batch_id else {
            return Err(EngineError::InvariantViolation(format!(
                "flush requested without an open batch at node {node_id}"
            )));
        };

        self.landscape.update_batch_status(&batch_id, BatchStatus::Executing)?;
        let rows: Vec<_> = buffered.iter().map(|token| token.row_data.clone()).collect();
        let row_maps: Vec<_> = rows.iter().map(rowscape_core::PipelineRow::as_map).collect();
        let input_hash = stable_hash(&row_maps)?;
        let state = self.landscape.begin_node_state(
            &self.run_id,
            &last.token_id,
            node_id,
            step_in_pipeline,
            0,
            &input_hash,
        )?;
        ctx.state_id = Some(state.state_id.clone());
        let span = debug_span!(
            "aggregation_flush",
            node = %node_id,
            rows = rows.len(),
            trigger = trigger.label()
        );
        let result = {
            let _guard = span.enter();
            transform.process_batch(&rows, ctx)
        };
        ctx.state_id = None;

        let trigger_reason = json!({"trigger": trigger.label(), "buffered": buffered.len()});
        let outcome = match result {
            Ok(success @ (TransformResult::Success {
                ..
            }
            | TransformResult::SuccessMulti {
                ..
            })) => {
                let output_hash = flush_output_hash(&success)?;
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Completed,
                    Some(output_hash.as_deref().unwrap_or(&input_hash)),
                )?;
                self.landscape.complete_batch(
                    &batch_id,
                    BatchStatus::Completed,
                    trigger,
                    Some(&trigger_reason),
                    Some(&state.state_id),
                )?;
                Ok(success)
            }
            Ok(error_result @ TransformResult::Error {
                ..
            }) => {
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Failed,
                    None,
                )?;
                self.landscape.complete_batch(
                    &batch_id,
                    BatchStatus::Failed,
                    trigger,
                    Some(&trigger_reason),
                    Some(&state.state_id),
                )?;
                Ok(error_result)
            }
            Err(error) => {
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Failed,
                    None,
                )?;
                self.landscape.complete_batch(
                    &batch_id,
                    BatchStatus::Failed,
                    trigger,
                    Some(&trigger_reason),
                    Some(&state.state_id),
                )?;
                Err(error)
            }
        };

        Ok(FlushExecution {
            outcome,
            buffered,
            batch_id,
            state_id: state.state_id,
        })
    }

    /// Returns a serializable snapshot of a node's buffer state.
    #[must_use]
    pub fn snapshot_state(&self, node_id: &NodeId) -> Option<Value> {
        self.buffers.get(node_id).and_then(|buffer| serde_json::to_value(buffer).ok())
    }

    /// Restores a node's buffer state from a snapshot (crash recovery).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvariantViolation`] when the snapshot does not
    /// parse.
    pub fn restore_state(&mut self, node_id: NodeId, state: &Value) -> Result<(), EngineError> {
        let buffer: NodeBuffer = serde_json::from_value(state.clone()).map_err(|err| {
            EngineError::InvariantViolation(format!("invalid aggregation snapshot: {err}"))
        })?;
        self.buffers.insert(node_id, buffer);
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Computes the output hash for a successful flush result.
fn flush_output_hash(result: &TransformResult) -> Result<Option<String>, EngineError> {
    match result {
        TransformResult::Success {
            row,
        } => Ok(Some(row.data_hash()?.value)),
        TransformResult::SuccessMulti {
            rows,
        } => Ok(Some(stable_hash(rows)?)),
        TransformResult::Error {
            ..
        } => Ok(None),
    }
}
