// crates/rowscape-engine/src/processor.rs
// ============================================================================
// Module: Rowscape Row Processor
// Description: Work-queue DAG runtime carrying one source row to termination.
// Purpose: Drive tokens through transforms, gates, and aggregations with
//          exactly one recorded outcome per token.
// Dependencies: rowscape-core, crate::{aggregation, coalesce, executors,
//               retry, tokens}
// ============================================================================

//! ## Overview
//! The row processor carries one logical source row through the resolved
//! pipeline. Scheduling is single-threaded and cooperative: a FIFO work queue
//! of `(token, start_step)` items, where forks, expansions, and passthrough
//! flushes push child items back onto the queue. Every path that leaves the
//! processor records exactly one terminal outcome for its token, and a hard
//! iteration guard aborts runaway pipelines. Concurrency between rows is the
//! orchestrator's concern; within a row, order is deterministic.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use rowscape_core::AggregationSettings;
use rowscape_core::EdgeId;
use rowscape_core::FailureInfo;
use rowscape_core::GateSettings;
use rowscape_core::Landscape;
use rowscape_core::LandscapeError;
use rowscape_core::NodeId;
use rowscape_core::NodeStateStatus;
use rowscape_core::OutcomeKind;
use rowscape_core::OutputMode;
use rowscape_core::PipelineRow;
use rowscape_core::PipelineStep;
use rowscape_core::PluginContext;
use rowscape_core::RetrySettings;
use rowscape_core::RowId;
use rowscape_core::RowResult;
use rowscape_core::RunId;
use rowscape_core::RunStatus;
use rowscape_core::SourceRow;
use rowscape_core::StepKind;
use rowscape_core::Token;
use rowscape_core::TokenId;
use rowscape_core::TokenOutcome;
use rowscape_core::TransformPlugin;
use rowscape_core::TransformResult;
use rowscape_core::TriggerKind;
use rowscape_core::hashing::short_error_hash;
use serde_json::Value;
use tracing::info_span;

use crate::aggregation::AggregationExecutor;
use crate::aggregation::FlushExecution;
use crate::coalesce::CoalesceExecutor;
use crate::coalesce::CoalesceOutcome;
use crate::error::EngineError;
use crate::executors::GateExecution;
use crate::executors::GateExecutor;
use crate::executors::RouteTarget;
use crate::executors::TransformExecution;
use crate::executors::TransformExecutor;
use crate::retry::MaxRetriesExceeded;
use crate::retry::RetryManager;
use crate::tokens::TokenManager;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Iteration guard for the per-row work queue.
pub const MAX_WORK_QUEUE_ITERATIONS: u32 = 10_000;

// ============================================================================
// SECTION: Wiring
// ============================================================================

/// Resolved orchestrator wiring consumed at processor construction.
#[derive(Default)]
pub struct ProcessorWiring {
    /// Registered edges by (node, label).
    pub edge_map: HashMap<(NodeId, String), EdgeId>,
    /// Route resolution by (node, label).
    pub route_resolution_map: HashMap<(NodeId, String), RouteTarget>,
    /// Config-driven gates, processed after all plugin steps.
    pub config_gates: Vec<GateSettings>,
    /// Node ids backing the config gates, by gate name.
    pub config_gate_id_map: HashMap<String, NodeId>,
    /// Aggregation settings per aggregation node.
    pub aggregation_settings: HashMap<NodeId, AggregationSettings>,
    /// Retry policy for transform execution; absent means single attempts.
    pub retry: Option<RetrySettings>,
    /// Node ids backing coalesce points, by coalesce name.
    pub coalesce_node_ids: HashMap<String, NodeId>,
    /// Coalesce point per fork branch; branches without an entry never
    /// coalesce.
    pub branch_to_coalesce: HashMap<String, String>,
    /// Pipeline position of each coalesce point.
    pub coalesce_step_map: HashMap<String, usize>,
    /// Aggregation buffer snapshots restored on resume.
    pub restored_aggregation_state: HashMap<NodeId, Value>,
    /// Cancellation flag checked between steps and queue items.
    pub cancellation: Option<Arc<AtomicBool>>,
}

/// One queued unit of work.
struct WorkItem {
    /// Token to process.
    token: Token,
    /// Zero-indexed step to resume from.
    start_step: usize,
    /// Step at which the token should coalesce, when it is a fork child.
    coalesce_at_step: Option<usize>,
    /// Coalesce point the token belongs to.
    coalesce_name: Option<String>,
}

// ============================================================================
// SECTION: Row Processor
// ============================================================================

/// Drives one source row through the resolved pipeline.
pub struct RowProcessor {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
    /// Owning run.
    run_id: RunId,
    /// Node producing the rows this processor receives.
    source_node_id: NodeId,
    /// Config-driven gates, processed after all plugin steps.
    config_gates: Vec<GateSettings>,
    /// Node ids backing the config gates.
    config_gate_id_map: HashMap<String, NodeId>,
    /// Coalesce point per fork branch.
    branch_to_coalesce: HashMap<String, String>,
    /// Pipeline position of each coalesce point.
    coalesce_step_map: HashMap<String, usize>,
    /// Node ids backing coalesce points.
    coalesce_node_ids: HashMap<String, NodeId>,
    /// Token lifecycle manager.
    token_manager: TokenManager,
    /// Audited transform executor.
    transform_executor: TransformExecutor,
    /// Audited gate executor.
    gate_executor: GateExecutor,
    /// Aggregation buffering and flush machinery.
    aggregation: AggregationExecutor,
    /// Fork/join buffering, present when any branch coalesces.
    coalesce: Option<CoalesceExecutor>,
    /// Retry manager for transform attempts.
    retry: Option<RetryManager>,
    /// Cancellation flag supplied by the orchestrator.
    cancellation: Option<Arc<AtomicBool>>,
}

impl RowProcessor {
    /// Creates a row processor from orchestrator wiring.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when restored aggregation state does not
    /// parse.
    pub fn new(
        landscape: Arc<dyn Landscape>,
        run_id: RunId,
        source_node_id: NodeId,
        wiring: ProcessorWiring,
    ) -> Result<Self, EngineError> {
        let token_manager = TokenManager::new(Arc::clone(&landscape));
        let transform_executor = TransformExecutor::new(Arc::clone(&landscape));
        let gate_executor = GateExecutor::new(
            Arc::clone(&landscape),
            wiring.edge_map,
            wiring.route_resolution_map,
        );
        let mut aggregation = AggregationExecutor::new(
            Arc::clone(&landscape),
            run_id.clone(),
            wiring.aggregation_settings,
        );
        for (node_id, state) in &wiring.restored_aggregation_state {
            aggregation.restore_state(node_id.clone(), state)?;
        }
        let coalesce = if wiring.branch_to_coalesce.is_empty() {
            None
        } else {
            let mut expected: HashMap<String, usize> = HashMap::new();
            for coalesce_name in wiring.branch_to_coalesce.values() {
                *expected.entry(coalesce_name.clone()).or_insert(0) += 1;
            }
            Some(CoalesceExecutor::new(expected))
        };
        Ok(Self {
            landscape,
            run_id,
            source_node_id,
            config_gates: wiring.config_gates,
            config_gate_id_map: wiring.config_gate_id_map,
            branch_to_coalesce: wiring.branch_to_coalesce,
            coalesce_step_map: wiring.coalesce_step_map,
            coalesce_node_ids: wiring.coalesce_node_ids,
            token_manager,
            transform_executor,
            gate_executor,
            aggregation,
            coalesce,
            retry: wiring.retry.map(RetryManager::new),
            cancellation: wiring.cancellation,
        })
    }

    /// Exposes the token manager so the orchestrator can create tokens for
    /// rows it handles itself.
    #[must_use]
    pub const fn token_manager(&self) -> &TokenManager {
        &self.token_manager
    }

    /// Exposes the aggregation executor for checkpoint snapshots.
    #[must_use]
    pub const fn aggregation(&self) -> &AggregationExecutor {
        &self.aggregation
    }

    /// Exposes the aggregation executor mutably for clock and custom-trigger
    /// installation.
    pub const fn aggregation_mut(&mut self) -> &mut AggregationExecutor {
        &mut self.aggregation
    }

    /// Processes one source row to termination.
    ///
    /// Quarantined source rows are recorded and terminate immediately; valid
    /// rows get an initial token and run the work queue until it drains.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for store failures, invariant violations, the
    /// iteration guard, or cancellation.
    pub fn process_row(
        &mut self,
        row_index: u64,
        source_row: &SourceRow,
        steps: &[PipelineStep],
        ctx: &mut PluginContext,
    ) -> Result<Vec<RowResult>, EngineError> {
        self.check_cancelled()?;
        if source_row.is_quarantined() {
            let token = self.token_manager.create_quarantined_token(
                &self.run_id,
                &self.source_node_id,
                row_index,
                source_row,
            )?;
            return Ok(vec![RowResult::new(token, OutcomeKind::Quarantined)]);
        }
        let token = self.token_manager.create_initial_token(
            &self.run_id,
            &self.source_node_id,
            row_index,
            source_row,
        )?;
        let span = info_span!("row", row_id = %token.row_id, token_id = %token.token_id);
        let _guard = span.enter();
        self.drive(
            VecDeque::from([WorkItem {
                token,
                start_step: 0,
                coalesce_at_step: None,
                coalesce_name: None,
            }]),
            steps,
            ctx,
        )
    }

    /// Processes a row that already exists in the landscape (resume path).
    ///
    /// Creates a fresh token only; no new row record is written.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for store failures, invariant violations, the
    /// iteration guard, or cancellation.
    pub fn process_existing_row(
        &mut self,
        row_id: &RowId,
        row_data: PipelineRow,
        steps: &[PipelineStep],
        ctx: &mut PluginContext,
    ) -> Result<Vec<RowResult>, EngineError> {
        self.check_cancelled()?;
        let token =
            self.token_manager.create_token_for_existing_row(&self.run_id, row_id, row_data)?;
        let span = info_span!("row", row_id = %token.row_id, token_id = %token.token_id);
        let _guard = span.enter();
        self.drive(
            VecDeque::from([WorkItem {
                token,
                start_step: 0,
                coalesce_at_step: None,
                coalesce_name: None,
            }]),
            steps,
            ctx,
        )
    }

    /// Signals source exhaustion and flushes every aggregation buffer that
    /// still holds tokens.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for store failures or invariant violations.
    pub fn finish_source(
        &mut self,
        steps: &[PipelineStep],
        ctx: &mut PluginContext,
    ) -> Result<Vec<RowResult>, EngineError> {
        self.aggregation.signal_end_of_source();
        let mut results = Vec::new();
        for node_id in self.aggregation.pending_nodes() {
            let Some(step_offset) = steps.iter().position(|step| step.node_id == node_id) else {
                return Err(EngineError::InvariantViolation(format!(
                    "aggregation node {node_id} is not a pipeline step"
                )));
            };
            let StepKind::Transform(transform) = &steps[step_offset].kind else {
                return Err(EngineError::InvariantViolation(format!(
                    "aggregation node {node_id} is not a transform step"
                )));
            };
            let Some(settings) = self.aggregation.settings(&node_id).cloned() else {
                continue;
            };
            let flush = self.aggregation.execute_flush(
                &node_id,
                transform.as_ref(),
                ctx,
                audit_step(step_offset + 1),
                TriggerKind::EndOfSource,
            )?;
            let (flush_results, child_items) = self.apply_flush(
                steps,
                step_offset,
                settings.output_mode,
                flush,
                None,
                Vec::new(),
            )?;
            results.extend(flush_results);
            results.extend(self.drive(child_items.into(), steps, ctx)?);
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Work queue
    // ------------------------------------------------------------------

    /// Drains a work queue to completion under the iteration guard.
    fn drive(
        &mut self,
        mut queue: VecDeque<WorkItem>,
        steps: &[PipelineStep],
        ctx: &mut PluginContext,
    ) -> Result<Vec<RowResult>, EngineError> {
        let mut results = Vec::new();
        let mut iterations: u32 = 0;
        while let Some(item) = queue.pop_front() {
            iterations += 1;
            if iterations > MAX_WORK_QUEUE_ITERATIONS {
                return Err(EngineError::IterationCapExceeded {
                    limit: MAX_WORK_QUEUE_ITERATIONS,
                });
            }
            self.check_cancelled()?;
            let (item_results, child_items) = self.process_single_token(item, steps, ctx)?;
            results.extend(item_results);
            queue.extend(child_items);
        }
        Ok(results)
    }

    /// Processes a single token from its start step to a terminal outcome,
    /// a hold, or a handoff to child work items.
    #[allow(
        clippy::too_many_lines,
        reason = "Single linear dispatch flow keeps the ordered audit writes reviewable."
    )]
    fn process_single_token(
        &mut self,
        item: WorkItem,
        steps: &[PipelineStep],
        ctx: &mut PluginContext,
    ) -> Result<(Vec<RowResult>, Vec<WorkItem>), EngineError> {
        let mut current = item.token;
        let mut child_items: Vec<WorkItem> = Vec::new();

        for step_offset in item.start_step..steps.len() {
            self.check_cancelled()?;
            let step = &steps[step_offset];
            let step_number = audit_step(step_offset + 1);
            match &step.kind {
                StepKind::Gate(gate) => {
                    let execution = self.gate_executor.execute_gate(
                        &self.run_id,
                        &step.node_id,
                        gate.as_ref(),
                        &current,
                        ctx,
                        step_number,
                        &self.token_manager,
                    )?;
                    match self.resolve_gate(execution, &mut current, &mut child_items, step_offset + 1)? {
                        Some(results) => return Ok((results, child_items)),
                        None => {}
                    }
                }
                StepKind::Transform(transform) => {
                    if transform.is_batch_aware()
                        && self.aggregation.settings(&step.node_id).is_some()
                    {
                        let node_id = step.node_id.clone();
                        return self.handle_aggregation_node(
                            steps,
                            step_offset,
                            &node_id,
                            transform.as_ref(),
                            current,
                            ctx,
                            child_items,
                        );
                    }
                    let attempt_result = self.execute_with_retry(
                        &step.node_id,
                        transform.as_ref(),
                        &current,
                        ctx,
                        step_number,
                    )?;
                    let execution = match attempt_result {
                        Err(exhausted) => {
                            let result = self.fail_token(
                                current,
                                "max_retries_exceeded",
                                &exhausted.to_string(),
                            )?;
                            return Ok((vec![result], child_items));
                        }
                        Ok(execution) => execution,
                    };
                    match execution.outcome {
                        Err(error) => {
                            let result =
                                self.fail_token(current, "plugin_failure", &error.to_string())?;
                            return Ok((vec![result], child_items));
                        }
                        Ok(TransformResult::Error {
                            reason,
                            ..
                        }) => {
                            let results = self.route_error(
                                current,
                                &reason,
                                execution.error_sink.as_deref(),
                            )?;
                            return Ok((results, child_items));
                        }
                        Ok(TransformResult::SuccessMulti {
                            rows,
                        }) => {
                            if !transform.creates_tokens() {
                                return Err(EngineError::InvariantViolation(format!(
                                    "transform '{}' returned a multi-row result without \
                                     creates_tokens",
                                    transform.header().name
                                )));
                            }
                            let (children, expand_group_id) = self.token_manager.expand_token(
                                &self.run_id,
                                &current,
                                &rows,
                                step_number,
                            )?;
                            let next_step = step_offset + 1;
                            for child in children {
                                child_items.push(WorkItem {
                                    token: child,
                                    start_step: next_step,
                                    coalesce_at_step: item.coalesce_at_step,
                                    coalesce_name: item.coalesce_name.clone(),
                                });
                            }
                            self.record_outcome(&current.token_id, &TokenOutcome::Expanded {
                                expand_group_id,
                            })?;
                            return Ok((
                                vec![RowResult::new(current, OutcomeKind::Expanded)],
                                child_items,
                            ));
                        }
                        Ok(TransformResult::Success {
                            ..
                        }) => {
                            current = execution.token;
                        }
                    }
                }
            }
        }

        // Config-driven gates run after every plugin step; fork children that
        // already passed earlier gates resume at the right gate index.
        let gate_start_index = item.start_step.saturating_sub(steps.len());
        for gate_idx in gate_start_index..self.config_gates.len() {
            self.check_cancelled()?;
            let gate_config = self.config_gates[gate_idx].clone();
            let step_number = audit_step(steps.len() + gate_idx + 1);
            let Some(node_id) = self.config_gate_id_map.get(&gate_config.name).cloned() else {
                return Err(EngineError::InvariantViolation(format!(
                    "config gate '{}' has no registered node",
                    gate_config.name
                )));
            };
            let execution = self.gate_executor.execute_config_gate(
                &self.run_id,
                &node_id,
                &gate_config,
                &current,
                step_number,
                &self.token_manager,
            )?;
            let fork_start = steps.len() + gate_idx + 1;
            match self.resolve_gate(execution, &mut current, &mut child_items, fork_start)? {
                Some(results) => return Ok((results, child_items)),
                None => {}
            }
        }

        // Fork children that reached their coalesce point are absorbed here;
        // the merged token terminates as `coalesced`.
        if self.coalesce.is_some()
            && current.branch_name.is_some()
            && let (Some(coalesce_name), Some(coalesce_at_step)) =
                (item.coalesce_name.as_deref(), item.coalesce_at_step)
        {
            let completed_step = steps.len() + self.config_gates.len();
            if completed_step >= coalesce_at_step {
                let coalesce_step = audit_step(completed_step + 1);
                let outcome = match self.coalesce.as_mut() {
                    Some(executor) => executor.accept(
                        &self.token_manager,
                        &self.run_id,
                        current.clone(),
                        coalesce_name,
                        coalesce_step,
                    )?,
                    None => CoalesceOutcome::Held,
                };
                match outcome {
                    CoalesceOutcome::Held => return Ok((Vec::new(), child_items)),
                    CoalesceOutcome::Merged(merged) => {
                        self.audit_coalesce_node(&merged, coalesce_name, coalesce_step)?;
                        let Some(join_group_id) = merged.join_group_id.clone() else {
                            return Err(EngineError::InvariantViolation(
                                "merged token is missing its join group".to_string(),
                            ));
                        };
                        self.record_outcome(&merged.token_id, &TokenOutcome::Coalesced {
                            join_group_id,
                        })?;
                        return Ok((
                            vec![RowResult::new(merged, OutcomeKind::Coalesced)],
                            child_items,
                        ));
                    }
                }
            }
        }

        self.record_outcome(&current.token_id, &TokenOutcome::Completed)?;
        Ok((vec![RowResult::new(current, OutcomeKind::Completed)], child_items))
    }

    // ------------------------------------------------------------------
    // Gate resolution
    // ------------------------------------------------------------------

    /// Applies a gate execution to the running token.
    ///
    /// Returns `Some(results)` when the token terminated (routed, forked, or
    /// failed) and `None` when it continues to the next step.
    fn resolve_gate(
        &mut self,
        execution: GateExecution,
        current: &mut Token,
        child_items: &mut Vec<WorkItem>,
        fork_start_step: usize,
    ) -> Result<Option<Vec<RowResult>>, EngineError> {
        let outcome = match execution.outcome {
            Err(error) => {
                let token = current.clone();
                let result = self.fail_token(token, "gate_failure", &error.to_string())?;
                return Ok(Some(vec![result]));
            }
            Ok(outcome) => outcome,
        };
        *current = outcome.token;
        if let Some(sink_name) = outcome.sink_name {
            self.record_outcome(&current.token_id, &TokenOutcome::Routed {
                sink_name: sink_name.clone(),
            })?;
            return Ok(Some(vec![RowResult::routed(current.clone(), sink_name)]));
        }
        if let Some(fork_group_id) = outcome.fork_group_id {
            for child in outcome.children {
                let (coalesce_name, coalesce_at_step) =
                    self.coalesce_for_branch(child.branch_name.as_deref());
                child_items.push(WorkItem {
                    token: child,
                    start_step: fork_start_step,
                    coalesce_at_step,
                    coalesce_name,
                });
            }
            self.record_outcome(&current.token_id, &TokenOutcome::Forked {
                fork_group_id,
            })?;
            return Ok(Some(vec![RowResult::new(current.clone(), OutcomeKind::Forked)]));
        }
        Ok(None)
    }

    /// Looks up the coalesce point for a fork branch; branches without an
    /// entry never coalesce.
    fn coalesce_for_branch(&self, branch: Option<&str>) -> (Option<String>, Option<usize>) {
        let Some(branch) = branch else {
            return (None, None);
        };
        match self.branch_to_coalesce.get(branch) {
            None => (None, None),
            Some(coalesce_name) => (
                Some(coalesce_name.clone()),
                self.coalesce_step_map.get(coalesce_name).copied(),
            ),
        }
    }

    /// Records an audit node-state for a completed merge when the coalesce
    /// point is backed by a registered node.
    fn audit_coalesce_node(
        &self,
        merged: &Token,
        coalesce_name: &str,
        coalesce_step: u32,
    ) -> Result<(), EngineError> {
        let Some(node_id) = self.coalesce_node_ids.get(coalesce_name) else {
            return Ok(());
        };
        let data_hash = merged.row_data.data_hash()?.value;
        let state = self.landscape.begin_node_state(
            &self.run_id,
            &merged.token_id,
            node_id,
            coalesce_step,
            0,
            &data_hash,
        )?;
        self.landscape.complete_node_state(
            &state.state_id,
            NodeStateStatus::Completed,
            Some(&data_hash),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Buffers a token at an aggregation node and flushes when the node's
    /// trigger fires.
    #[allow(
        clippy::too_many_arguments,
        reason = "Aggregation dispatch needs the full step context."
    )]
    fn handle_aggregation_node(
        &mut self,
        steps: &[PipelineStep],
        step_offset: usize,
        node_id: &NodeId,
        transform: &dyn TransformPlugin,
        current: Token,
        ctx: &mut PluginContext,
        child_items: Vec<WorkItem>,
    ) -> Result<(Vec<RowResult>, Vec<WorkItem>), EngineError> {
        let Some(settings) = self.aggregation.settings(node_id).cloned() else {
            return Err(EngineError::InvariantViolation(format!(
                "missing aggregation settings for node {node_id}"
            )));
        };
        let batch_id = self.aggregation.buffer_row(node_id, current.clone())?;

        if !self.aggregation.should_flush(node_id) {
            // Buffered is non-terminal in passthrough mode: the token comes
            // back enriched at flush time. Single and transform modes consume
            // the token for good.
            return if settings.output_mode == OutputMode::Passthrough {
                self.record_outcome(&current.token_id, &TokenOutcome::Buffered {
                    batch_id: Some(batch_id),
                })?;
                Ok((vec![RowResult::new(current, OutcomeKind::Buffered)], child_items))
            } else {
                self.record_outcome(&current.token_id, &TokenOutcome::ConsumedInBatch {
                    batch_id: Some(batch_id),
                })?;
                Ok((vec![RowResult::new(current, OutcomeKind::ConsumedInBatch)], child_items))
            };
        }

        let trigger = self.aggregation.trigger_kind(node_id);
        let flush = self.aggregation.execute_flush(
            node_id,
            transform,
            ctx,
            audit_step(step_offset + 1),
            trigger,
        )?;
        self.apply_flush(steps, step_offset, settings.output_mode, flush, Some(current), child_items)
    }

    /// Applies a flush result according to the node's output mode.
    ///
    /// `trigger_token` is the token whose arrival fired the flush; it is
    /// absent for end-of-source flushes, where every buffered token already
    /// carries its buffer-time outcome.
    #[allow(
        clippy::too_many_lines,
        reason = "The three output modes share flush state and audit ordering."
    )]
    fn apply_flush(
        &mut self,
        steps: &[PipelineStep],
        step_offset: usize,
        output_mode: OutputMode,
        flush: FlushExecution,
        trigger_token: Option<Token>,
        mut child_items: Vec<WorkItem>,
    ) -> Result<(Vec<RowResult>, Vec<WorkItem>), EngineError> {
        let FlushExecution {
            outcome,
            buffered,
            batch_id,
            ..
        } = flush;

        let success = match outcome {
            Err(error) => {
                return match trigger_token {
                    Some(token) => {
                        let result =
                            self.fail_token(token, "batch_transform_failed", &error.to_string())?;
                        Ok((vec![result], child_items))
                    }
                    None => Ok((Vec::new(), child_items)),
                };
            }
            Ok(TransformResult::Error {
                reason,
                ..
            }) => {
                return match trigger_token {
                    Some(token) => {
                        let result = self.fail_token(
                            token,
                            "batch_transform_failed",
                            &reason.to_string(),
                        )?;
                        Ok((vec![result], child_items))
                    }
                    None => Ok((Vec::new(), child_items)),
                };
            }
            Ok(success) => success,
        };

        let more_steps = step_offset + 1 < steps.len();
        let next_step = step_offset + 1;
        let step_number = audit_step(step_offset + 1);
        let mut results = Vec::new();

        match output_mode {
            OutputMode::Single => {
                let TransformResult::Success {
                    row,
                } = success
                else {
                    return Err(EngineError::InvariantViolation(
                        "single output mode requires a single aggregated row".to_string(),
                    ));
                };
                let parent = match &trigger_token {
                    Some(token) => token.clone(),
                    None => match buffered.last() {
                        Some(token) => token.clone(),
                        None => {
                            return Err(EngineError::InvariantViolation(
                                "flush produced no buffered tokens".to_string(),
                            ));
                        }
                    },
                };
                if let Some(token) = trigger_token {
                    self.record_outcome(&token.token_id, &TokenOutcome::ConsumedInBatch {
                        batch_id: Some(batch_id),
                    })?;
                    results.push(RowResult::new(token, OutcomeKind::ConsumedInBatch));
                }
                let (children, _) = self.token_manager.expand_token(
                    &self.run_id,
                    &parent,
                    &[row.to_map()],
                    step_number,
                )?;
                let Some(aggregated) = children.into_iter().next() else {
                    return Err(EngineError::InvariantViolation(
                        "aggregated token was not created".to_string(),
                    ));
                };
                self.record_outcome(&aggregated.token_id, &TokenOutcome::Completed)?;
                results.push(RowResult::new(aggregated, OutcomeKind::Completed));
            }
            OutputMode::Passthrough => {
                let TransformResult::SuccessMulti {
                    rows,
                } = success
                else {
                    return Err(EngineError::InvariantViolation(
                        "passthrough output mode requires a multi-row result".to_string(),
                    ));
                };
                if rows.len() != buffered.len() {
                    return Err(EngineError::InvariantViolation(format!(
                        "passthrough returned {} rows for {} buffered tokens",
                        rows.len(),
                        buffered.len()
                    )));
                }
                for (token, data) in buffered.into_iter().zip(rows) {
                    let updated = token.with_row_data(token.row_data.with_data(data));
                    if more_steps {
                        child_items.push(WorkItem {
                            token: updated,
                            start_step: next_step,
                            coalesce_at_step: None,
                            coalesce_name: None,
                        });
                    } else {
                        self.record_outcome(&updated.token_id, &TokenOutcome::Completed)?;
                        results.push(RowResult::new(updated, OutcomeKind::Completed));
                    }
                }
            }
            OutputMode::Transform => {
                let rows = match success {
                    TransformResult::SuccessMulti {
                        rows,
                    } => rows,
                    TransformResult::Success {
                        row,
                    } => vec![row.to_map()],
                    TransformResult::Error {
                        ..
                    } => {
                        return Err(EngineError::InvariantViolation(
                            "flush error escaped the failure path".to_string(),
                        ));
                    }
                };
                let parent = match &trigger_token {
                    Some(token) => token.clone(),
                    None => match buffered.last() {
                        Some(token) => token.clone(),
                        None => {
                            return Err(EngineError::InvariantViolation(
                                "flush produced no buffered tokens".to_string(),
                            ));
                        }
                    },
                };
                let (children, _) = self.token_manager.expand_token(
                    &self.run_id,
                    &parent,
                    &rows,
                    step_number,
                )?;
                if let Some(token) = trigger_token {
                    self.record_outcome(&token.token_id, &TokenOutcome::ConsumedInBatch {
                        batch_id: Some(batch_id),
                    })?;
                    results.push(RowResult::new(token, OutcomeKind::ConsumedInBatch));
                }
                for child in children {
                    if more_steps {
                        child_items.push(WorkItem {
                            token: child,
                            start_step: next_step,
                            coalesce_at_step: None,
                            coalesce_name: None,
                        });
                    } else {
                        self.record_outcome(&child.token_id, &TokenOutcome::Completed)?;
                        results.push(RowResult::new(child, OutcomeKind::Completed));
                    }
                }
            }
        }

        Ok((results, child_items))
    }

    // ------------------------------------------------------------------
    // Transform retry
    // ------------------------------------------------------------------

    /// Runs a transform attempt loop: retryable plugin failures re-attempt
    /// under the retry policy, everything else passes through.
    fn execute_with_retry(
        &self,
        node_id: &NodeId,
        transform: &dyn TransformPlugin,
        token: &Token,
        ctx: &mut PluginContext,
        step_number: u32,
    ) -> Result<Result<TransformExecution, MaxRetriesExceeded>, EngineError> {
        let Some(retry) = &self.retry else {
            let execution = self.transform_executor.execute_transform(
                &self.run_id,
                node_id,
                transform,
                token,
                ctx,
                step_number,
                0,
            )?;
            return Ok(Ok(execution));
        };

        let mut engine_error: Option<EngineError> = None;
        let attempt_result = retry.execute_with_retry(|attempt| {
            match self.transform_executor.execute_transform(
                &self.run_id,
                node_id,
                transform,
                token,
                ctx,
                step_number,
                attempt,
            ) {
                Err(error) => {
                    engine_error = Some(error);
                    Err(rowscape_core::PluginCallError::Fatal {
                        message: "audit recording failed".to_string(),
                    })
                }
                Ok(execution) => {
                    if let Err(plugin_error) = &execution.outcome
                        && plugin_error.is_retryable()
                    {
                        Err(plugin_error.clone())
                    } else {
                        Ok(execution)
                    }
                }
            }
        });
        if let Some(error) = engine_error {
            return Err(error);
        }
        Ok(attempt_result)
    }

    // ------------------------------------------------------------------
    // Outcome recording
    // ------------------------------------------------------------------

    /// Records a terminal outcome for a token.
    fn record_outcome(
        &self,
        token_id: &TokenId,
        outcome: &TokenOutcome,
    ) -> Result<(), EngineError> {
        self.landscape.record_token_outcome(&self.run_id, token_id, outcome)?;
        Ok(())
    }

    /// Records a `failed` outcome and builds the matching row result.
    fn fail_token(
        &self,
        token: Token,
        error_kind: &str,
        detail: &str,
    ) -> Result<RowResult, EngineError> {
        self.record_outcome(&token.token_id, &TokenOutcome::Failed {
            error_hash: short_error_hash(detail),
        })?;
        Ok(RowResult::failed(token, FailureInfo::new(error_kind, detail)))
    }

    /// Routes a processing error to the configured error sink, or
    /// quarantines the token when the sink is discard.
    fn route_error(
        &self,
        token: Token,
        reason: &Value,
        error_sink: Option<&str>,
    ) -> Result<Vec<RowResult>, EngineError> {
        let detail = reason.to_string();
        match error_sink {
            None | Some("discard") => {
                self.record_outcome(&token.token_id, &TokenOutcome::Quarantined {
                    error_hash: Some(short_error_hash(&detail)),
                })?;
                Ok(vec![RowResult::new(token, OutcomeKind::Quarantined)])
            }
            Some(sink) => {
                let sink_name = sink.to_string();
                self.record_outcome(&token.token_id, &TokenOutcome::Routed {
                    sink_name: sink_name.clone(),
                })?;
                Ok(vec![RowResult::routed(token, sink_name)])
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Checks the cancellation flag; on cancel the run is finalised as
    /// aborted before the processor unwinds.
    fn check_cancelled(&self) -> Result<(), EngineError> {
        if let Some(flag) = &self.cancellation
            && flag.load(Ordering::Relaxed)
        {
            match self.landscape.complete_run(&self.run_id, RunStatus::Aborted) {
                Ok(_)
                | Err(LandscapeError::Conflict(_)) => {}
                Err(error) => return Err(error.into()),
            }
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts a zero-based position into the 1-based audit step number.
fn audit_step(position: usize) -> u32 {
    u32::try_from(position).unwrap_or(u32::MAX)
}
