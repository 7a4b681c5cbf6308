// crates/rowscape-engine/src/executors.rs
// ============================================================================
// Module: Rowscape Step Executors
// Description: Audited execution of transform and gate steps.
// Purpose: Wrap each plugin call in a node-state and routing-event record.
// Dependencies: rowscape-core, serde_json, tracing
// ============================================================================

//! ## Overview
//! Executors are the audit shims between the row processor and plugins. Every
//! plugin call opens a node-state with the input hash, runs the plugin with
//! the state id exposed on the context, and completes the state with the
//! output hash and terminal status. Gate executors additionally resolve
//! routing labels through the orchestrator-supplied edge and route maps and
//! record routing events against the deciding state.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rowscape_core::EdgeId;
use rowscape_core::GateAction;
use rowscape_core::GatePlugin;
use rowscape_core::GateRule;
use rowscape_core::GateSettings;
use rowscape_core::GroupId;
use rowscape_core::Landscape;
use rowscape_core::NodeId;
use rowscape_core::NodeStateStatus;
use rowscape_core::PluginCallError;
use rowscape_core::PluginContext;
use rowscape_core::RoutingDecision;
use rowscape_core::RoutingMode;
use rowscape_core::RunId;
use rowscape_core::StateId;
use rowscape_core::Token;
use rowscape_core::TransformPlugin;
use rowscape_core::TransformResult;
use rowscape_core::hashing::stable_hash;
use serde_json::json;
use tracing::debug_span;

use crate::error::EngineError;
use crate::tokens::TokenManager;

// ============================================================================
// SECTION: Route Targets
// ============================================================================

/// Resolution of a routing label at one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// The label continues to the next step.
    Continue,
    /// The label terminates at the named sink.
    Sink(String),
}

// ============================================================================
// SECTION: Transform Execution
// ============================================================================

/// Result of one audited transform attempt.
#[derive(Debug)]
pub struct TransformExecution {
    /// Plugin outcome: a processing result or a machinery failure.
    pub outcome: Result<TransformResult, PluginCallError>,
    /// Token after the attempt; updated on single-row success.
    pub token: Token,
    /// Error sink configured on the transform; `None` means discard.
    pub error_sink: Option<String>,
    /// Node-state the attempt was recorded under.
    pub state_id: StateId,
}

/// Audited executor for transform steps.
pub struct TransformExecutor {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
}

impl TransformExecutor {
    /// Creates a transform executor.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self {
            landscape,
        }
    }

    /// Runs one transform attempt under a fresh node-state.
    ///
    /// Retries are the caller's concern; each attempt is recorded as its own
    /// node-state row and never overwrites a prior attempt.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when audit recording fails; plugin failures
    /// are returned inside [`TransformExecution::outcome`].
    pub fn execute_transform(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        transform: &dyn TransformPlugin,
        token: &Token,
        ctx: &mut PluginContext,
        step_in_pipeline: u32,
        attempt: u32,
    ) -> Result<TransformExecution, EngineError> {
        let input_hash = token.row_data.data_hash()?.value;
        let state = self.landscape.begin_node_state(
            run_id,
            &token.token_id,
            node_id,
            step_in_pipeline,
            attempt,
            &input_hash,
        )?;
        ctx.state_id = Some(state.state_id.clone());
        let span = debug_span!(
            "transform",
            plugin = %transform.header().name,
            step = step_in_pipeline,
            attempt
        );
        let result = {
            let _guard = span.enter();
            transform.process(&token.row_data, ctx)
        };
        ctx.state_id = None;
        let error_sink = transform.error_sink().map(str::to_string);

        match result {
            Ok(TransformResult::Success {
                row,
            }) => {
                let output_hash = row.data_hash()?.value;
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Completed,
                    Some(&output_hash),
                )?;
                let updated = token.with_row_data(row.clone());
                Ok(TransformExecution {
                    outcome: Ok(TransformResult::Success {
                        row,
                    }),
                    token: updated,
                    error_sink,
                    state_id: state.state_id,
                })
            }
            Ok(TransformResult::SuccessMulti {
                rows,
            }) => {
                let output_hash = stable_hash(&rows)?;
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Completed,
                    Some(&output_hash),
                )?;
                Ok(TransformExecution {
                    outcome: Ok(TransformResult::SuccessMulti {
                        rows,
                    }),
                    token: token.clone(),
                    error_sink,
                    state_id: state.state_id,
                })
            }
            Ok(error_result @ TransformResult::Error {
                ..
            }) => {
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Failed,
                    None,
                )?;
                Ok(TransformExecution {
                    outcome: Ok(error_result),
                    token: token.clone(),
                    error_sink,
                    state_id: state.state_id,
                })
            }
            Err(error) => {
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Failed,
                    None,
                )?;
                Ok(TransformExecution {
                    outcome: Err(error),
                    token: token.clone(),
                    error_sink,
                    state_id: state.state_id,
                })
            }
        }
    }
}

// ============================================================================
// SECTION: Gate Execution
// ============================================================================

/// Applied routing decision for one gate step.
#[derive(Debug)]
pub struct GateOutcome {
    /// Decision returned by the gate.
    pub decision: RoutingDecision,
    /// Token after evaluation (gates never change row data).
    pub token: Token,
    /// Destination sink when the token routed terminally.
    pub sink_name: Option<String>,
    /// Fork children when the decision forked.
    pub children: Vec<Token>,
    /// Fork group shared by the children.
    pub fork_group_id: Option<GroupId>,
}

/// Result of one audited gate evaluation.
#[derive(Debug)]
pub struct GateExecution {
    /// Gate outcome or the plugin failure that prevented it.
    pub outcome: Result<GateOutcome, PluginCallError>,
    /// Node-state the evaluation was recorded under.
    pub state_id: StateId,
}

/// Audited executor for gate steps (plugin and config-driven).
pub struct GateExecutor {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
    /// Registered edges by (node, label).
    edge_map: HashMap<(NodeId, String), EdgeId>,
    /// Route resolution by (node, label).
    route_map: HashMap<(NodeId, String), RouteTarget>,
}

impl GateExecutor {
    /// Creates a gate executor with the orchestrator-supplied routing maps.
    #[must_use]
    pub fn new(
        landscape: Arc<dyn Landscape>,
        edge_map: HashMap<(NodeId, String), EdgeId>,
        route_map: HashMap<(NodeId, String), RouteTarget>,
    ) -> Self {
        Self {
            landscape,
            edge_map,
            route_map,
        }
    }

    /// Runs one gate plugin evaluation under a fresh node-state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when audit recording fails; plugin failures
    /// are returned inside [`GateExecution::outcome`].
    pub fn execute_gate(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        gate: &dyn GatePlugin,
        token: &Token,
        ctx: &mut PluginContext,
        step_in_pipeline: u32,
        token_manager: &TokenManager,
    ) -> Result<GateExecution, EngineError> {
        let input_hash = token.row_data.data_hash()?.value;
        let state = self.landscape.begin_node_state(
            run_id,
            &token.token_id,
            node_id,
            step_in_pipeline,
            0,
            &input_hash,
        )?;
        ctx.state_id = Some(state.state_id.clone());
        let span = debug_span!("gate", plugin = %gate.header().name, step = step_in_pipeline);
        let decision = {
            let _guard = span.enter();
            gate.evaluate(token, ctx)
        };
        ctx.state_id = None;

        match decision {
            Ok(decision) => {
                let outcome = self.apply_decision(
                    run_id,
                    node_id,
                    decision,
                    token,
                    step_in_pipeline,
                    token_manager,
                    &state.state_id,
                    &input_hash,
                )?;
                Ok(GateExecution {
                    outcome: Ok(outcome),
                    state_id: state.state_id,
                })
            }
            Err(error) => {
                self.landscape.complete_node_state(
                    &state.state_id,
                    NodeStateStatus::Failed,
                    None,
                )?;
                Ok(GateExecution {
                    outcome: Err(error),
                    state_id: state.state_id,
                })
            }
        }
    }

    /// Runs one config-driven gate under a fresh node-state.
    ///
    /// Config gates evaluate a declarative rule over the token's row data;
    /// the routing semantics are identical to plugin gates.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when audit recording fails.
    pub fn execute_config_gate(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        settings: &GateSettings,
        token: &Token,
        step_in_pipeline: u32,
        token_manager: &TokenManager,
    ) -> Result<GateExecution, EngineError> {
        let input_hash = token.row_data.data_hash()?.value;
        let state = self.landscape.begin_node_state(
            run_id,
            &token.token_id,
            node_id,
            step_in_pipeline,
            0,
            &input_hash,
        )?;
        let decision = evaluate_gate_rule(&settings.rule, token);
        let outcome = self.apply_decision(
            run_id,
            node_id,
            decision,
            token,
            step_in_pipeline,
            token_manager,
            &state.state_id,
            &input_hash,
        )?;
        Ok(GateExecution {
            outcome: Ok(outcome),
            state_id: state.state_id,
        })
    }

    /// Applies a routing decision: records routing events, resolves sinks,
    /// forks children, and completes the node-state.
    #[allow(clippy::too_many_arguments, reason = "Decision application spans the full audit context.")]
    fn apply_decision(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        decision: RoutingDecision,
        token: &Token,
        step_in_pipeline: u32,
        token_manager: &TokenManager,
        state_id: &StateId,
        input_hash: &str,
    ) -> Result<GateOutcome, EngineError> {
        match decision {
            RoutingDecision::Continue => {
                self.record_edge_event(state_id, node_id, "continue", RoutingMode::Move)?;
                self.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    Some(input_hash),
                )?;
                Ok(GateOutcome {
                    decision: RoutingDecision::Continue,
                    token: token.clone(),
                    sink_name: None,
                    children: Vec::new(),
                    fork_group_id: None,
                })
            }
            RoutingDecision::RouteTo {
                sink,
            } => {
                self.record_edge_event(state_id, node_id, &sink, RoutingMode::Move)?;
                self.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    Some(input_hash),
                )?;
                // Missing route-map entries resolve to the label itself.
                let resolved = self.route_map.get(&(node_id.clone(), sink.clone()));
                let sink_name = match resolved {
                    Some(RouteTarget::Continue) => None,
                    Some(RouteTarget::Sink(name)) => Some(name.clone()),
                    None => Some(sink.clone()),
                };
                Ok(GateOutcome {
                    decision: RoutingDecision::RouteTo {
                        sink,
                    },
                    token: token.clone(),
                    sink_name,
                    children: Vec::new(),
                    fork_group_id: None,
                })
            }
            RoutingDecision::ForkToPaths {
                branches,
            } => {
                let (children, fork_group_id) =
                    token_manager.fork_token(run_id, token, &branches, step_in_pipeline, None)?;
                for branch in &branches {
                    self.record_edge_event(state_id, node_id, branch, RoutingMode::Copy)?;
                }
                self.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    Some(input_hash),
                )?;
                Ok(GateOutcome {
                    decision: RoutingDecision::ForkToPaths {
                        branches,
                    },
                    token: token.clone(),
                    sink_name: None,
                    children,
                    fork_group_id: Some(fork_group_id),
                })
            }
        }
    }

    /// Records a routing event when an edge is registered for the label.
    fn record_edge_event(
        &self,
        state_id: &StateId,
        node_id: &NodeId,
        label: &str,
        mode: RoutingMode,
    ) -> Result<(), EngineError> {
        if let Some(edge_id) = self.edge_map.get(&(node_id.clone(), label.to_string())) {
            self.landscape.record_routing_event(
                state_id,
                edge_id,
                mode,
                &json!({"label": label}),
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Config Gate Rules
// ============================================================================

/// Evaluates a declarative gate rule into a routing decision.
fn evaluate_gate_rule(rule: &GateRule, token: &Token) -> RoutingDecision {
    match rule {
        GateRule::Always {
            action,
        } => action.clone().into(),
        GateRule::FieldEquals {
            field,
            value,
            when_true,
            when_false,
        } => {
            let matched = token.row_data.get(field) == Some(value);
            let action: &GateAction = if matched { when_true } else { when_false };
            action.clone().into()
        }
    }
}
