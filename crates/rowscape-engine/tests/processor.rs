// crates/rowscape-engine/tests/processor.rs
// ============================================================================
// Module: Row Processor Tests
// Description: End-to-end scenarios for the work-queue DAG runtime.
// Purpose: Validate linear flow, fork/coalesce, expansion, aggregation
//          modes, retries, error routing, and the iteration guard.
// ============================================================================

//! ## Overview
//! These scenarios drive the row processor against an in-memory landscape
//! with small inline plugins. Each scenario asserts both the returned row
//! results and the audit record the landscape holds afterwards: outcomes,
//! node-states with attempt numbers, batches with ordered members, and token
//! parentage.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use rowscape_core::DeterminismKind;
use rowscape_core::GatePlugin;
use rowscape_core::Landscape;
use rowscape_core::NodeId;
use rowscape_core::NodeRegistration;
use rowscape_core::NodeStateStatus;
use rowscape_core::NodeType;
use rowscape_core::OutcomeKind;
use rowscape_core::OutputMode;
use rowscape_core::Page;
use rowscape_core::PipelineRow;
use rowscape_core::PipelineStep;
use rowscape_core::PluginCallError;
use rowscape_core::PluginContext;
use rowscape_core::PluginHeader;
use rowscape_core::RetrySettings;
use rowscape_core::RoutingDecision;
use rowscape_core::RowData;
use rowscape_core::RunRecord;
use rowscape_core::SchemaConfig;
use rowscape_core::SourceRow;
use rowscape_core::Token;
use rowscape_core::TransformPlugin;
use rowscape_core::TransformResult;
use rowscape_core::TriggerSettings;
use rowscape_core::AggregationSettings;
use rowscape_core::BatchStatus;
use rowscape_core::TriggerKind;
use rowscape_engine::EngineError;
use rowscape_engine::ProcessorWiring;
use rowscape_engine::RowProcessor;
use rowscape_store_sqlite::SqliteLandscape;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Inline Plugins
// ============================================================================

/// Transform appending a constant field to every row.
struct AppendTransform {
    header: PluginHeader,
    field: String,
    value: Value,
}

impl AppendTransform {
    fn new(field: &str, value: Value) -> Self {
        Self {
            header: PluginHeader::new("append", "1.0", DeterminismKind::Deterministic),
            field: field.to_string(),
            value,
        }
    }
}

impl TransformPlugin for AppendTransform {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn process(
        &self,
        row: &PipelineRow,
        _ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        Ok(TransformResult::success(row.with_value(&self.field, self.value.clone())))
    }
}

/// Transform expanding the `xs` array field into one row per element.
struct SplitTransform {
    header: PluginHeader,
}

impl SplitTransform {
    fn new() -> Self {
        Self {
            header: PluginHeader::new("split", "1.0", DeterminismKind::Deterministic),
        }
    }
}

impl TransformPlugin for SplitTransform {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn creates_tokens(&self) -> bool {
        true
    }

    fn process(
        &self,
        row: &PipelineRow,
        _ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        let Some(Value::Array(values)) = row.get("xs") else {
            return Ok(TransformResult::error(json!({"reason": "missing xs"})));
        };
        let rows: Vec<RowData> = values
            .iter()
            .map(|value| {
                let mut data = RowData::new();
                data.insert("x".to_string(), value.clone());
                data
            })
            .collect();
        Ok(TransformResult::success_multi(rows))
    }
}

/// Transform failing with a capacity error a fixed number of times.
struct FlakyTransform {
    header: PluginHeader,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyTransform {
    fn new(failures: u32) -> Self {
        Self {
            header: PluginHeader::new("flaky", "1.0", DeterminismKind::ExternalCall),
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

impl TransformPlugin for FlakyTransform {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn process(
        &self,
        row: &PipelineRow,
        _ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(PluginCallError::Capacity {
                status: 429,
            });
        }
        Ok(TransformResult::success(row.with_value("attempts", json!(call + 1))))
    }
}

/// Transform returning a processing error for every row.
struct RejectTransform {
    header: PluginHeader,
    error_sink: Option<String>,
}

impl RejectTransform {
    fn new(error_sink: Option<&str>) -> Self {
        Self {
            header: PluginHeader::new("reject", "1.0", DeterminismKind::Deterministic),
            error_sink: error_sink.map(str::to_string),
        }
    }
}

impl TransformPlugin for RejectTransform {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn error_sink(&self) -> Option<&str> {
        self.error_sink.as_deref()
    }

    fn process(
        &self,
        _row: &PipelineRow,
        _ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        Ok(TransformResult::error(json!({"reason": "rejected"})))
    }
}

/// Batch-aware transform summing the `v` field into one aggregated row.
struct SumBatchTransform {
    header: PluginHeader,
}

impl SumBatchTransform {
    fn new() -> Self {
        Self {
            header: PluginHeader::new("sum", "1.0", DeterminismKind::Deterministic),
        }
    }
}

impl TransformPlugin for SumBatchTransform {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn process(
        &self,
        _row: &PipelineRow,
        _ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        Err(PluginCallError::Fatal {
            message: "sum transform only accepts batches".to_string(),
        })
    }

    fn process_batch(
        &self,
        rows: &[PipelineRow],
        _ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        let total: i64 =
            rows.iter().filter_map(|row| row.get("v")).filter_map(Value::as_i64).sum();
        let mut data = RowData::new();
        data.insert("total".to_string(), json!(total));
        data.insert("count".to_string(), json!(rows.len()));
        Ok(TransformResult::success(PipelineRow::observed(data)))
    }
}

/// Gate forking every token into fixed branches.
struct ForkGate {
    header: PluginHeader,
    branches: Vec<String>,
}

impl ForkGate {
    fn new(branches: &[&str]) -> Self {
        Self {
            header: PluginHeader::new("fork", "1.0", DeterminismKind::Deterministic),
            branches: branches.iter().map(|branch| (*branch).to_string()).collect(),
        }
    }
}

impl GatePlugin for ForkGate {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn evaluate(
        &self,
        _token: &Token,
        _ctx: &mut PluginContext,
    ) -> Result<RoutingDecision, PluginCallError> {
        Ok(RoutingDecision::ForkToPaths {
            branches: self.branches.clone(),
        })
    }
}

/// Gate routing every token to a fixed sink.
struct RouteGate {
    header: PluginHeader,
    sink: String,
}

impl RouteGate {
    fn new(sink: &str) -> Self {
        Self {
            header: PluginHeader::new("route", "1.0", DeterminismKind::Deterministic),
            sink: sink.to_string(),
        }
    }
}

impl GatePlugin for RouteGate {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn evaluate(
        &self,
        _token: &Token,
        _ctx: &mut PluginContext,
    ) -> Result<RoutingDecision, PluginCallError> {
        Ok(RoutingDecision::RouteTo {
            sink: self.sink.clone(),
        })
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn setup() -> (Arc<SqliteLandscape>, RunRecord, NodeId) {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store init"));
    let run = landscape.begin_run(&json!({}), "v1").expect("begin run");
    let source = landscape
        .register_node(NodeRegistration {
            run_id: run.run_id.clone(),
            node_id: Some(NodeId::new("source")),
            plugin_name: "source".to_string(),
            plugin_version: "1.0".to_string(),
            node_type: NodeType::Source,
            config: json!({}),
            schema: SchemaConfig::dynamic(),
            determinism: DeterminismKind::Deterministic,
            sequence_in_pipeline: 0,
        })
        .expect("register source");
    (landscape, run, source.node_id)
}

fn register_node(
    landscape: &SqliteLandscape,
    run: &RunRecord,
    node_id: &str,
    node_type: NodeType,
    sequence: u32,
) -> NodeId {
    landscape
        .register_node(NodeRegistration {
            run_id: run.run_id.clone(),
            node_id: Some(NodeId::new(node_id)),
            plugin_name: node_id.to_string(),
            plugin_version: "1.0".to_string(),
            node_type,
            config: json!({}),
            schema: SchemaConfig::dynamic(),
            determinism: DeterminismKind::Deterministic,
            sequence_in_pipeline: sequence,
        })
        .expect("register node")
        .node_id
}

fn source_row(value: Value) -> SourceRow {
    let Value::Object(data) = value else {
        panic!("test rows must be json objects");
    };
    SourceRow::valid(PipelineRow::observed(data))
}

fn processor(
    landscape: &Arc<SqliteLandscape>,
    run: &RunRecord,
    source: &NodeId,
    wiring: ProcessorWiring,
) -> RowProcessor {
    RowProcessor::new(
        landscape.clone() as Arc<dyn Landscape>,
        run.run_id.clone(),
        source.clone(),
        wiring,
    )
    .expect("processor")
}

fn ctx(run: &RunRecord) -> PluginContext {
    PluginContext::new(run.run_id.clone(), NodeId::new("pipeline"))
}

// ============================================================================
// SECTION: Linear Pipelines
// ============================================================================

#[test]
fn linear_pipeline_completes_one_row() {
    let (landscape, run, source) = setup();
    let transform_node = register_node(&landscape, &run, "append", NodeType::Transform, 1);
    let steps = vec![PipelineStep::transform(
        transform_node.clone(),
        Box::new(AppendTransform::new("seen", json!(true))),
    )];
    let mut processor = processor(&landscape, &run, &source, ProcessorWiring::default());
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"id": 1, "text": "hi"})), &steps, &mut ctx)
        .expect("process row");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, OutcomeKind::Completed);
    assert_eq!(
        results[0].final_data.to_map(),
        {
            let Value::Object(expected) = json!({"id": 1, "text": "hi", "seen": true}) else {
                panic!("object expected");
            };
            expected
        }
    );

    assert_eq!(landscape.get_rows(&run.run_id, Page::all()).expect("rows").len(), 1);
    let tokens = landscape.get_tokens(&run.run_id, Page::all()).expect("tokens");
    assert_eq!(tokens.len(), 1);
    let states = landscape.get_node_states_for_token(&tokens[0].token_id).expect("states");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, NodeStateStatus::Completed);
    assert_eq!(states[0].node_id, transform_node);
    let outcome = landscape
        .get_token_outcome(&tokens[0].token_id)
        .expect("outcome read")
        .expect("recorded");
    assert_eq!(outcome.outcome, OutcomeKind::Completed);
}

#[test]
fn gate_routes_token_to_sink() {
    let (landscape, run, source) = setup();
    let gate_node = register_node(&landscape, &run, "router", NodeType::Gate, 1);
    let steps =
        vec![PipelineStep::gate(gate_node, Box::new(RouteGate::new("rejected_sink")))];
    let mut processor = processor(&landscape, &run, &source, ProcessorWiring::default());
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"id": 1})), &steps, &mut ctx)
        .expect("process row");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, OutcomeKind::Routed);
    assert_eq!(results[0].sink_name.as_deref(), Some("rejected_sink"));

    let outcomes = landscape.get_token_outcomes(&run.run_id).expect("outcomes");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].outcome, OutcomeKind::Routed);
    assert_eq!(outcomes[0].sink_name.as_deref(), Some("rejected_sink"));
}

// ============================================================================
// SECTION: Fork and Coalesce
// ============================================================================

#[test]
fn fork_and_coalesce_produces_one_merged_result() {
    let (landscape, run, source) = setup();
    let gate_node = register_node(&landscape, &run, "splitter", NodeType::Gate, 1);
    let steps =
        vec![PipelineStep::gate(gate_node, Box::new(ForkGate::new(&["stats", "class"])))];

    let wiring = ProcessorWiring {
        branch_to_coalesce: HashMap::from([
            ("stats".to_string(), "merge".to_string()),
            ("class".to_string(), "merge".to_string()),
        ]),
        coalesce_step_map: HashMap::from([("merge".to_string(), 1)]),
        ..ProcessorWiring::default()
    };
    let mut processor = processor(&landscape, &run, &source, wiring);
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"value": 42})), &steps, &mut ctx)
        .expect("process row");

    let outcomes: Vec<OutcomeKind> = results.iter().map(|result| result.outcome).collect();
    assert_eq!(outcomes, vec![OutcomeKind::Forked, OutcomeKind::Coalesced]);
    assert_eq!(results[1].final_data.get("value"), Some(&json!(42)));

    // Parent forked, two branch children coalesced, merged token coalesced.
    let tokens = landscape.get_tokens(&run.run_id, Page::all()).expect("tokens");
    assert_eq!(tokens.len(), 4);
    let recorded = landscape.get_token_outcomes(&run.run_id).expect("outcomes");
    assert_eq!(recorded.len(), 4);
    let coalesced = recorded
        .iter()
        .filter(|outcome| outcome.outcome == OutcomeKind::Coalesced)
        .count();
    assert_eq!(coalesced, 3);
}

// ============================================================================
// SECTION: Expansion
// ============================================================================

#[test]
fn multi_row_result_expands_into_child_tokens() {
    let (landscape, run, source) = setup();
    let split_node = register_node(&landscape, &run, "split", NodeType::Transform, 1);
    let steps = vec![PipelineStep::transform(split_node, Box::new(SplitTransform::new()))];
    let mut processor = processor(&landscape, &run, &source, ProcessorWiring::default());
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"xs": [1, 2, 3]})), &steps, &mut ctx)
        .expect("process row");

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].outcome, OutcomeKind::Expanded);
    for (index, result) in results.iter().skip(1).enumerate() {
        assert_eq!(result.outcome, OutcomeKind::Completed);
        assert_eq!(result.final_data.get("x"), Some(&json!(index + 1)));
    }

    let parent_token_id = results[0].token.token_id.clone();
    let parent_outcome = landscape
        .get_token_outcome(&parent_token_id)
        .expect("outcome read")
        .expect("recorded");
    assert_eq!(parent_outcome.outcome, OutcomeKind::Expanded);
    assert!(parent_outcome.expand_group_id.is_some());

    let parents = landscape.get_token_parents(&run.run_id).expect("parents");
    assert_eq!(parents.len(), 3);
    assert!(parents.iter().all(|link| link.parent_token_id == parent_token_id));
}

// ============================================================================
// SECTION: Aggregation
// ============================================================================

#[test]
fn count_trigger_flushes_single_mode_on_the_nth_row() {
    let (landscape, run, source) = setup();
    let agg_node = register_node(&landscape, &run, "sum", NodeType::Aggregation, 1);
    let steps = vec![PipelineStep::transform(
        agg_node.clone(),
        Box::new(SumBatchTransform::new()),
    )];
    let wiring = ProcessorWiring {
        aggregation_settings: HashMap::from([(agg_node.clone(), AggregationSettings {
            trigger: TriggerSettings::Count {
                n: 3,
            },
            output_mode: OutputMode::Single,
        })]),
        ..ProcessorWiring::default()
    };
    let mut processor = processor(&landscape, &run, &source, wiring);
    let mut ctx = ctx(&run);

    let first = processor
        .process_row(0, &source_row(json!({"v": 1})), &steps, &mut ctx)
        .expect("row 0");
    let second = processor
        .process_row(1, &source_row(json!({"v": 2})), &steps, &mut ctx)
        .expect("row 1");
    assert_eq!(first[0].outcome, OutcomeKind::ConsumedInBatch);
    assert_eq!(second[0].outcome, OutcomeKind::ConsumedInBatch);

    let third = processor
        .process_row(2, &source_row(json!({"v": 3})), &steps, &mut ctx)
        .expect("row 2");
    let outcomes: Vec<OutcomeKind> = third.iter().map(|result| result.outcome).collect();
    assert_eq!(outcomes, vec![OutcomeKind::ConsumedInBatch, OutcomeKind::Completed]);
    assert_eq!(third[1].final_data.get("total"), Some(&json!(6)));
    assert_eq!(third[1].final_data.get("count"), Some(&json!(3)));

    let batches = landscape.get_batches(&run.run_id).expect("batches");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status, BatchStatus::Completed);
    assert_eq!(batches[0].trigger_type, Some(TriggerKind::Count));
    assert!(batches[0].completed_at.is_some());
    let members = landscape.get_batch_members(&batches[0].batch_id).expect("members");
    assert_eq!(members.len(), 3);
    let ordinals: Vec<u32> = members.iter().map(|member| member.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
}

#[test]
fn end_of_source_flushes_remaining_buffer() {
    let (landscape, run, source) = setup();
    let agg_node = register_node(&landscape, &run, "sum", NodeType::Aggregation, 1);
    let steps = vec![PipelineStep::transform(
        agg_node.clone(),
        Box::new(SumBatchTransform::new()),
    )];
    let wiring = ProcessorWiring {
        aggregation_settings: HashMap::from([(agg_node.clone(), AggregationSettings {
            trigger: TriggerSettings::EndOfSource,
            output_mode: OutputMode::Single,
        })]),
        ..ProcessorWiring::default()
    };
    let mut processor = processor(&landscape, &run, &source, wiring);
    let mut ctx = ctx(&run);

    for index in 0..2 {
        let results = processor
            .process_row(index, &source_row(json!({"v": 10})), &steps, &mut ctx)
            .expect("buffered row");
        assert_eq!(results[0].outcome, OutcomeKind::ConsumedInBatch);
    }

    let results = processor.finish_source(&steps, &mut ctx).expect("finish source");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, OutcomeKind::Completed);
    assert_eq!(results[0].final_data.get("total"), Some(&json!(20)));

    let batches = landscape.get_batches(&run.run_id).expect("batches");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].trigger_type, Some(TriggerKind::EndOfSource));
}

// ============================================================================
// SECTION: Retry
// ============================================================================

#[test]
fn capacity_errors_retry_until_success_with_audited_attempts() {
    let (landscape, run, source) = setup();
    let flaky_node = register_node(&landscape, &run, "flaky", NodeType::Transform, 1);
    let steps =
        vec![PipelineStep::transform(flaky_node, Box::new(FlakyTransform::new(2)))];
    let wiring = ProcessorWiring {
        retry: Some(RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: false,
        }),
        ..ProcessorWiring::default()
    };
    let mut processor = processor(&landscape, &run, &source, wiring);
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"id": 1})), &steps, &mut ctx)
        .expect("process row");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, OutcomeKind::Completed);
    assert_eq!(results[0].final_data.get("attempts"), Some(&json!(3)));

    let tokens = landscape.get_tokens(&run.run_id, Page::all()).expect("tokens");
    let states = landscape.get_node_states_for_token(&tokens[0].token_id).expect("states");
    assert_eq!(states.len(), 3);
    let attempts: Vec<u32> = states.iter().map(|state| state.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(states[0].status, NodeStateStatus::Failed);
    assert_eq!(states[1].status, NodeStateStatus::Failed);
    assert_eq!(states[2].status, NodeStateStatus::Completed);
}

#[test]
fn exhausted_retries_fail_the_token_with_an_error_hash() {
    let (landscape, run, source) = setup();
    let flaky_node = register_node(&landscape, &run, "flaky", NodeType::Transform, 1);
    let steps =
        vec![PipelineStep::transform(flaky_node, Box::new(FlakyTransform::new(10)))];
    let wiring = ProcessorWiring {
        retry: Some(RetrySettings {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        }),
        ..ProcessorWiring::default()
    };
    let mut processor = processor(&landscape, &run, &source, wiring);
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"id": 1})), &steps, &mut ctx)
        .expect("process row");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, OutcomeKind::Failed);
    let error = results[0].error.as_ref().expect("failure info");
    assert_eq!(error.error_kind, "max_retries_exceeded");

    let outcomes = landscape.get_token_outcomes(&run.run_id).expect("outcomes");
    assert_eq!(outcomes[0].outcome, OutcomeKind::Failed);
    let error_hash = outcomes[0].error_hash.as_deref().expect("error hash");
    assert_eq!(error_hash.len(), 16);
}

// ============================================================================
// SECTION: Error Routing
// ============================================================================

#[test]
fn processing_error_routes_to_the_configured_error_sink() {
    let (landscape, run, source) = setup();
    let reject_node = register_node(&landscape, &run, "reject", NodeType::Transform, 1);
    let steps = vec![PipelineStep::transform(
        reject_node,
        Box::new(RejectTransform::new(Some("errors"))),
    )];
    let mut processor = processor(&landscape, &run, &source, ProcessorWiring::default());
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"id": 1})), &steps, &mut ctx)
        .expect("process row");

    assert_eq!(results[0].outcome, OutcomeKind::Routed);
    assert_eq!(results[0].sink_name.as_deref(), Some("errors"));
    let outcomes = landscape.get_token_outcomes(&run.run_id).expect("outcomes");
    assert_eq!(outcomes[0].sink_name.as_deref(), Some("errors"));
}

#[test]
fn processing_error_without_sink_quarantines_the_token() {
    let (landscape, run, source) = setup();
    let reject_node = register_node(&landscape, &run, "reject", NodeType::Transform, 1);
    let steps =
        vec![PipelineStep::transform(reject_node, Box::new(RejectTransform::new(None)))];
    let mut processor = processor(&landscape, &run, &source, ProcessorWiring::default());
    let mut ctx = ctx(&run);

    let results = processor
        .process_row(0, &source_row(json!({"id": 1})), &steps, &mut ctx)
        .expect("process row");

    assert_eq!(results[0].outcome, OutcomeKind::Quarantined);
    let outcomes = landscape.get_token_outcomes(&run.run_id).expect("outcomes");
    assert_eq!(outcomes[0].outcome, OutcomeKind::Quarantined);
    assert!(outcomes[0].error_hash.is_some());
}

#[test]
fn quarantined_source_row_terminates_immediately() {
    let (landscape, run, source) = setup();
    let transform_node = register_node(&landscape, &run, "append", NodeType::Transform, 1);
    let steps = vec![PipelineStep::transform(
        transform_node,
        Box::new(AppendTransform::new("seen", json!(true))),
    )];
    let mut processor = processor(&landscape, &run, &source, ProcessorWiring::default());
    let mut ctx = ctx(&run);

    let quarantined = SourceRow::quarantined(
        PipelineRow::observed(RowData::new()),
        rowscape_core::QuarantineInfo {
            destination: None,
            error: "unparseable row".to_string(),
            raw_data: "%%%".to_string(),
        },
    );
    let results = processor.process_row(0, &quarantined, &steps, &mut ctx).expect("process");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, OutcomeKind::Quarantined);
    // The transform never ran.
    let tokens = landscape.get_tokens(&run.run_id, Page::all()).expect("tokens");
    assert!(landscape
        .get_node_states_for_token(&tokens[0].token_id)
        .expect("states")
        .is_empty());
}

// ============================================================================
// SECTION: Cancellation
// ============================================================================

#[test]
fn cancellation_aborts_the_run_between_rows() {
    let (landscape, run, source) = setup();
    let transform_node = register_node(&landscape, &run, "append", NodeType::Transform, 1);
    let steps = vec![PipelineStep::transform(
        transform_node,
        Box::new(AppendTransform::new("seen", json!(true))),
    )];
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let wiring = ProcessorWiring {
        cancellation: Some(Arc::clone(&flag)),
        ..ProcessorWiring::default()
    };
    let mut processor = processor(&landscape, &run, &source, wiring);
    let mut ctx = ctx(&run);

    processor
        .process_row(0, &source_row(json!({"id": 1})), &steps, &mut ctx)
        .expect("first row");

    flag.store(true, Ordering::SeqCst);
    let cancelled = processor.process_row(1, &source_row(json!({"id": 2})), &steps, &mut ctx);
    assert!(matches!(cancelled, Err(EngineError::Cancelled)));

    let aborted = landscape.get_run(&run.run_id).expect("get run").expect("run exists");
    assert_eq!(aborted.status, rowscape_core::RunStatus::Aborted);
}

// ============================================================================
// SECTION: Empty Source
// ============================================================================

#[test]
fn empty_source_completes_with_zero_tokens_and_calls() {
    let (landscape, run, source) = setup();
    let agg_node = register_node(&landscape, &run, "sum", NodeType::Aggregation, 1);
    let steps = vec![PipelineStep::transform(
        agg_node.clone(),
        Box::new(SumBatchTransform::new()),
    )];
    let wiring = ProcessorWiring {
        aggregation_settings: HashMap::from([(agg_node, AggregationSettings {
            trigger: TriggerSettings::EndOfSource,
            output_mode: OutputMode::Single,
        })]),
        ..ProcessorWiring::default()
    };
    let mut processor = processor(&landscape, &run, &source, wiring);
    let mut ctx = ctx(&run);

    let results = processor.finish_source(&steps, &mut ctx).expect("finish source");
    assert!(results.is_empty());
    assert!(landscape.get_tokens(&run.run_id, Page::all()).expect("tokens").is_empty());
    assert!(landscape.get_calls(&run.run_id).expect("calls").is_empty());
    assert!(landscape.get_batches(&run.run_id).expect("batches").is_empty());
}

// ============================================================================
// SECTION: Iteration Guard
// ============================================================================

/// Transform expanding one row into a fixed number of children.
struct WideExpandTransform {
    header: PluginHeader,
    width: usize,
}

impl TransformPlugin for WideExpandTransform {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn creates_tokens(&self) -> bool {
        true
    }

    fn process(
        &self,
        _row: &PipelineRow,
        _ctx: &mut PluginContext,
    ) -> Result<TransformResult, PluginCallError> {
        let rows: Vec<RowData> = (0..self.width)
            .map(|index| {
                let mut data = RowData::new();
                data.insert("i".to_string(), json!(index));
                data
            })
            .collect();
        Ok(TransformResult::success_multi(rows))
    }
}

#[test]
fn work_queue_iteration_guard_aborts_runaway_pipelines() {
    let (landscape, run, source) = setup();
    let wide_node = register_node(&landscape, &run, "wide", NodeType::Transform, 1);
    let steps = vec![PipelineStep::transform(
        wide_node,
        Box::new(WideExpandTransform {
            header: PluginHeader::new("wide", "1.0", DeterminismKind::Deterministic),
            width: rowscape_engine::MAX_WORK_QUEUE_ITERATIONS as usize + 1,
        }),
    )];
    let mut processor = processor(&landscape, &run, &source, ProcessorWiring::default());
    let mut ctx = ctx(&run);

    let result = processor.process_row(0, &source_row(json!({"id": 1})), &steps, &mut ctx);
    assert!(matches!(result, Err(EngineError::IterationCapExceeded { .. })));
}
