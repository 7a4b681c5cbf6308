// crates/rowscape-store-sqlite/tests/sqlite_landscape_unit.rs
// ============================================================================
// Module: SQLite Landscape Unit Tests
// Description: Integrity tests for the SQLite landscape store.
// Purpose: Validate transaction atomicity, outcome uniqueness, batch
//          lifecycle, call indexing, payload purge, and fail-closed parsing.
// ============================================================================

//! ## Overview
//! Unit-level tests for the store invariants the engine relies on:
//! - Run lifecycle (begin, finalise exactly once)
//! - Node registration freeze after the first token
//! - Token lineage (fork, expand, coalesce) and one-outcome-per-token
//! - Batch lifecycle, members, and retry attempts
//! - Call index allocation and call recording
//! - Payload content addressing and purge behaviour
//! - Corrupt enum values crash on read

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use rowscape_core::BatchStatus;
use rowscape_core::CallSpec;
use rowscape_core::CallStatus;
use rowscape_core::CallType;
use rowscape_core::DeterminismKind;
use rowscape_core::GroupId;
use rowscape_core::Landscape;
use rowscape_core::LandscapeError;
use rowscape_core::NodeId;
use rowscape_core::NodeRecord;
use rowscape_core::NodeRegistration;
use rowscape_core::NodeStateRecord;
use rowscape_core::NodeStateStatus;
use rowscape_core::NodeType;
use rowscape_core::OutcomeKind;
use rowscape_core::Page;
use rowscape_core::PipelineRow;
use rowscape_core::RoutingMode;
use rowscape_core::RowRecord;
use rowscape_core::RunRecord;
use rowscape_core::RunStatus;
use rowscape_core::SchemaConfig;
use rowscape_core::TokenOutcome;
use rowscape_core::TokenRecord;
use rowscape_core::TriggerKind;
use rowscape_store_sqlite::SqliteLandscape;
use rowscape_store_sqlite::SqliteLandscapeConfig;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn store() -> SqliteLandscape {
    SqliteLandscape::in_memory().expect("store init")
}

fn begin_run(landscape: &SqliteLandscape) -> RunRecord {
    landscape.begin_run(&json!({"test": true}), "v1").expect("begin run")
}

fn register_source(landscape: &SqliteLandscape, run: &RunRecord) -> NodeRecord {
    landscape
        .register_node(NodeRegistration {
            run_id: run.run_id.clone(),
            node_id: Some(NodeId::new("source_1")),
            plugin_name: "csv".to_string(),
            plugin_version: "1.0.0".to_string(),
            node_type: NodeType::Source,
            config: json!({"path": "input.csv"}),
            schema: SchemaConfig::dynamic(),
            determinism: DeterminismKind::Deterministic,
            sequence_in_pipeline: 0,
        })
        .expect("register node")
}

fn row_from_json(value: Value) -> PipelineRow {
    let Value::Object(data) = value else {
        panic!("test rows must be json objects");
    };
    PipelineRow::observed(data)
}

fn seed_row(landscape: &SqliteLandscape, run: &RunRecord, node: &NodeRecord) -> RowRecord {
    landscape
        .create_row(&run.run_id, &node.node_id, 0, &row_from_json(json!({"value": 42})))
        .expect("create row")
}

fn seed_token(landscape: &SqliteLandscape, run: &RunRecord, row: &RowRecord) -> TokenRecord {
    landscape.create_token(&run.run_id, &row.row_id, 0).expect("create token")
}

fn seed_state(
    landscape: &SqliteLandscape,
    run: &RunRecord,
    node: &NodeRecord,
    token: &TokenRecord,
) -> NodeStateRecord {
    landscape
        .begin_node_state(&run.run_id, &token.token_id, &node.node_id, 1, 0, "hash")
        .expect("begin state")
}

// ============================================================================
// SECTION: Run Lifecycle
// ============================================================================

#[test]
fn begin_run_records_running_status_and_config_hash() {
    let landscape = store();
    let run = begin_run(&landscape);

    let loaded = landscape.get_run(&run.run_id).expect("get run").expect("run exists");
    assert_eq!(loaded.status, RunStatus::Running);
    assert_eq!(loaded.settings, json!({"test": true}));
    assert_eq!(loaded.config_hash, run.config_hash);
    assert!(loaded.completed_at.is_none());
}

#[test]
fn complete_run_finalises_exactly_once() {
    let landscape = store();
    let run = begin_run(&landscape);

    let completed = landscape.complete_run(&run.run_id, RunStatus::Completed).expect("complete");
    assert_eq!(completed.status, RunStatus::Completed);
    assert!(completed.completed_at.is_some());

    let second = landscape.complete_run(&run.run_id, RunStatus::Failed);
    assert!(matches!(second, Err(LandscapeError::Conflict(_))));
}

#[test]
fn complete_run_rejects_unknown_run() {
    let landscape = store();
    let result =
        landscape.complete_run(&rowscape_core::RunId::new("missing"), RunStatus::Completed);
    assert!(matches!(result, Err(LandscapeError::NotFound(_))));
}

// ============================================================================
// SECTION: Node Registration
// ============================================================================

#[test]
fn register_node_persists_resolved_config_and_hashes() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);

    let nodes = landscape.get_nodes(&run.run_id).expect("nodes");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_id, node.node_id);
    assert_eq!(nodes[0].config, json!({"path": "input.csv"}));
    assert_eq!(nodes[0].config_hash, node.config_hash);
    assert_eq!(nodes[0].determinism, DeterminismKind::Deterministic);
}

#[test]
fn node_registration_freezes_after_first_token() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    seed_token(&landscape, &run, &row);

    let late = landscape.register_node(NodeRegistration {
        run_id: run.run_id.clone(),
        node_id: Some(NodeId::new("late")),
        plugin_name: "late".to_string(),
        plugin_version: "1.0".to_string(),
        node_type: NodeType::Transform,
        config: json!({}),
        schema: SchemaConfig::dynamic(),
        determinism: DeterminismKind::Deterministic,
        sequence_in_pipeline: 1,
    });
    assert!(matches!(late, Err(LandscapeError::Conflict(_))));
}

#[test]
fn register_edge_is_idempotent_per_source_and_label() {
    let landscape = store();
    let run = begin_run(&landscape);
    let source = register_source(&landscape, &run);
    let sink = NodeId::new("sink_1");

    let first = landscape
        .register_edge(&run.run_id, &source.node_id, &sink, "continue", RoutingMode::Move)
        .expect("edge");
    let second = landscape
        .register_edge(&run.run_id, &source.node_id, &sink, "continue", RoutingMode::Move)
        .expect("edge again");
    assert_eq!(first.edge_id, second.edge_id);

    let edges = landscape.get_edges(&run.run_id).expect("edges");
    assert_eq!(edges.len(), 1);
}

// ============================================================================
// SECTION: Rows and Payloads
// ============================================================================

#[test]
fn create_row_persists_content_addressed_payload() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);

    let payload = landscape
        .get_payload(row.data_ref.as_deref().expect("data ref"))
        .expect("get payload")
        .expect("payload exists");
    let body = payload.body.expect("payload body");
    let parsed: Value = serde_json::from_slice(&body).expect("payload json");
    assert_eq!(parsed, json!({"value": 42}));
}

#[test]
fn quarantined_row_keeps_raw_bytes_and_error() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);

    let row = landscape
        .create_quarantined_row(&run.run_id, &node.node_id, 3, "not,valid,csv", "bad column count")
        .expect("quarantined row");
    assert_eq!(row.quarantine_error.as_deref(), Some("bad column count"));

    let payload = landscape
        .get_payload(row.data_ref.as_deref().expect("ref"))
        .expect("get payload")
        .expect("payload exists");
    assert_eq!(payload.body.expect("body"), b"not,valid,csv".to_vec());
}

#[test]
fn purge_payload_keeps_the_addressing_record() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let data_ref = row.data_ref.expect("ref");

    assert!(landscape.purge_payload(&data_ref).expect("purge"));
    let payload =
        landscape.get_payload(&data_ref).expect("get payload").expect("record survives");
    assert!(payload.body.is_none());
    assert!(!landscape.purge_payload(&data_ref).expect("second purge"));
}

#[test]
fn identical_payloads_collapse_to_one_blob() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);

    let first = landscape
        .create_row(&run.run_id, &node.node_id, 0, &row_from_json(json!({"v": 1})))
        .expect("row 1");
    let second = landscape
        .create_row(&run.run_id, &node.node_id, 1, &row_from_json(json!({"v": 1})))
        .expect("row 2");
    assert_eq!(first.source_data_hash, second.source_data_hash);
}

#[test]
fn get_rows_orders_and_pages_deterministically() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    for index in 0..5 {
        landscape
            .create_row(&run.run_id, &node.node_id, index, &row_from_json(json!({"i": index})))
            .expect("row");
    }

    let all = landscape.get_rows(&run.run_id, Page::all()).expect("rows");
    assert_eq!(all.len(), 5);
    let indexes: Vec<u64> = all.iter().map(|row| row.row_index).collect();
    assert_eq!(indexes, vec![0, 1, 2, 3, 4]);

    let window = landscape.get_rows(&run.run_id, Page::new(1, 2)).expect("window");
    assert_eq!(window.len(), 2);
    assert_eq!(window[0].row_index, 1);
}

// ============================================================================
// SECTION: Token Lineage
// ============================================================================

#[test]
fn fork_creates_children_sharing_one_group() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let parent = seed_token(&landscape, &run, &row);

    let (children, group) = landscape
        .fork_token(
            &run.run_id,
            &parent.token_id,
            &row.row_id,
            &["stats".to_string(), "class".to_string()],
            1,
        )
        .expect("fork");

    assert_eq!(children.len(), 2);
    assert_eq!(children[0].branch_name.as_deref(), Some("stats"));
    assert_eq!(children[1].branch_name.as_deref(), Some("class"));
    assert!(children.iter().all(|child| child.fork_group_id.as_ref() == Some(&group)));
    assert!(children.iter().all(|child| child.row_id == row.row_id));

    let parents = landscape.get_token_parents(&run.run_id).expect("parents");
    assert_eq!(parents.len(), 2);
    assert!(parents.iter().all(|link| link.parent_token_id == parent.token_id));
}

#[test]
fn expand_creates_children_with_expand_group() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let parent = seed_token(&landscape, &run, &row);

    let (children, group) =
        landscape.expand_token(&run.run_id, &parent.token_id, &row.row_id, 3, 1).expect("expand");

    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|child| child.expand_group_id.as_ref() == Some(&group)));
    let parents = landscape.get_token_parents(&run.run_id).expect("parents");
    assert_eq!(parents.len(), 3);
}

#[test]
fn coalesce_records_parent_outcomes_atomically() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let parent = seed_token(&landscape, &run, &row);
    let (children, _) = landscape
        .fork_token(&run.run_id, &parent.token_id, &row.row_id, &["a".to_string(), "b".to_string()], 1)
        .expect("fork");

    let parent_ids: Vec<_> = children.iter().map(|child| child.token_id.clone()).collect();
    let (merged, join_group) =
        landscape.coalesce_tokens(&run.run_id, &parent_ids, &row.row_id, 3).expect("coalesce");

    assert_eq!(merged.join_group_id.as_ref(), Some(&join_group));
    for child in &children {
        let outcome = landscape
            .get_token_outcome(&child.token_id)
            .expect("outcome read")
            .expect("parent outcome recorded");
        assert_eq!(outcome.outcome, OutcomeKind::Coalesced);
        assert_eq!(outcome.join_group_id.as_ref(), Some(&join_group));
    }

    let parents = landscape.get_token_parents(&run.run_id).expect("parents");
    let merged_links: Vec<_> =
        parents.iter().filter(|link| link.token_id == merged.token_id).collect();
    assert_eq!(merged_links.len(), 2);
}

#[test]
fn token_outcome_is_recorded_exactly_once() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);

    landscape
        .record_token_outcome(&run.run_id, &token.token_id, &TokenOutcome::Completed)
        .expect("first outcome");
    let second = landscape.record_token_outcome(
        &run.run_id,
        &token.token_id,
        &TokenOutcome::Failed {
            error_hash: "deadbeefdeadbeef".to_string(),
        },
    );
    assert!(matches!(second, Err(LandscapeError::Conflict(_))));
}

#[test]
fn buffered_outcome_is_superseded_by_terminal_outcome() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);

    landscape
        .record_token_outcome(&run.run_id, &token.token_id, &TokenOutcome::Buffered {
            batch_id: None,
        })
        .expect("buffered outcome");
    landscape
        .record_token_outcome(&run.run_id, &token.token_id, &TokenOutcome::Completed)
        .expect("terminal outcome supersedes buffered");

    let outcome =
        landscape.get_token_outcome(&token.token_id).expect("read").expect("recorded");
    assert_eq!(outcome.outcome, OutcomeKind::Completed);

    let again =
        landscape.record_token_outcome(&run.run_id, &token.token_id, &TokenOutcome::Completed);
    assert!(matches!(again, Err(LandscapeError::Conflict(_))));
}

#[test]
fn outcome_referents_roundtrip() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);
    let group = GroupId::generate();

    landscape
        .record_token_outcome(
            &run.run_id,
            &token.token_id,
            &TokenOutcome::Forked {
                fork_group_id: group.clone(),
            },
        )
        .expect("outcome");

    let outcome =
        landscape.get_token_outcome(&token.token_id).expect("read").expect("recorded");
    assert_eq!(outcome.outcome, OutcomeKind::Forked);
    assert_eq!(outcome.fork_group_id, Some(group));
    assert!(outcome.sink_name.is_none());
}

// ============================================================================
// SECTION: Node States
// ============================================================================

#[test]
fn node_state_retries_append_rows_instead_of_overwriting() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);

    for attempt in 0..3 {
        let state = landscape
            .begin_node_state(&run.run_id, &token.token_id, &node.node_id, 1, attempt, "in")
            .expect("begin");
        let status =
            if attempt == 2 { NodeStateStatus::Completed } else { NodeStateStatus::Failed };
        landscape.complete_node_state(&state.state_id, status, Some("out")).expect("complete");
    }

    let states = landscape.get_node_states_for_token(&token.token_id).expect("states");
    assert_eq!(states.len(), 3);
    let attempts: Vec<u32> = states.iter().map(|state| state.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(states[2].status, NodeStateStatus::Completed);
    assert!(states[2].completed_at.is_some());
    assert!(states[2].duration_ms.is_some());
}

// ============================================================================
// SECTION: Calls
// ============================================================================

#[test]
fn call_index_allocation_is_monotonic_per_state_and_type() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);
    let state = seed_state(&landscape, &run, &node, &token);

    let first = landscape.allocate_call_index(&state.state_id, CallType::Llm).expect("idx");
    let second = landscape.allocate_call_index(&state.state_id, CallType::Llm).expect("idx");
    let other_type = landscape.allocate_call_index(&state.state_id, CallType::Http).expect("idx");
    assert_eq!(first, 0);
    assert_eq!(second, 1);
    assert_eq!(other_type, 0);
}

#[test]
fn record_call_persists_hashes_and_payloads() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);
    let state = seed_state(&landscape, &run, &node, &token);

    let index = landscape.allocate_call_index(&state.state_id, CallType::Llm).expect("idx");
    let call = landscape
        .record_call(CallSpec {
            run_id: run.run_id.clone(),
            state_id: state.state_id.clone(),
            call_type: CallType::Llm,
            call_index: index,
            status: CallStatus::Success,
            request_data: json!({"model": "m1", "prompt": "hi"}),
            response_data: Some(json!({"content": "hello"})),
            latency_ms: 12,
        })
        .expect("record call");

    assert_eq!(call.call_index, 0);
    assert!(call.response_hash.is_some());
    let calls = landscape
        .find_calls_by_request_hash(&run.run_id, CallType::Llm, &call.request_hash)
        .expect("find");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call_id, call.call_id);

    let body = landscape
        .get_payload(call.response_ref.as_deref().expect("ref"))
        .expect("payload")
        .expect("exists")
        .body
        .expect("body");
    let parsed: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed, json!({"content": "hello"}));
}

#[test]
fn duplicate_call_indexes_are_rejected() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);
    let state = seed_state(&landscape, &run, &node, &token);

    let spec = CallSpec {
        run_id: run.run_id.clone(),
        state_id: state.state_id.clone(),
        call_type: CallType::Http,
        call_index: 0,
        status: CallStatus::Success,
        request_data: json!({"q": 1}),
        response_data: None,
        latency_ms: 1,
    };
    landscape.record_call(spec.clone()).expect("first call");
    let duplicate = landscape.record_call(spec);
    assert!(matches!(duplicate, Err(LandscapeError::Conflict(_))));
}

// ============================================================================
// SECTION: Batches
// ============================================================================

#[test]
fn batch_lifecycle_progresses_draft_to_completed() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);

    let batch =
        landscape.create_batch(&run.run_id, &node.node_id, 0).expect("create batch");
    assert_eq!(batch.status, BatchStatus::Draft);
    assert!(batch.trigger_type.is_none());
    assert!(batch.completed_at.is_none());

    landscape.add_batch_member(&batch.batch_id, &token.token_id, 0).expect("member");
    let executing = landscape
        .update_batch_status(&batch.batch_id, BatchStatus::Executing)
        .expect("executing");
    assert_eq!(executing.status, BatchStatus::Executing);

    let completed = landscape
        .complete_batch(
            &batch.batch_id,
            BatchStatus::Completed,
            TriggerKind::Count,
            Some(&json!({"count": 1})),
            None,
        )
        .expect("complete");
    assert_eq!(completed.status, BatchStatus::Completed);
    assert_eq!(completed.trigger_type, Some(TriggerKind::Count));
    assert!(completed.completed_at.is_some());
}

#[test]
fn batch_members_keep_deterministic_ordinals() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);

    let batch = landscape.create_batch(&run.run_id, &node.node_id, 0).expect("batch");
    let mut token_ids = Vec::new();
    for ordinal in 0..3 {
        let token = seed_token(&landscape, &run, &row);
        landscape.add_batch_member(&batch.batch_id, &token.token_id, ordinal).expect("member");
        token_ids.push(token.token_id);
    }

    let members = landscape.get_batch_members(&batch.batch_id).expect("members");
    assert_eq!(members.len(), 3);
    let ordinals: Vec<u32> = members.iter().map(|member| member.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    let ids: Vec<_> = members.iter().map(|member| member.token_id.clone()).collect();
    assert_eq!(ids, token_ids);
}

#[test]
fn retry_batch_copies_members_into_next_attempt() {
    let landscape = store();
    let run = begin_run(&landscape);
    let node = register_source(&landscape, &run);
    let row = seed_row(&landscape, &run, &node);
    let token = seed_token(&landscape, &run, &row);

    let batch = landscape.create_batch(&run.run_id, &node.node_id, 0).expect("batch");
    landscape.add_batch_member(&batch.batch_id, &token.token_id, 0).expect("member");
    landscape
        .complete_batch(&batch.batch_id, BatchStatus::Failed, TriggerKind::Count, None, None)
        .expect("fail batch");

    let retried = landscape.retry_batch(&batch.batch_id).expect("retry");
    assert_eq!(retried.attempt, 1);
    assert_eq!(retried.status, BatchStatus::Draft);
    assert_ne!(retried.batch_id, batch.batch_id);

    let prior = landscape.get_batch(&batch.batch_id).expect("prior").expect("preserved");
    assert_eq!(prior.status, BatchStatus::Failed);

    let members = landscape.get_batch_members(&retried.batch_id).expect("members");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].token_id, token.token_id);
}

// ============================================================================
// SECTION: Corruption
// ============================================================================

#[test]
fn invalid_stored_enum_crashes_on_read() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("landscape.db");
    let landscape = SqliteLandscape::new(&SqliteLandscapeConfig {
        path: Some(path.clone()),
        ..SqliteLandscapeConfig::default()
    })
    .expect("store init");
    let run = begin_run(&landscape);
    drop(landscape);

    let connection = rusqlite::Connection::open(&path).expect("raw connection");
    connection
        .execute("UPDATE runs SET status = 'mangled' WHERE run_id = ?1", [run.run_id.as_str()])
        .expect("mangle");
    drop(connection);

    let reopened = SqliteLandscape::open(&path).expect("reopen");
    let result = reopened.get_run(&run.run_id);
    assert!(matches!(result, Err(LandscapeError::Corrupt(_))));
}

#[test]
fn file_backed_store_round_trips_across_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("landscape.db");
    let run_id = {
        let landscape = SqliteLandscape::open(&path).expect("store init");
        let run = begin_run(&landscape);
        let node = register_source(&landscape, &run);
        seed_row(&landscape, &run, &node);
        landscape.complete_run(&run.run_id, RunStatus::Completed).expect("complete");
        run.run_id
    };

    let reopened = SqliteLandscape::open(&path).expect("reopen");
    let run = reopened.get_run(&run_id).expect("get run").expect("run exists");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(reopened.get_rows(&run_id, Page::all()).expect("rows").len(), 1);
}
