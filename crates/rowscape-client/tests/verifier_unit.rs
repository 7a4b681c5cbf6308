// crates/rowscape-client/tests/verifier_unit.rs
// ============================================================================
// Module: Call Verifier Tests
// Description: Replay comparison and classification behaviour.
// Purpose: Validate match/mismatch classification, purge handling, duplicate
//          sequencing, ignore paths, and order-insensitive list comparison.
// ============================================================================

//! ## Overview
//! The verifier replays fresh responses against a source run's recordings.
//! These tests record calls through the landscape, then verify against them
//! and assert every classification: match, genuine differences, missing
//! recording, purged payload (distinct from never-recorded responses), and
//! sequence-indexed duplicate verification.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;

use rowscape_client::CallVerifier;
use rowscape_client::VerifierConfig;
use rowscape_core::CallSpec;
use rowscape_core::CallStatus;
use rowscape_core::CallType;
use rowscape_core::DeterminismKind;
use rowscape_core::Landscape;
use rowscape_core::NodeId;
use rowscape_core::NodeRegistration;
use rowscape_core::NodeType;
use rowscape_core::PipelineRow;
use rowscape_core::RunRecord;
use rowscape_core::SchemaConfig;
use rowscape_core::StateId;
use rowscape_store_sqlite::SqliteLandscape;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn seed_state(landscape: &SqliteLandscape) -> (RunRecord, StateId) {
    let run = landscape.begin_run(&json!({}), "v1").expect("begin run");
    let node = landscape
        .register_node(NodeRegistration {
            run_id: run.run_id.clone(),
            node_id: Some(NodeId::new("llm_node")),
            plugin_name: "llm".to_string(),
            plugin_version: "1.0".to_string(),
            node_type: NodeType::Transform,
            config: json!({}),
            schema: SchemaConfig::dynamic(),
            determinism: DeterminismKind::ExternalCall,
            sequence_in_pipeline: 1,
        })
        .expect("register node");
    let mut data = rowscape_core::RowData::new();
    data.insert("q".to_string(), json!("hi"));
    let row = landscape
        .create_row(&run.run_id, &node.node_id, 0, &PipelineRow::observed(data))
        .expect("row");
    let token = landscape.create_token(&run.run_id, &row.row_id, 0).expect("token");
    let state = landscape
        .begin_node_state(&run.run_id, &token.token_id, &node.node_id, 1, 0, "hash")
        .expect("state");
    (run, state.state_id)
}

fn record(
    landscape: &SqliteLandscape,
    run: &RunRecord,
    state_id: &StateId,
    request: Value,
    response: Option<Value>,
) -> rowscape_core::CallRecord {
    let call_index = landscape
        .allocate_call_index(state_id, CallType::Llm)
        .expect("call index");
    let status = if response.is_some() { CallStatus::Success } else { CallStatus::Error };
    landscape
        .record_call(CallSpec {
            run_id: run.run_id.clone(),
            state_id: state_id.clone(),
            call_type: CallType::Llm,
            call_index,
            status,
            request_data: request,
            response_data: response,
            latency_ms: 5,
        })
        .expect("record call")
}

fn verifier(landscape: &Arc<SqliteLandscape>, run: &RunRecord) -> CallVerifier {
    CallVerifier::new(landscape.clone() as Arc<dyn Landscape>, run.run_id.clone())
}

// ============================================================================
// SECTION: Classification
// ============================================================================

#[test]
fn unchanged_response_matches() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"model": "m1", "prompt": "hi"});
    record(&landscape, &run, &state_id, request.clone(), Some(json!({"content": "hello"})));

    let mut verifier = verifier(&landscape, &run);
    let result = verifier
        .verify(CallType::Llm, &request, &json!({"content": "hello"}))
        .expect("verify");

    assert!(result.is_match);
    assert!(!result.has_differences());
    assert_eq!(verifier.report().matches, 1);
    assert_eq!(verifier.report().total, 1);
}

#[test]
fn changed_response_reports_differences() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"model": "m1", "prompt": "hi"});
    record(&landscape, &run, &state_id, request.clone(), Some(json!({"content": "old"})));

    let mut verifier = verifier(&landscape, &run);
    let result =
        verifier.verify(CallType::Llm, &request, &json!({"content": "new"})).expect("verify");

    assert!(!result.is_match);
    assert!(result.has_differences());
    assert_eq!(result.differences.len(), 1);
    assert_eq!(result.differences[0].path, "content");
    assert_eq!(result.differences[0].recorded, Some(json!("old")));
    assert_eq!(result.differences[0].live, Some(json!("new")));
    assert_eq!(verifier.report().mismatches, 1);
}

#[test]
fn nested_differences_carry_full_paths() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"prompt": "hi"});
    record(
        &landscape,
        &run,
        &state_id,
        request.clone(),
        Some(json!({"usage": {"tokens": 10}, "content": "same"})),
    );

    let mut verifier = verifier(&landscape, &run);
    let result = verifier
        .verify(CallType::Llm, &request, &json!({"usage": {"tokens": 12}, "content": "same"}))
        .expect("verify");

    assert!(!result.is_match);
    assert_eq!(result.differences[0].path, "usage.tokens");
}

#[test]
fn unknown_request_is_a_missing_recording() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, _) = seed_state(&landscape);

    let mut verifier = verifier(&landscape, &run);
    let result = verifier
        .verify(CallType::Llm, &json!({"prompt": "never sent"}), &json!({"content": "x"}))
        .expect("verify");

    assert!(result.recorded_call_missing);
    assert!(!result.is_match);
    assert!(!result.has_differences());
    assert_eq!(verifier.report().missing_recordings, 1);
    assert_eq!(verifier.report().mismatches, 0);
}

// ============================================================================
// SECTION: Purged Payloads
// ============================================================================

#[test]
fn purged_response_payload_classifies_as_missing_payload() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"model": "m1", "prompt": "hi"});
    let call =
        record(&landscape, &run, &state_id, request.clone(), Some(json!({"content": "hello"})));

    landscape
        .purge_payload(call.response_ref.as_deref().expect("response ref"))
        .expect("purge");

    let mut verifier = verifier(&landscape, &run);
    let result = verifier
        .verify(CallType::Llm, &request, &json!({"content": "hello"}))
        .expect("verify");

    assert!(result.payload_missing);
    assert!(result.recorded_response.is_none());
    assert!(!result.has_differences());
    assert_eq!(verifier.report().missing_payloads, 1);
    assert_eq!(verifier.report().mismatches, 0);
}

#[test]
fn error_call_without_response_is_not_missing_payload() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"model": "m1", "prompt": "hi"});
    record(&landscape, &run, &state_id, request.clone(), None);

    let mut verifier = verifier(&landscape, &run);
    let result = verifier
        .verify(CallType::Llm, &request, &json!({"error": "timeout"}))
        .expect("verify");

    assert!(!result.payload_missing);
    assert!(!result.recorded_call_missing);
    assert!(result.recorded_response.is_none());
    assert!(!result.is_match);
    assert_eq!(verifier.report().missing_payloads, 0);
}

// ============================================================================
// SECTION: Duplicate Sequencing
// ============================================================================

#[test]
fn duplicate_requests_verify_against_successive_recordings() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"model": "m1", "prompt": "same"});
    record(&landscape, &run, &state_id, request.clone(), Some(json!({"content": "first"})));
    record(&landscape, &run, &state_id, request.clone(), Some(json!({"content": "second"})));

    let mut verifier = verifier(&landscape, &run);
    let first =
        verifier.verify(CallType::Llm, &request, &json!({"content": "first"})).expect("verify");
    let second = verifier
        .verify(CallType::Llm, &request, &json!({"content": "second"}))
        .expect("verify");
    let third =
        verifier.verify(CallType::Llm, &request, &json!({"content": "third"})).expect("verify");

    assert!(first.is_match);
    assert!(second.is_match);
    assert!(third.recorded_call_missing);
    assert_eq!(verifier.report().matches, 2);
    assert_eq!(verifier.report().missing_recordings, 1);
}

// ============================================================================
// SECTION: Comparison Configuration
// ============================================================================

#[test]
fn ignored_paths_suppress_known_volatile_subtrees() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"prompt": "hi"});
    record(
        &landscape,
        &run,
        &state_id,
        request.clone(),
        Some(json!({"content": "same", "created_at": "2026-01-01T00:00:00Z", "usage": {"id": 1}})),
    );

    let mut verifier = CallVerifier::with_config(
        landscape.clone() as Arc<dyn Landscape>,
        run.run_id.clone(),
        VerifierConfig {
            ignore_paths: vec!["created_at".to_string(), "usage".to_string()],
            ignore_order: true,
        },
    );
    let result = verifier
        .verify(
            CallType::Llm,
            &request,
            &json!({"content": "same", "created_at": "2026-02-02T00:00:00Z", "usage": {"id": 2}}),
        )
        .expect("verify");

    assert!(result.is_match, "volatile subtrees should be excluded: {:?}", result.differences);
}

#[test]
fn lists_compare_as_multisets_by_default() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"prompt": "hi"});
    record(
        &landscape,
        &run,
        &state_id,
        request.clone(),
        Some(json!({"labels": ["a", "b", "c"]})),
    );

    let mut verifier = verifier(&landscape, &run);
    let result = verifier
        .verify(CallType::Llm, &request, &json!({"labels": ["c", "a", "b"]}))
        .expect("verify");

    assert!(result.is_match);
}

#[test]
fn order_sensitive_comparison_can_be_configured() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"prompt": "hi"});
    record(
        &landscape,
        &run,
        &state_id,
        request.clone(),
        Some(json!({"labels": ["a", "b"]})),
    );

    let mut verifier = CallVerifier::with_config(
        landscape.clone() as Arc<dyn Landscape>,
        run.run_id.clone(),
        VerifierConfig {
            ignore_paths: Vec::new(),
            ignore_order: false,
        },
    );
    let result = verifier
        .verify(CallType::Llm, &request, &json!({"labels": ["b", "a"]}))
        .expect("verify");

    assert!(!result.is_match);
}

#[test]
fn multiset_comparison_respects_duplicate_element_counts() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"prompt": "hi"});
    record(
        &landscape,
        &run,
        &state_id,
        request.clone(),
        Some(json!({"labels": ["a", "a", "b"]})),
    );

    let mut verifier = verifier(&landscape, &run);
    let result = verifier
        .verify(CallType::Llm, &request, &json!({"labels": ["a", "b", "b"]}))
        .expect("verify");

    assert!(!result.is_match);
}

// ============================================================================
// SECTION: Report Accounting
// ============================================================================

#[test]
fn report_tracks_success_rate_and_resets() {
    let landscape = Arc::new(SqliteLandscape::in_memory().expect("store"));
    let (run, state_id) = seed_state(&landscape);
    let request = json!({"prompt": "hi"});
    record(&landscape, &run, &state_id, request.clone(), Some(json!({"content": "x"})));

    let mut verifier = verifier(&landscape, &run);
    assert!((verifier.report().success_rate() - 1.0).abs() < f64::EPSILON);

    verifier.verify(CallType::Llm, &request, &json!({"content": "x"})).expect("match");
    verifier
        .verify(CallType::Llm, &json!({"prompt": "other"}), &json!({"content": "x"}))
        .expect("missing");
    assert!((verifier.report().success_rate() - 0.5).abs() < f64::EPSILON);
    assert_eq!(verifier.report().results.len(), 2);

    verifier.reset_report();
    assert_eq!(verifier.report().total, 0);
    assert!(verifier.report().results.is_empty());

    // Sequence indexes reset too: the same request verifies against the
    // first recording again.
    let replay =
        verifier.verify(CallType::Llm, &request, &json!({"content": "x"})).expect("verify");
    assert!(replay.is_match);
}
