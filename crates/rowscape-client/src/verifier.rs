// crates/rowscape-client/src/verifier.rs
// ============================================================================
// Module: Rowscape Call Verifier
// Description: Replays recorded calls against fresh responses.
// Purpose: Detect drift between a recorded run and a live service.
// Dependencies: rowscape-core, serde_json
// ============================================================================

//! ## Overview
//! The verifier compares fresh call responses against the recordings of a
//! source run. Lookups key on `(run, call_type, request_hash)` with a
//! per-hash sequence index so duplicate identical requests verify against
//! successive recordings rather than the first one. Each comparison
//! classifies as match, differences, missing recording, or missing payload;
//! a payload counts as missing only when a response reference exists but the
//! blob was purged. Known-volatile subtrees can be excluded by path, and
//! lists compare as multisets by default.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rowscape_core::CallType;
use rowscape_core::Landscape;
use rowscape_core::LandscapeError;
use rowscape_core::RunId;
use rowscape_core::hashing::HashError;
use rowscape_core::hashing::stable_hash;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Verifier errors.
#[derive(Debug, Error)]
pub enum VerifierError {
    /// Landscape read failed.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Request canonicalization failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// A recorded payload did not parse as JSON.
    #[error("recorded payload is not valid json: {0}")]
    CorruptPayload(String),
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Verifier comparison configuration.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Dotted paths excluded from comparison (e.g. `usage.total_tokens`).
    pub ignore_paths: Vec<String>,
    /// Compare lists as multisets instead of by position.
    pub ignore_order: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            ignore_paths: Vec::new(),
            ignore_order: true,
        }
    }
}

// ============================================================================
// SECTION: Results
// ============================================================================

/// One structural difference between recorded and live responses.
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    /// Dotted path to the differing value.
    pub path: String,
    /// Recorded value at the path, absent when the path is live-only.
    pub recorded: Option<Value>,
    /// Live value at the path, absent when the path is recording-only.
    pub live: Option<Value>,
}

/// Classification of one verified call.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Canonical request hash the comparison keyed on.
    pub request_hash: String,
    /// Fresh response from the live service.
    pub live_response: Value,
    /// Recorded response, when available.
    pub recorded_response: Option<Value>,
    /// Whether the responses matched structurally.
    pub is_match: bool,
    /// Structural differences when the responses diverged.
    pub differences: Vec<Difference>,
    /// No recording exists for the request hash at this sequence index.
    pub recorded_call_missing: bool,
    /// The recording exists but its response payload was purged.
    pub payload_missing: bool,
}

impl VerificationResult {
    /// Returns `true` only for genuine content differences; missing
    /// recordings and purged payloads are not differences.
    #[must_use]
    pub fn has_differences(&self) -> bool {
        !self.is_match
            && !self.recorded_call_missing
            && !self.payload_missing
            && !self.differences.is_empty()
    }
}

/// Running verification statistics.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// Total calls verified.
    pub total: u64,
    /// Calls that matched their recording.
    pub matches: u64,
    /// Calls with genuine content differences.
    pub mismatches: u64,
    /// Calls with no recording at their sequence index.
    pub missing_recordings: u64,
    /// Calls whose recorded payload was purged.
    pub missing_payloads: u64,
    /// Per-call detail, in verification order.
    pub results: Vec<VerificationResult>,
}

impl VerificationReport {
    /// Returns the fraction of verified calls that matched. An empty report
    /// is vacuously successful.
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "Rates are informational.")]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.matches as f64 / self.total as f64
    }
}

// ============================================================================
// SECTION: Call Verifier
// ============================================================================

/// Replays fresh calls against a source run's recordings.
pub struct CallVerifier {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
    /// Run whose recordings are authoritative.
    source_run_id: RunId,
    /// Comparison configuration.
    config: VerifierConfig,
    /// Sequence index per `(call_type, request_hash)` for duplicates.
    seen: HashMap<(CallType, String), usize>,
    /// Accumulated report.
    report: VerificationReport,
}

impl CallVerifier {
    /// Creates a verifier over a source run with default comparison rules.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>, source_run_id: RunId) -> Self {
        Self::with_config(landscape, source_run_id, VerifierConfig::default())
    }

    /// Creates a verifier with explicit comparison rules.
    #[must_use]
    pub fn with_config(
        landscape: Arc<dyn Landscape>,
        source_run_id: RunId,
        config: VerifierConfig,
    ) -> Self {
        Self {
            landscape,
            source_run_id,
            config,
            seen: HashMap::new(),
            report: VerificationReport::default(),
        }
    }

    /// Returns the source run identifier.
    #[must_use]
    pub const fn source_run_id(&self) -> &RunId {
        &self.source_run_id
    }

    /// Returns the accumulated report.
    #[must_use]
    pub const fn report(&self) -> &VerificationReport {
        &self.report
    }

    /// Clears accumulated statistics and sequence indexes.
    pub fn reset_report(&mut self) {
        self.report = VerificationReport::default();
        self.seen.clear();
    }

    /// Verifies one fresh call against the source run's recordings.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError`] when the landscape cannot be read or a
    /// recorded payload is corrupt.
    pub fn verify(
        &mut self,
        call_type: CallType,
        request_data: &Value,
        live_response: &Value,
    ) -> Result<VerificationResult, VerifierError> {
        let request_hash = stable_hash(request_data)?;
        let sequence = {
            let counter = self.seen.entry((call_type, request_hash.clone())).or_insert(0);
            let current = *counter;
            *counter += 1;
            current
        };
        let recordings = self.landscape.find_calls_by_request_hash(
            &self.source_run_id,
            call_type,
            &request_hash,
        )?;

        let result = match recordings.get(sequence) {
            None => VerificationResult {
                request_hash,
                live_response: live_response.clone(),
                recorded_response: None,
                is_match: false,
                differences: Vec::new(),
                recorded_call_missing: true,
                payload_missing: false,
            },
            Some(call) => match &call.response_ref {
                None => VerificationResult {
                    request_hash,
                    live_response: live_response.clone(),
                    recorded_response: None,
                    is_match: false,
                    differences: Vec::new(),
                    recorded_call_missing: false,
                    payload_missing: false,
                },
                Some(response_ref) => {
                    let body = self
                        .landscape
                        .get_payload(response_ref)?
                        .and_then(|payload| payload.body);
                    match body {
                        None => VerificationResult {
                            request_hash,
                            live_response: live_response.clone(),
                            recorded_response: None,
                            is_match: false,
                            differences: Vec::new(),
                            recorded_call_missing: false,
                            payload_missing: true,
                        },
                        Some(bytes) => {
                            let recorded: Value = serde_json::from_slice(&bytes)
                                .map_err(|err| VerifierError::CorruptPayload(err.to_string()))?;
                            let differences =
                                diff_values(&recorded, live_response, &self.config);
                            VerificationResult {
                                request_hash,
                                live_response: live_response.clone(),
                                recorded_response: Some(recorded),
                                is_match: differences.is_empty(),
                                differences,
                                recorded_call_missing: false,
                                payload_missing: false,
                            }
                        }
                    }
                }
            },
        };

        self.track(&result);
        Ok(result)
    }

    /// Folds one result into the running report.
    fn track(&mut self, result: &VerificationResult) {
        self.report.total += 1;
        if result.is_match {
            self.report.matches += 1;
        } else if result.recorded_call_missing {
            self.report.missing_recordings += 1;
        } else if result.payload_missing {
            self.report.missing_payloads += 1;
        } else {
            self.report.mismatches += 1;
        }
        self.report.results.push(result.clone());
    }
}

// ============================================================================
// SECTION: Structural Diff
// ============================================================================

/// Computes the structural differences between two JSON values.
#[must_use]
pub fn diff_values(recorded: &Value, live: &Value, config: &VerifierConfig) -> Vec<Difference> {
    let mut differences = Vec::new();
    diff_at_path("", recorded, live, config, &mut differences);
    differences
}

/// Returns whether a path is excluded by the ignore list.
fn is_ignored(path: &str, config: &VerifierConfig) -> bool {
    config.ignore_paths.iter().any(|ignored| {
        path == ignored
            || path.starts_with(&format!("{ignored}."))
            || path.starts_with(&format!("{ignored}["))
    })
}

/// Joins a parent path with an object key.
fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Recursive comparison worker.
fn diff_at_path(
    path: &str,
    recorded: &Value,
    live: &Value,
    config: &VerifierConfig,
    out: &mut Vec<Difference>,
) {
    if !path.is_empty() && is_ignored(path, config) {
        return;
    }
    match (recorded, live) {
        (Value::Object(recorded_map), Value::Object(live_map)) => {
            for (key, recorded_value) in recorded_map {
                let next = child_path(path, key);
                match live_map.get(key) {
                    Some(live_value) => {
                        diff_at_path(&next, recorded_value, live_value, config, out);
                    }
                    None => {
                        if !is_ignored(&next, config) {
                            out.push(Difference {
                                path: next,
                                recorded: Some(recorded_value.clone()),
                                live: None,
                            });
                        }
                    }
                }
            }
            for (key, live_value) in live_map {
                if !recorded_map.contains_key(key) {
                    let next = child_path(path, key);
                    if !is_ignored(&next, config) {
                        out.push(Difference {
                            path: next,
                            recorded: None,
                            live: Some(live_value.clone()),
                        });
                    }
                }
            }
        }
        (Value::Array(recorded_items), Value::Array(live_items)) => {
            if config.ignore_order {
                diff_multiset(path, recorded_items, live_items, config, out);
            } else {
                let shared = recorded_items.len().min(live_items.len());
                for index in 0..shared {
                    diff_at_path(
                        &format!("{path}[{index}]"),
                        &recorded_items[index],
                        &live_items[index],
                        config,
                        out,
                    );
                }
                for (index, item) in recorded_items.iter().enumerate().skip(shared) {
                    out.push(Difference {
                        path: format!("{path}[{index}]"),
                        recorded: Some(item.clone()),
                        live: None,
                    });
                }
                for (index, item) in live_items.iter().enumerate().skip(shared) {
                    out.push(Difference {
                        path: format!("{path}[{index}]"),
                        recorded: None,
                        live: Some(item.clone()),
                    });
                }
            }
        }
        (recorded_value, live_value) => {
            if !values_equal(recorded_value, live_value, config) {
                out.push(Difference {
                    path: path.to_string(),
                    recorded: Some(recorded_value.clone()),
                    live: Some(live_value.clone()),
                });
            }
        }
    }
}

/// Multiset comparison: each recorded element consumes one equal live
/// element; leftovers on either side are differences.
fn diff_multiset(
    path: &str,
    recorded_items: &[Value],
    live_items: &[Value],
    config: &VerifierConfig,
    out: &mut Vec<Difference>,
) {
    let mut consumed = vec![false; live_items.len()];
    for (index, recorded_item) in recorded_items.iter().enumerate() {
        let matched = live_items.iter().enumerate().find(|(live_index, live_item)| {
            !consumed[*live_index] && values_equal(recorded_item, live_item, config)
        });
        match matched {
            Some((live_index, _)) => consumed[live_index] = true,
            None => out.push(Difference {
                path: format!("{path}[{index}]"),
                recorded: Some(recorded_item.clone()),
                live: None,
            }),
        }
    }
    for (live_index, live_item) in live_items.iter().enumerate() {
        if !consumed[live_index] {
            out.push(Difference {
                path: format!("{path}[{live_index}]"),
                recorded: None,
                live: Some(live_item.clone()),
            });
        }
    }
}

/// Deep equality respecting the order-insensitivity configuration.
fn values_equal(recorded: &Value, live: &Value, config: &VerifierConfig) -> bool {
    match (recorded, live) {
        (Value::Object(recorded_map), Value::Object(live_map)) => {
            recorded_map.len() == live_map.len()
                && recorded_map.iter().all(|(key, recorded_value)| {
                    live_map
                        .get(key)
                        .is_some_and(|live_value| values_equal(recorded_value, live_value, config))
                })
        }
        (Value::Array(recorded_items), Value::Array(live_items)) => {
            if recorded_items.len() != live_items.len() {
                return false;
            }
            if config.ignore_order {
                let mut consumed = vec![false; live_items.len()];
                recorded_items.iter().all(|recorded_item| {
                    live_items.iter().enumerate().any(|(live_index, live_item)| {
                        if !consumed[live_index]
                            && values_equal(recorded_item, live_item, config)
                        {
                            consumed[live_index] = true;
                            true
                        } else {
                            false
                        }
                    })
                })
            } else {
                recorded_items
                    .iter()
                    .zip(live_items)
                    .all(|(recorded_item, live_item)| {
                        values_equal(recorded_item, live_item, config)
                    })
            }
        }
        (recorded_value, live_value) => recorded_value == live_value,
    }
}
