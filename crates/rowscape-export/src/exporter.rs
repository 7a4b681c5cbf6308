// crates/rowscape-export/src/exporter.rs
// ============================================================================
// Module: Rowscape Landscape Exporter
// Description: Ordered record stream with per-record HMAC signatures.
// Purpose: Produce byte-identical signed exports of a recorded run.
// Dependencies: rowscape-core, hmac, sha2, serde_json
// ============================================================================

//! ## Overview
//! Export emits records in a fixed type order (run, nodes, edges, rows,
//! tokens, token parents, node-states, routing events, calls, batches, batch
//! members, artifacts), each type internally ordered by the store's
//! deterministic composite keys. With signing enabled, every record carries
//! `signature = HMAC-SHA256(key, canonical_json(record_without_signature))`
//! and a terminal manifest chains all signatures into `final_hash`. The
//! manifest's `exported_at` is excluded from the chain so repeat exports of
//! the same run and key agree on `final_hash`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::sync::Arc;

use hmac::Hmac;
use hmac::Mac;
use rowscape_core::Landscape;
use rowscape_core::LandscapeError;
use rowscape_core::OutcomeKind;
use rowscape_core::RunId;
use rowscape_core::TokenOutcomeRecord;
use rowscape_core::Timestamp;
use rowscape_core::hashing::HashError;
use rowscape_core::hashing::canonical_json_bytes;
use rowscape_core::hashing::hash_bytes;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Exporter errors.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Landscape read failed.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Record canonicalization failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// The requested run does not exist.
    #[error("run not found: {0}")]
    RunNotFound(String),
    /// The signing key is invalid.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    /// Stream writing failed.
    #[error("export io error: {0}")]
    Io(String),
    /// A record could not be serialised.
    #[error("unserializable record: {0}")]
    Serialization(String),
}

// ============================================================================
// SECTION: Summary
// ============================================================================

/// Summary of one completed export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Content records emitted, excluding the manifest.
    pub record_count: u64,
    /// Signature chain hash; absent for unsigned exports.
    pub final_hash: Option<String>,
}

// ============================================================================
// SECTION: Exporter
// ============================================================================

/// HMAC-SHA256 keyed digest.
type HmacSha256 = Hmac<Sha256>;

/// Reads a run's landscape and emits the canonical record stream.
pub struct LandscapeExporter {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
    /// Signing key; signatures and the manifest are emitted when present.
    signing_key: Option<Vec<u8>>,
}

impl LandscapeExporter {
    /// Creates an unsigned exporter.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self {
            landscape,
            signing_key: None,
        }
    }

    /// Creates a signing exporter with the given HMAC key.
    #[must_use]
    pub fn with_signing_key(landscape: Arc<dyn Landscape>, key: &[u8]) -> Self {
        Self {
            landscape,
            signing_key: Some(key.to_vec()),
        }
    }

    /// Exports a run as an ordered record sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::RunNotFound`] for unknown runs and
    /// [`ExportError`] for read or canonicalization failures.
    pub fn export_run(&self, run_id: &RunId) -> Result<Vec<Value>, ExportError> {
        let mut records = self.collect_records(run_id)?;
        let Some(key) = &self.signing_key else {
            return Ok(records);
        };

        let mut signatures: Vec<String> = Vec::with_capacity(records.len());
        for record in &mut records {
            let signature = sign_record(key, record)?;
            signatures.push(signature.clone());
            if let Value::Object(map) = record {
                map.insert("signature".to_string(), Value::String(signature));
            }
        }

        let mut chain = Vec::new();
        for signature in &signatures {
            chain.extend_from_slice(signature.as_bytes());
        }
        let final_hash = hash_bytes(&chain).value;
        let record_count = u64::try_from(records.len()).unwrap_or(u64::MAX);
        let mut manifest = json!({
            "record_type": "manifest",
            "record_count": record_count,
            "final_hash": final_hash,
            "hash_algorithm": "sha256",
            "signature_algorithm": "hmac-sha256",
            "exported_at": Timestamp::now(),
        });
        let manifest_signature = sign_record(key, &manifest)?;
        if let Value::Object(map) = &mut manifest {
            map.insert("signature".to_string(), Value::String(manifest_signature));
        }
        records.push(manifest);
        Ok(records)
    }

    /// Exports a run as JSON lines onto a writer.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] when reading, signing, or writing fails.
    pub fn export_run_to_writer(
        &self,
        run_id: &RunId,
        writer: &mut impl Write,
    ) -> Result<ExportSummary, ExportError> {
        let records = self.export_run(run_id)?;
        let mut summary = ExportSummary {
            record_count: 0,
            final_hash: None,
        };
        for record in &records {
            if record.get("record_type") == Some(&Value::String("manifest".to_string())) {
                summary.final_hash = record
                    .get("final_hash")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            } else {
                summary.record_count += 1;
            }
            let line = serde_json::to_string(record)
                .map_err(|err| ExportError::Serialization(err.to_string()))?;
            writer
                .write_all(line.as_bytes())
                .and_then(|()| writer.write_all(b"\n"))
                .map_err(|err| ExportError::Io(err.to_string()))?;
        }
        Ok(summary)
    }

    /// Reads every record type of the run in the canonical emission order.
    fn collect_records(&self, run_id: &RunId) -> Result<Vec<Value>, ExportError> {
        let Some(run) = self.landscape.get_run(run_id)? else {
            return Err(ExportError::RunNotFound(run_id.to_string()));
        };
        let mut records = Vec::new();
        records.push(tagged("run", &run)?);

        for node in self.landscape.get_nodes(run_id)? {
            records.push(tagged("node", &node)?);
        }
        for edge in self.landscape.get_edges(run_id)? {
            records.push(tagged("edge", &edge)?);
        }
        for row in self.landscape.get_rows(run_id, rowscape_core::Page::all())? {
            records.push(tagged("row", &row)?);
        }

        let outcomes = self.landscape.get_token_outcomes(run_id)?;
        for token in self.landscape.get_tokens(run_id, rowscape_core::Page::all())? {
            let outcome = outcomes
                .iter()
                .find(|outcome| outcome.token_id == token.token_id);
            records.push(token_record(&token, outcome)?);
        }
        for parent in self.landscape.get_token_parents(run_id)? {
            records.push(tagged("token_parent", &parent)?);
        }
        for state in self.landscape.get_node_states(run_id)? {
            records.push(tagged("node_state", &state)?);
        }
        for event in self.landscape.get_routing_events(run_id)? {
            records.push(tagged("routing_event", &event)?);
        }
        for call in self.landscape.get_calls(run_id)? {
            records.push(tagged("call", &call)?);
        }
        let batches = self.landscape.get_batches(run_id)?;
        for batch in &batches {
            records.push(tagged("batch", batch)?);
        }
        for batch in &batches {
            for member in self.landscape.get_batch_members(&batch.batch_id)? {
                records.push(tagged("batch_member", &member)?);
            }
        }
        for artifact in self.landscape.get_artifacts(run_id)? {
            records.push(tagged("artifact", &artifact)?);
        }
        Ok(records)
    }
}

// ============================================================================
// SECTION: Record Shaping
// ============================================================================

/// Serialises a record value and tags it with its record type.
fn tagged<T: Serialize>(record_type: &str, value: &T) -> Result<Value, ExportError> {
    let serialized = serde_json::to_value(value)
        .map_err(|err| ExportError::Serialization(err.to_string()))?;
    let Value::Object(mut map) = serialized else {
        return Err(ExportError::Serialization(format!(
            "{record_type} record is not an object"
        )));
    };
    let mut record = Map::new();
    record.insert("record_type".to_string(), Value::String(record_type.to_string()));
    record.append(&mut map);
    Ok(Value::Object(record))
}

/// Builds a token record with its terminal outcome folded in.
fn token_record(
    token: &rowscape_core::TokenRecord,
    outcome: Option<&TokenOutcomeRecord>,
) -> Result<Value, ExportError> {
    let mut record = tagged("token", token)?;
    if let Value::Object(map) = &mut record {
        let label = outcome.map(|outcome| outcome.outcome);
        map.insert(
            "outcome".to_string(),
            match label {
                Some(kind) => Value::String(kind.label().to_string()),
                None => Value::Null,
            },
        );
        if let Some(outcome) = outcome {
            if outcome.outcome == OutcomeKind::Routed {
                map.insert("sink_name".to_string(), json!(outcome.sink_name));
            }
            if let Some(error_hash) = &outcome.error_hash {
                map.insert("error_hash".to_string(), json!(error_hash));
            }
        }
    }
    Ok(record)
}

// ============================================================================
// SECTION: Signing
// ============================================================================

/// Signs one record (without its signature field) with HMAC-SHA256.
fn sign_record(key: &[u8], record: &Value) -> Result<String, ExportError> {
    let bytes = canonical_json_bytes(record)?;
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| ExportError::InvalidKey(err.to_string()))?;
    mac.update(&bytes);
    let digest = mac.finalize().into_bytes();
    Ok(hex_encode(&digest))
}

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
