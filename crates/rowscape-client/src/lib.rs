// crates/rowscape-client/src/lib.rs
// ============================================================================
// Module: Rowscape Client Library
// Description: Pooled, audited external-call client and replay verifier.
// Purpose: Front all outbound HTTP/LLM traffic and verify recordings.
// Dependencies: crate::{audited, pool, verifier}
// ============================================================================

//! ## Overview
//! This crate owns the outbound side of a run: a bounded worker pool with
//! AIMD admission control, the audited call client that hashes, indexes, and
//! records every external call against its node-state, and the verifier that
//! replays those recordings against a fresh run to detect drift.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod audited;
pub mod pool;
pub mod verifier;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use audited::AuditedCallClient;
pub use audited::AuditedCallConfig;
pub use audited::CallDispatch;
pub use audited::ClientError;
pub use audited::ExternalCallRequest;
pub use pool::PoolError;
pub use pool::PooledExecutor;
pub use verifier::CallVerifier;
pub use verifier::Difference;
pub use verifier::VerificationReport;
pub use verifier::VerificationResult;
pub use verifier::VerifierConfig;
pub use verifier::VerifierError;
pub use verifier::diff_values;
