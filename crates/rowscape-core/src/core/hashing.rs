// crates/rowscape-core/src/core/hashing.rs
// ============================================================================
// Module: Rowscape Canonical Hashing
// Description: RFC 8785 JSON canonicalization and content hashing utilities.
// Purpose: Provide deterministic hashes for rows, calls, and exported records.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! All hashes in the landscape are computed over RFC 8785 (JCS) canonical
//! JSON, which fixes key order, whitespace, and numeric form. Two values that
//! are equal under canonical JSON always hash identically, which is the basis
//! for call deduplication, payload addressing, and export signing. Binary
//! payloads are hashed directly over raw bytes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Hash Algorithm
// ============================================================================

/// Supported hash algorithms for landscape content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256 hashing.
    Sha256,
}

/// Default hash algorithm for all landscape content.
pub const DEFAULT_HASH_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

/// Length of the truncated error-hash form recorded with failed outcomes.
const ERROR_HASH_LENGTH: usize = 16;

// ============================================================================
// SECTION: Hash Digest
// ============================================================================

/// Deterministic content hash value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDigest {
    /// Hash algorithm identifier.
    pub algorithm: HashAlgorithm,
    /// Lowercase hex-encoded digest bytes.
    pub value: String,
}

impl HashDigest {
    /// Creates a digest from raw digest bytes.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            value: hex_encode(bytes),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when computing canonical hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Returns RFC 8785 canonical JSON bytes for a serializable value.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Hashes a serializable value over its canonical JSON form.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn hash_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<HashDigest, HashError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// Returns the lowercase hex digest of a value's canonical JSON form.
///
/// Convenience form of [`hash_canonical_json`] for callers that only need
/// the hex string (request hashes, payload addresses).
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    Ok(hash_canonical_json(value)?.value)
}

/// Hashes raw bytes with the default algorithm.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> HashDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    HashDigest::new(DEFAULT_HASH_ALGORITHM, &digest)
}

/// Returns the truncated 16-hex-character error hash recorded with failed
/// token outcomes.
#[must_use]
pub fn short_error_hash(message: &str) -> String {
    let mut value = hash_bytes(message.as_bytes()).value;
    value.truncate(ERROR_HASH_LENGTH);
    value
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

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
