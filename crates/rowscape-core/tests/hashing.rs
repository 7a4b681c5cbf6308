// crates/rowscape-core/tests/hashing.rs
// ============================================================================
// Module: Canonical Hashing Tests
// Description: Determinism and equivalence laws for canonical JSON hashing.
// Purpose: Validate that hash inputs are order-insensitive and replay-stable.
// ============================================================================

//! ## Overview
//! Canonical hashing underpins call deduplication, payload addressing, and
//! export signing. These tests pin the laws the rest of the system relies
//! on: key order does not matter, value changes do, and the truncated error
//! hash form is stable.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use proptest::prelude::ProptestConfig;
use proptest::prelude::any;
use proptest::proptest;
use rowscape_core::hashing::canonical_json_bytes;
use rowscape_core::hashing::hash_bytes;
use rowscape_core::hashing::short_error_hash;
use rowscape_core::hashing::stable_hash;
use serde_json::json;

// ============================================================================
// SECTION: Canonical Form
// ============================================================================

#[test]
fn canonical_bytes_sort_object_keys() {
    let scrambled = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
    let bytes = canonical_json_bytes(&scrambled).expect("canonical bytes");
    let text = String::from_utf8(bytes).expect("utf8");
    assert_eq!(text, r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
}

#[test]
fn equal_values_hash_identically_regardless_of_key_order() {
    let first = json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]});
    let second = json!({"messages": [{"content": "hi", "role": "user"}], "model": "m1"});
    let first_hash = stable_hash(&first).expect("hash");
    let second_hash = stable_hash(&second).expect("hash");
    assert_eq!(first_hash, second_hash);
}

#[test]
fn value_changes_change_the_hash() {
    let base = json!({"model": "m1", "temperature": 0});
    let changed = json!({"model": "m1", "temperature": 1});
    assert_ne!(stable_hash(&base).expect("hash"), stable_hash(&changed).expect("hash"));
}

#[test]
fn repeated_hashing_is_deterministic() {
    let value = json!({"rows": [1, 2, 3], "nested": {"flag": true}});
    let first = stable_hash(&value).expect("hash");
    let second = stable_hash(&value).expect("hash");
    assert_eq!(first, second);
}

// ============================================================================
// SECTION: Digest Forms
// ============================================================================

#[test]
fn byte_hash_is_lowercase_hex_sha256() {
    let digest = hash_bytes(b"payload");
    assert_eq!(digest.value.len(), 64);
    assert!(digest.value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn short_error_hash_is_sixteen_hex_characters() {
    let value = short_error_hash("connection reset by peer");
    assert_eq!(value.len(), 16);
    assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn short_error_hash_is_a_prefix_of_the_full_hash() {
    let full = hash_bytes(b"boom").value;
    let short = short_error_hash("boom");
    assert!(full.starts_with(&short));
}

// ============================================================================
// SECTION: Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn string_maps_hash_stably(entries in proptest::collection::btree_map(
        "[a-z]{1,8}",
        any::<i64>(),
        0..8,
    )) {
        let value = serde_json::to_value(&entries).expect("to_value");
        let first = stable_hash(&value).expect("hash");
        let second = stable_hash(&value).expect("hash");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
