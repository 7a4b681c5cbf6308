// crates/rowscape-core/src/core/row.rs
// ============================================================================
// Module: Rowscape Pipeline Rows
// Description: Immutable row data with schema contracts.
// Purpose: Carry one tabular record through the pipeline without shared mutation.
// Dependencies: serde, serde_json, crate::core::hashing
// ============================================================================

//! ## Overview
//! A [`PipelineRow`] is an immutable, ordered mapping from normalised field
//! name to JSON value plus the [`SchemaContract`] the row was admitted under.
//! Every mutation produces a new row value; the runtime never observes a
//! partially mutated row, and sibling tokens can never share nested mutable
//! structure.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::core::hashing::HashDigest;
use crate::core::hashing::HashError;
use crate::core::hashing::hash_canonical_json;

// ============================================================================
// SECTION: Row Data
// ============================================================================

/// Ordered field-name-to-value mapping carried by rows.
pub type RowData = Map<String, Value>;

// ============================================================================
// SECTION: Schema Contract
// ============================================================================

/// Schema contract mode governing how field sets are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Declared fields only; extra fields are a violation at the boundary.
    Fixed,
    /// Declared fields required; extra fields pass through.
    Flexible,
    /// Fields are inferred from the first rows observed.
    Observed,
}

impl SchemaMode {
    /// Returns the stable storage label for the mode.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Flexible => "flexible",
            Self::Observed => "observed",
        }
    }

    /// Parses a stored mode label, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns the offending label when it names no known mode.
    pub fn parse(label: &str) -> Result<Self, String> {
        match label {
            "fixed" => Ok(Self::Fixed),
            "flexible" => Ok(Self::Flexible),
            "observed" => Ok(Self::Observed),
            other => Err(other.to_string()),
        }
    }
}

/// One declared field inside a schema contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContract {
    /// Normalised field name used as the row key.
    pub normalized_name: String,
    /// Original field name as it appeared at the source boundary.
    pub original_name: String,
    /// Whether the field must be present on every row.
    pub required: bool,
}

impl FieldContract {
    /// Creates an inferred field contract for an observed field.
    #[must_use]
    pub fn inferred(name: &str) -> Self {
        Self {
            normalized_name: name.to_string(),
            original_name: name.to_string(),
            required: false,
        }
    }
}

/// Schema contract a row was admitted under.
///
/// # Invariants
/// - Field order is declaration order and is stable for the life of the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    /// Contract mode.
    pub mode: SchemaMode,
    /// Declared fields, in declaration order.
    pub fields: Vec<FieldContract>,
}

impl SchemaContract {
    /// Creates a contract with explicit fields.
    #[must_use]
    pub const fn new(mode: SchemaMode, fields: Vec<FieldContract>) -> Self {
        Self {
            mode,
            fields,
        }
    }

    /// Creates an observed-mode contract inferred from the given field names.
    #[must_use]
    pub fn observed<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            mode: SchemaMode::Observed,
            fields: names.into_iter().map(FieldContract::inferred).collect(),
        }
    }

    /// Returns the declared field names in declaration order.
    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|field| field.normalized_name.as_str()).collect()
    }
}

// ============================================================================
// SECTION: Schema Config
// ============================================================================

/// Node-level schema declaration recorded at registration time.
///
/// This is the shape the engine consumes at node boundaries; full schema
/// validation is a host concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Declared schema mode.
    pub mode: SchemaMode,
    /// Explicit field list, absent for observed schemas.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

impl SchemaConfig {
    /// Creates an observed-mode config with no declared fields.
    #[must_use]
    pub const fn dynamic() -> Self {
        Self {
            mode: SchemaMode::Observed,
            fields: None,
        }
    }

    /// Returns the canonical hash of this schema declaration.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when canonicalization fails.
    pub fn schema_hash(&self) -> Result<HashDigest, HashError> {
        hash_canonical_json(self)
    }
}

// ============================================================================
// SECTION: Pipeline Row
// ============================================================================

/// Immutable view of one row's data plus its schema contract.
///
/// # Invariants
/// - Data is never mutated in place; every change produces a new value.
/// - Clones are deep: nested arrays and objects are owned by the clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRow {
    /// Ordered field data.
    data: RowData,
    /// Contract the row was admitted under.
    contract: SchemaContract,
}

impl PipelineRow {
    /// Creates a row from data and an explicit contract.
    #[must_use]
    pub const fn new(data: RowData, contract: SchemaContract) -> Self {
        Self {
            data,
            contract,
        }
    }

    /// Creates a row with an observed contract inferred from the data keys.
    #[must_use]
    pub fn observed(data: RowData) -> Self {
        let contract = SchemaContract::observed(data.keys().map(String::as_str));
        Self {
            data,
            contract,
        }
    }

    /// Returns the value for a field, when present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Returns the underlying ordered data.
    #[must_use]
    pub const fn as_map(&self) -> &RowData {
        &self.data
    }

    /// Returns an owned deep copy of the row data.
    #[must_use]
    pub fn to_map(&self) -> RowData {
        self.data.clone()
    }

    /// Returns the schema contract.
    #[must_use]
    pub const fn contract(&self) -> &SchemaContract {
        &self.contract
    }

    /// Returns the number of fields on the row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` when the row carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a new row with one field set, preserving the contract.
    #[must_use]
    pub fn with_value(&self, name: &str, value: Value) -> Self {
        let mut data = self.data.clone();
        data.insert(name.to_string(), value);
        Self {
            data,
            contract: self.contract.clone(),
        }
    }

    /// Returns a new row with the given fields merged over this row's data.
    ///
    /// Later values win on key conflict; the contract is preserved.
    #[must_use]
    pub fn merged_with(&self, updates: &RowData) -> Self {
        let mut data = self.data.clone();
        for (key, value) in updates {
            data.insert(key.clone(), value.clone());
        }
        Self {
            data,
            contract: self.contract.clone(),
        }
    }

    /// Returns a new row with entirely replaced data under the same contract.
    #[must_use]
    pub fn with_data(&self, data: RowData) -> Self {
        Self {
            data,
            contract: self.contract.clone(),
        }
    }

    /// Returns the canonical content hash of the row data.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when canonicalization fails.
    pub fn data_hash(&self) -> Result<HashDigest, HashError> {
        hash_canonical_json(&self.data)
    }
}
