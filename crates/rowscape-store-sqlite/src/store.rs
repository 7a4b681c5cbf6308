// crates/rowscape-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Landscape Store
// Description: Durable Landscape implementation backed by SQLite WAL.
// Purpose: Persist the full audit record of a run with deterministic readers.
// Dependencies: rowscape-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements the `Landscape` contract over `SQLite`. One
//! mutex-guarded connection serialises all writes; each mutating call is a
//! single transaction, and multi-row operations (fork, expand, coalesce,
//! batch retry) commit atomically. Every list-returning reader orders by a
//! deterministic composite key (`created_at` with the insertion-stable rowid
//! as tie-breaker) so repeated exports of the same run are byte-identical.
//! Stored enum labels are parsed fail-closed: an invalid value raises
//! corruption instead of being coerced.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use rowscape_core::ArtifactId;
use rowscape_core::ArtifactRecord;
use rowscape_core::ArtifactSpec;
use rowscape_core::BatchId;
use rowscape_core::BatchMemberRecord;
use rowscape_core::BatchRecord;
use rowscape_core::BatchStatus;
use rowscape_core::CallId;
use rowscape_core::CallRecord;
use rowscape_core::CallSpec;
use rowscape_core::CallStatus;
use rowscape_core::CallType;
use rowscape_core::DeterminismKind;
use rowscape_core::EdgeId;
use rowscape_core::EdgeRecord;
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
use rowscape_core::PayloadRecord;
use rowscape_core::PipelineRow;
use rowscape_core::RoutingEventRecord;
use rowscape_core::RoutingMode;
use rowscape_core::RowId;
use rowscape_core::RowRecord;
use rowscape_core::RunId;
use rowscape_core::RunRecord;
use rowscape_core::RunStatus;
use rowscape_core::SchemaMode;
use rowscape_core::StateId;
use rowscape_core::Timestamp;
use rowscape_core::TokenId;
use rowscape_core::TokenOutcome;
use rowscape_core::TokenOutcomeRecord;
use rowscape_core::TokenParentRecord;
use rowscape_core::TokenRecord;
use rowscape_core::TriggerKind;
use rowscape_core::hashing::canonical_json_bytes;
use rowscape_core::hashing::hash_bytes;
use rowscape_core::hashing::stable_hash;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended for file-backed stores).
    #[default]
    Wal,
    /// Delete journal mode.
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` landscape store.
///
/// # Invariants
/// - `path` absent selects the in-memory mode used by tests.
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteLandscapeConfig {
    /// Path to the database file; in-memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

impl Default for SqliteLandscapeConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed landscape store.
///
/// # Invariants
/// - One shared connection serialises all writes behind a mutex.
/// - Each public mutator commits exactly one transaction.
#[derive(Clone)]
pub struct SqliteLandscape {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteLandscape {
    /// Opens a store with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the database cannot be opened or the
    /// schema cannot be initialized.
    pub fn new(config: &SqliteLandscapeConfig) -> Result<Self, LandscapeError> {
        let mut connection = match &config.path {
            Some(path) => Connection::open(path).map_err(db_err)?,
            None => Connection::open_in_memory().map_err(db_err)?,
        };
        apply_pragmas(&connection, config)?;
        initialize_schema(&mut connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Opens an in-memory store for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when initialization fails.
    pub fn in_memory() -> Result<Self, LandscapeError> {
        Self::new(&SqliteLandscapeConfig::default())
    }

    /// Opens a file-backed store at the given path with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LandscapeError> {
        Self::new(&SqliteLandscapeConfig {
            path: Some(path.as_ref().to_path_buf()),
            ..SqliteLandscapeConfig::default()
        })
    }

    /// Acquires the shared connection guard.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LandscapeError> {
        self.connection.lock().map_err(|_| LandscapeError::Db("landscape mutex poisoned".to_string()))
    }
}

// ============================================================================
// SECTION: Connection Setup
// ============================================================================

/// Maps a database error into the landscape error domain.
fn db_err(err: rusqlite::Error) -> LandscapeError {
    LandscapeError::Db(err.to_string())
}

/// Maps constraint violations to conflicts and everything else to db errors.
fn constraint_err(err: rusqlite::Error, conflict_message: &str) -> LandscapeError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err
        && failure.code == ErrorCode::ConstraintViolation
    {
        return LandscapeError::Conflict(conflict_message.to_string());
    }
    db_err(err)
}

/// Applies the pragmas required for durability and integrity.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteLandscapeConfig,
) -> Result<(), LandscapeError> {
    connection.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(db_err)?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(db_err)?;
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(db_err)?;
    Ok(())
}

/// Initializes the schema or validates an existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), LandscapeError> {
    let tx = connection.transaction().map_err(db_err)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(db_err)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(db_err)?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(db_err)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    status TEXT NOT NULL,
                    canonical_version TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    settings_json TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS nodes (
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    node_id TEXT NOT NULL,
                    plugin_name TEXT NOT NULL,
                    plugin_version TEXT NOT NULL,
                    node_type TEXT NOT NULL,
                    config_json TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    schema_hash TEXT NOT NULL,
                    schema_mode TEXT NOT NULL,
                    schema_fields_json TEXT,
                    determinism TEXT NOT NULL,
                    sequence_in_pipeline INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (run_id, node_id)
                );
                CREATE INDEX IF NOT EXISTS idx_nodes_run
                    ON nodes (run_id, created_at, node_id);
                CREATE TABLE IF NOT EXISTS edges (
                    edge_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    from_node_id TEXT NOT NULL,
                    to_node_id TEXT NOT NULL,
                    label TEXT NOT NULL,
                    default_mode TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (run_id, from_node_id, label)
                );
                CREATE INDEX IF NOT EXISTS idx_edges_run
                    ON edges (run_id, created_at, edge_id);
                CREATE TABLE IF NOT EXISTS payloads (
                    content_hash TEXT PRIMARY KEY,
                    body BLOB,
                    size_bytes INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS rows (
                    row_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    source_node_id TEXT NOT NULL,
                    row_index INTEGER NOT NULL,
                    source_data_hash TEXT NOT NULL,
                    data_ref TEXT,
                    quarantine_error TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_rows_run
                    ON rows (run_id, created_at, row_id);
                CREATE TABLE IF NOT EXISTS tokens (
                    token_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    row_id TEXT NOT NULL REFERENCES rows(row_id),
                    branch_name TEXT,
                    fork_group_id TEXT,
                    expand_group_id TEXT,
                    join_group_id TEXT,
                    step_in_pipeline INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tokens_run
                    ON tokens (run_id, created_at, token_id);
                CREATE TABLE IF NOT EXISTS token_parents (
                    token_id TEXT NOT NULL REFERENCES tokens(token_id),
                    parent_token_id TEXT NOT NULL REFERENCES tokens(token_id),
                    ordinal INTEGER NOT NULL,
                    PRIMARY KEY (token_id, parent_token_id)
                );
                CREATE TABLE IF NOT EXISTS token_outcomes (
                    token_id TEXT PRIMARY KEY REFERENCES tokens(token_id),
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    outcome TEXT NOT NULL,
                    sink_name TEXT,
                    batch_id TEXT,
                    fork_group_id TEXT,
                    expand_group_id TEXT,
                    join_group_id TEXT,
                    error_hash TEXT,
                    recorded_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_token_outcomes_run
                    ON token_outcomes (run_id, recorded_at, token_id);
                CREATE TABLE IF NOT EXISTS node_states (
                    state_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    token_id TEXT NOT NULL REFERENCES tokens(token_id),
                    node_id TEXT NOT NULL,
                    step_index INTEGER NOT NULL,
                    attempt INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    input_hash TEXT NOT NULL,
                    output_hash TEXT,
                    duration_ms INTEGER,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_node_states_run
                    ON node_states (run_id, started_at, state_id);
                CREATE INDEX IF NOT EXISTS idx_node_states_token
                    ON node_states (token_id, started_at, state_id);
                CREATE TABLE IF NOT EXISTS routing_events (
                    event_id TEXT PRIMARY KEY,
                    state_id TEXT NOT NULL REFERENCES node_states(state_id),
                    edge_id TEXT NOT NULL REFERENCES edges(edge_id),
                    mode TEXT NOT NULL,
                    reason_json TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS call_counters (
                    state_id TEXT NOT NULL REFERENCES node_states(state_id),
                    call_type TEXT NOT NULL,
                    next_index INTEGER NOT NULL,
                    PRIMARY KEY (state_id, call_type)
                );
                CREATE TABLE IF NOT EXISTS calls (
                    call_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    state_id TEXT NOT NULL REFERENCES node_states(state_id),
                    call_index INTEGER NOT NULL,
                    call_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    request_hash TEXT NOT NULL,
                    response_hash TEXT,
                    request_ref TEXT,
                    response_ref TEXT,
                    latency_ms INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (state_id, call_type, call_index)
                );
                CREATE INDEX IF NOT EXISTS idx_calls_run
                    ON calls (run_id, created_at, call_id);
                CREATE INDEX IF NOT EXISTS idx_calls_request
                    ON calls (run_id, call_type, request_hash, created_at, call_id);
                CREATE TABLE IF NOT EXISTS batches (
                    batch_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    aggregation_node_id TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    trigger_type TEXT,
                    trigger_reason_json TEXT,
                    aggregation_state_id TEXT,
                    created_at INTEGER NOT NULL,
                    completed_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_batches_run
                    ON batches (run_id, created_at, batch_id);
                CREATE TABLE IF NOT EXISTS batch_members (
                    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
                    token_id TEXT NOT NULL REFERENCES tokens(token_id),
                    ordinal INTEGER NOT NULL,
                    PRIMARY KEY (batch_id, token_id)
                );
                CREATE TABLE IF NOT EXISTS artifacts (
                    artifact_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    produced_by_state_id TEXT NOT NULL REFERENCES node_states(state_id),
                    sink_node_id TEXT NOT NULL,
                    artifact_type TEXT NOT NULL,
                    path_or_uri TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    idempotency_key TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_artifacts_run
                    ON artifacts (run_id, created_at, artifact_id);",
            )
            .map_err(db_err)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(LandscapeError::Corrupt(format!("unsupported schema version: {value}")));
        }
    }
    tx.commit().map_err(db_err)?;
    Ok(())
}

// ============================================================================
// SECTION: Conversion Helpers
// ============================================================================

/// Returns the current time in unix microseconds.
fn now_micros() -> i64 {
    Timestamp::now().as_unix_micros()
}

/// Parses stored JSON text, failing closed on corrupt content.
fn parse_json(field: &'static str, text: &str) -> Result<Value, LandscapeError> {
    serde_json::from_str(text)
        .map_err(|err| LandscapeError::Corrupt(format!("invalid stored {field} json: {err}")))
}

/// Serializes a JSON value for storage.
fn to_json_text(field: &'static str, value: &Value) -> Result<String, LandscapeError> {
    serde_json::to_string(value)
        .map_err(|err| LandscapeError::Invalid(format!("unserializable {field}: {err}")))
}

/// Converts a stored integer into a u32 record field.
fn to_u32(field: &'static str, value: i64) -> Result<u32, LandscapeError> {
    u32::try_from(value)
        .map_err(|_| LandscapeError::Corrupt(format!("invalid stored {field}: {value}")))
}

/// Converts a stored integer into a u64 record field.
fn to_u64(field: &'static str, value: i64) -> Result<u64, LandscapeError> {
    u64::try_from(value)
        .map_err(|_| LandscapeError::Corrupt(format!("invalid stored {field}: {value}")))
}

/// Converts an in-memory u64 into a storable integer.
fn from_u64(field: &'static str, value: u64) -> Result<i64, LandscapeError> {
    i64::try_from(value).map_err(|_| LandscapeError::Invalid(format!("{field} too large: {value}")))
}

/// Applies a paging window to a SQL statement tail.
fn page_clause(page: Page) -> String {
    match page.limit {
        Some(limit) => format!(" LIMIT {limit} OFFSET {}", page.offset),
        None => {
            if page.offset == 0 {
                String::new()
            } else {
                format!(" LIMIT -1 OFFSET {}", page.offset)
            }
        }
    }
}

// ============================================================================
// SECTION: Raw Row Shapes
// ============================================================================

/// Raw run columns before enum parsing.
struct RawRun {
    /// Run identifier column.
    run_id: String,
    /// Start time column.
    started_at: i64,
    /// Completion time column.
    completed_at: Option<i64>,
    /// Status label column.
    status: String,
    /// Canonical version column.
    canonical_version: String,
    /// Config hash column.
    config_hash: String,
    /// Settings JSON column.
    settings_json: String,
}

impl RawRun {
    /// Extracts raw run columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            started_at: row.get(1)?,
            completed_at: row.get(2)?,
            status: row.get(3)?,
            canonical_version: row.get(4)?,
            config_hash: row.get(5)?,
            settings_json: row.get(6)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<RunRecord, LandscapeError> {
        Ok(RunRecord {
            run_id: RunId::new(self.run_id),
            started_at: Timestamp::from_unix_micros(self.started_at),
            completed_at: self.completed_at.map(Timestamp::from_unix_micros),
            status: RunStatus::parse(&self.status)?,
            canonical_version: self.canonical_version,
            config_hash: self.config_hash,
            settings: parse_json("run settings", &self.settings_json)?,
        })
    }
}

/// Raw node columns before enum parsing.
struct RawNode {
    /// Node identifier column.
    node_id: String,
    /// Run identifier column.
    run_id: String,
    /// Plugin name column.
    plugin_name: String,
    /// Plugin version column.
    plugin_version: String,
    /// Node type label column.
    node_type: String,
    /// Config JSON column.
    config_json: String,
    /// Config hash column.
    config_hash: String,
    /// Schema hash column.
    schema_hash: String,
    /// Schema mode label column.
    schema_mode: String,
    /// Schema field list JSON column.
    schema_fields_json: Option<String>,
    /// Determinism label column.
    determinism: String,
    /// Pipeline sequence column.
    sequence_in_pipeline: i64,
    /// Creation time column.
    created_at: i64,
}

impl RawNode {
    /// Extracts raw node columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get(0)?,
            run_id: row.get(1)?,
            plugin_name: row.get(2)?,
            plugin_version: row.get(3)?,
            node_type: row.get(4)?,
            config_json: row.get(5)?,
            config_hash: row.get(6)?,
            schema_hash: row.get(7)?,
            schema_mode: row.get(8)?,
            schema_fields_json: row.get(9)?,
            determinism: row.get(10)?,
            sequence_in_pipeline: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<NodeRecord, LandscapeError> {
        let schema_fields = match self.schema_fields_json {
            None => None,
            Some(text) => Some(
                serde_json::from_str::<Vec<String>>(&text).map_err(|err| {
                    LandscapeError::Corrupt(format!("invalid stored schema fields: {err}"))
                })?,
            ),
        };
        let schema_mode = SchemaMode::parse(&self.schema_mode)
            .map_err(|value| LandscapeError::Corrupt(format!("invalid stored schema mode: {value}")))?;
        Ok(NodeRecord {
            node_id: NodeId::new(self.node_id),
            run_id: RunId::new(self.run_id),
            plugin_name: self.plugin_name,
            plugin_version: self.plugin_version,
            node_type: NodeType::parse(&self.node_type)?,
            config: parse_json("node config", &self.config_json)?,
            config_hash: self.config_hash,
            schema_hash: self.schema_hash,
            schema_mode,
            schema_fields,
            determinism: DeterminismKind::parse(&self.determinism)?,
            sequence_in_pipeline: to_u32("sequence_in_pipeline", self.sequence_in_pipeline)?,
            created_at: Timestamp::from_unix_micros(self.created_at),
        })
    }
}

/// Raw edge columns before enum parsing.
struct RawEdge {
    /// Edge identifier column.
    edge_id: String,
    /// Run identifier column.
    run_id: String,
    /// Origin node column.
    from_node_id: String,
    /// Destination node column.
    to_node_id: String,
    /// Edge label column.
    label: String,
    /// Routing mode label column.
    default_mode: String,
    /// Creation time column.
    created_at: i64,
}

impl RawEdge {
    /// Extracts raw edge columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            edge_id: row.get(0)?,
            run_id: row.get(1)?,
            from_node_id: row.get(2)?,
            to_node_id: row.get(3)?,
            label: row.get(4)?,
            default_mode: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<EdgeRecord, LandscapeError> {
        Ok(EdgeRecord {
            edge_id: EdgeId::new(self.edge_id),
            run_id: RunId::new(self.run_id),
            from_node_id: NodeId::new(self.from_node_id),
            to_node_id: NodeId::new(self.to_node_id),
            label: self.label,
            default_mode: RoutingMode::parse(&self.default_mode)?,
            created_at: Timestamp::from_unix_micros(self.created_at),
        })
    }
}

/// Raw row columns.
struct RawRow {
    /// Row identifier column.
    row_id: String,
    /// Run identifier column.
    run_id: String,
    /// Source node column.
    source_node_id: String,
    /// Row index column.
    row_index: i64,
    /// Source data hash column.
    source_data_hash: String,
    /// Payload reference column.
    data_ref: Option<String>,
    /// Quarantine error column.
    quarantine_error: Option<String>,
    /// Creation time column.
    created_at: i64,
}

impl RawRow {
    /// Extracts raw row columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            run_id: row.get(1)?,
            source_node_id: row.get(2)?,
            row_index: row.get(3)?,
            source_data_hash: row.get(4)?,
            data_ref: row.get(5)?,
            quarantine_error: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<RowRecord, LandscapeError> {
        Ok(RowRecord {
            row_id: RowId::new(self.row_id),
            run_id: RunId::new(self.run_id),
            source_node_id: NodeId::new(self.source_node_id),
            row_index: to_u64("row_index", self.row_index)?,
            source_data_hash: self.source_data_hash,
            data_ref: self.data_ref,
            quarantine_error: self.quarantine_error,
            created_at: Timestamp::from_unix_micros(self.created_at),
        })
    }
}

/// Raw token columns.
struct RawToken {
    /// Token identifier column.
    token_id: String,
    /// Run identifier column.
    run_id: String,
    /// Row identifier column.
    row_id: String,
    /// Branch name column.
    branch_name: Option<String>,
    /// Fork group column.
    fork_group_id: Option<String>,
    /// Expand group column.
    expand_group_id: Option<String>,
    /// Join group column.
    join_group_id: Option<String>,
    /// Birth step column.
    step_in_pipeline: i64,
    /// Creation time column.
    created_at: i64,
}

impl RawToken {
    /// Extracts raw token columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token_id: row.get(0)?,
            run_id: row.get(1)?,
            row_id: row.get(2)?,
            branch_name: row.get(3)?,
            fork_group_id: row.get(4)?,
            expand_group_id: row.get(5)?,
            join_group_id: row.get(6)?,
            step_in_pipeline: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<TokenRecord, LandscapeError> {
        Ok(TokenRecord {
            token_id: TokenId::new(self.token_id),
            run_id: RunId::new(self.run_id),
            row_id: RowId::new(self.row_id),
            branch_name: self.branch_name,
            fork_group_id: self.fork_group_id.map(GroupId::new),
            expand_group_id: self.expand_group_id.map(GroupId::new),
            join_group_id: self.join_group_id.map(GroupId::new),
            step_in_pipeline: to_u32("step_in_pipeline", self.step_in_pipeline)?,
            created_at: Timestamp::from_unix_micros(self.created_at),
        })
    }
}

/// Raw token outcome columns.
struct RawOutcome {
    /// Token identifier column.
    token_id: String,
    /// Run identifier column.
    run_id: String,
    /// Outcome label column.
    outcome: String,
    /// Sink name column.
    sink_name: Option<String>,
    /// Batch referent column.
    batch_id: Option<String>,
    /// Fork group referent column.
    fork_group_id: Option<String>,
    /// Expand group referent column.
    expand_group_id: Option<String>,
    /// Join group referent column.
    join_group_id: Option<String>,
    /// Error hash referent column.
    error_hash: Option<String>,
    /// Recording time column.
    recorded_at: i64,
}

impl RawOutcome {
    /// Extracts raw outcome columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token_id: row.get(0)?,
            run_id: row.get(1)?,
            outcome: row.get(2)?,
            sink_name: row.get(3)?,
            batch_id: row.get(4)?,
            fork_group_id: row.get(5)?,
            expand_group_id: row.get(6)?,
            join_group_id: row.get(7)?,
            error_hash: row.get(8)?,
            recorded_at: row.get(9)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<TokenOutcomeRecord, LandscapeError> {
        let outcome = OutcomeKind::parse(&self.outcome)
            .map_err(|value| LandscapeError::Corrupt(format!("invalid stored outcome: {value}")))?;
        Ok(TokenOutcomeRecord {
            token_id: TokenId::new(self.token_id),
            run_id: RunId::new(self.run_id),
            outcome,
            sink_name: self.sink_name,
            batch_id: self.batch_id.map(BatchId::new),
            fork_group_id: self.fork_group_id.map(GroupId::new),
            expand_group_id: self.expand_group_id.map(GroupId::new),
            join_group_id: self.join_group_id.map(GroupId::new),
            error_hash: self.error_hash,
            recorded_at: Timestamp::from_unix_micros(self.recorded_at),
        })
    }
}

/// Raw node-state columns.
struct RawNodeState {
    /// State identifier column.
    state_id: String,
    /// Run identifier column.
    run_id: String,
    /// Token identifier column.
    token_id: String,
    /// Node identifier column.
    node_id: String,
    /// Step index column.
    step_index: i64,
    /// Attempt column.
    attempt: i64,
    /// Status label column.
    status: String,
    /// Input hash column.
    input_hash: String,
    /// Output hash column.
    output_hash: Option<String>,
    /// Duration column.
    duration_ms: Option<i64>,
    /// Start time column.
    started_at: i64,
    /// Completion time column.
    completed_at: Option<i64>,
}

impl RawNodeState {
    /// Extracts raw node-state columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            state_id: row.get(0)?,
            run_id: row.get(1)?,
            token_id: row.get(2)?,
            node_id: row.get(3)?,
            step_index: row.get(4)?,
            attempt: row.get(5)?,
            status: row.get(6)?,
            input_hash: row.get(7)?,
            output_hash: row.get(8)?,
            duration_ms: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<NodeStateRecord, LandscapeError> {
        let duration_ms = match self.duration_ms {
            None => None,
            Some(value) => Some(to_u64("duration_ms", value)?),
        };
        Ok(NodeStateRecord {
            state_id: StateId::new(self.state_id),
            run_id: RunId::new(self.run_id),
            token_id: TokenId::new(self.token_id),
            node_id: NodeId::new(self.node_id),
            step_index: to_u32("step_index", self.step_index)?,
            attempt: to_u32("attempt", self.attempt)?,
            status: NodeStateStatus::parse(&self.status)?,
            input_hash: self.input_hash,
            output_hash: self.output_hash,
            duration_ms,
            started_at: Timestamp::from_unix_micros(self.started_at),
            completed_at: self.completed_at.map(Timestamp::from_unix_micros),
        })
    }
}

/// Raw batch columns.
struct RawBatch {
    /// Batch identifier column.
    batch_id: String,
    /// Run identifier column.
    run_id: String,
    /// Aggregation node column.
    aggregation_node_id: String,
    /// Attempt column.
    attempt: i64,
    /// Status label column.
    status: String,
    /// Trigger type label column.
    trigger_type: Option<String>,
    /// Trigger reason JSON column.
    trigger_reason_json: Option<String>,
    /// Flushing state column.
    aggregation_state_id: Option<String>,
    /// Creation time column.
    created_at: i64,
    /// Completion time column.
    completed_at: Option<i64>,
}

impl RawBatch {
    /// Extracts raw batch columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            batch_id: row.get(0)?,
            run_id: row.get(1)?,
            aggregation_node_id: row.get(2)?,
            attempt: row.get(3)?,
            status: row.get(4)?,
            trigger_type: row.get(5)?,
            trigger_reason_json: row.get(6)?,
            aggregation_state_id: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<BatchRecord, LandscapeError> {
        let trigger_type = match self.trigger_type {
            None => None,
            Some(label) => Some(TriggerKind::parse(&label)?),
        };
        let trigger_reason = match self.trigger_reason_json {
            None => None,
            Some(text) => Some(parse_json("batch trigger reason", &text)?),
        };
        Ok(BatchRecord {
            batch_id: BatchId::new(self.batch_id),
            run_id: RunId::new(self.run_id),
            aggregation_node_id: NodeId::new(self.aggregation_node_id),
            attempt: to_u32("batch attempt", self.attempt)?,
            status: BatchStatus::parse(&self.status)?,
            trigger_type,
            trigger_reason,
            aggregation_state_id: self.aggregation_state_id.map(StateId::new),
            created_at: Timestamp::from_unix_micros(self.created_at),
            completed_at: self.completed_at.map(Timestamp::from_unix_micros),
        })
    }
}

/// Raw call columns.
struct RawCall {
    /// Call identifier column.
    call_id: String,
    /// Run identifier column.
    run_id: String,
    /// State identifier column.
    state_id: String,
    /// Call index column.
    call_index: i64,
    /// Call type label column.
    call_type: String,
    /// Status label column.
    status: String,
    /// Request hash column.
    request_hash: String,
    /// Response hash column.
    response_hash: Option<String>,
    /// Request payload reference column.
    request_ref: Option<String>,
    /// Response payload reference column.
    response_ref: Option<String>,
    /// Latency column.
    latency_ms: i64,
    /// Creation time column.
    created_at: i64,
}

impl RawCall {
    /// Extracts raw call columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            call_id: row.get(0)?,
            run_id: row.get(1)?,
            state_id: row.get(2)?,
            call_index: row.get(3)?,
            call_type: row.get(4)?,
            status: row.get(5)?,
            request_hash: row.get(6)?,
            response_hash: row.get(7)?,
            request_ref: row.get(8)?,
            response_ref: row.get(9)?,
            latency_ms: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<CallRecord, LandscapeError> {
        Ok(CallRecord {
            call_id: CallId::new(self.call_id),
            run_id: RunId::new(self.run_id),
            state_id: StateId::new(self.state_id),
            call_index: to_u32("call_index", self.call_index)?,
            call_type: CallType::parse(&self.call_type)?,
            status: CallStatus::parse(&self.status)?,
            request_hash: self.request_hash,
            response_hash: self.response_hash,
            request_ref: self.request_ref,
            response_ref: self.response_ref,
            latency_ms: to_u64("latency_ms", self.latency_ms)?,
            created_at: Timestamp::from_unix_micros(self.created_at),
        })
    }
}

/// Raw artifact columns.
struct RawArtifact {
    /// Artifact identifier column.
    artifact_id: String,
    /// Run identifier column.
    run_id: String,
    /// Producing state column.
    produced_by_state_id: String,
    /// Sink node column.
    sink_node_id: String,
    /// Artifact type column.
    artifact_type: String,
    /// Destination column.
    path_or_uri: String,
    /// Content hash column.
    content_hash: String,
    /// Size column.
    size_bytes: i64,
    /// Idempotency key column.
    idempotency_key: Option<String>,
    /// Creation time column.
    created_at: i64,
}

impl RawArtifact {
    /// Extracts raw artifact columns from a result row.
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            artifact_id: row.get(0)?,
            run_id: row.get(1)?,
            produced_by_state_id: row.get(2)?,
            sink_node_id: row.get(3)?,
            artifact_type: row.get(4)?,
            path_or_uri: row.get(5)?,
            content_hash: row.get(6)?,
            size_bytes: row.get(7)?,
            idempotency_key: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    /// Converts raw columns into a typed record, failing closed.
    fn into_record(self) -> Result<ArtifactRecord, LandscapeError> {
        Ok(ArtifactRecord {
            artifact_id: ArtifactId::new(self.artifact_id),
            run_id: RunId::new(self.run_id),
            produced_by_state_id: StateId::new(self.produced_by_state_id),
            sink_node_id: NodeId::new(self.sink_node_id),
            artifact_type: self.artifact_type,
            path_or_uri: self.path_or_uri,
            content_hash: self.content_hash,
            size_bytes: to_u64("size_bytes", self.size_bytes)?,
            idempotency_key: self.idempotency_key,
            created_at: Timestamp::from_unix_micros(self.created_at),
        })
    }
}

// ============================================================================
// SECTION: Query Helpers
// ============================================================================

/// Column list selected for token rows.
const TOKEN_COLUMNS: &str = "token_id, run_id, row_id, branch_name, fork_group_id, \
                             expand_group_id, join_group_id, step_in_pipeline, created_at";

/// Column list selected for node-state rows.
const NODE_STATE_COLUMNS: &str = "state_id, run_id, token_id, node_id, step_index, attempt, \
                                  status, input_hash, output_hash, duration_ms, started_at, \
                                  completed_at";

/// Column list selected for call rows.
const CALL_COLUMNS: &str = "call_id, run_id, state_id, call_index, call_type, status, \
                            request_hash, response_hash, request_ref, response_ref, latency_ms, \
                            created_at";

/// Column list selected for batch rows.
const BATCH_COLUMNS: &str = "batch_id, run_id, aggregation_node_id, attempt, status, \
                             trigger_type, trigger_reason_json, aggregation_state_id, \
                             created_at, completed_at";

/// Inserts a content-addressed payload, collapsing duplicate bodies.
fn insert_payload(tx: &rusqlite::Transaction<'_>, bytes: &[u8]) -> Result<String, LandscapeError> {
    let content_hash = hash_bytes(bytes).value;
    let size = from_u64("payload size", bytes.len() as u64)?;
    tx.execute(
        "INSERT INTO payloads (content_hash, body, size_bytes, created_at) VALUES (?1, ?2, ?3, \
         ?4) ON CONFLICT(content_hash) DO NOTHING",
        params![content_hash, bytes, size, now_micros()],
    )
    .map_err(db_err)?;
    Ok(content_hash)
}

/// Inserts one token row inside an open transaction.
#[allow(clippy::too_many_arguments, reason = "Columns mirror the token record shape.")]
fn insert_token(
    tx: &rusqlite::Transaction<'_>,
    run_id: &RunId,
    row_id: &RowId,
    token_id: &TokenId,
    branch_name: Option<&str>,
    fork_group_id: Option<&GroupId>,
    expand_group_id: Option<&GroupId>,
    join_group_id: Option<&GroupId>,
    step_in_pipeline: u32,
    created_at: i64,
) -> Result<(), LandscapeError> {
    tx.execute(
        "INSERT INTO tokens (token_id, run_id, row_id, branch_name, fork_group_id, \
         expand_group_id, join_group_id, step_in_pipeline, created_at) VALUES (?1, ?2, ?3, ?4, \
         ?5, ?6, ?7, ?8, ?9)",
        params![
            token_id.as_str(),
            run_id.as_str(),
            row_id.as_str(),
            branch_name,
            fork_group_id.map(GroupId::as_str),
            expand_group_id.map(GroupId::as_str),
            join_group_id.map(GroupId::as_str),
            step_in_pipeline,
            created_at,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Inserts one token-parent link inside an open transaction.
fn insert_token_parent(
    tx: &rusqlite::Transaction<'_>,
    token_id: &TokenId,
    parent_token_id: &TokenId,
    ordinal: u32,
) -> Result<(), LandscapeError> {
    tx.execute(
        "INSERT INTO token_parents (token_id, parent_token_id, ordinal) VALUES (?1, ?2, ?3)",
        params![token_id.as_str(), parent_token_id.as_str(), ordinal],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Inserts one outcome row inside an open transaction.
fn insert_outcome(
    tx: &rusqlite::Transaction<'_>,
    run_id: &RunId,
    token_id: &TokenId,
    outcome: &TokenOutcome,
) -> Result<(), LandscapeError> {
    let kind = outcome.kind().label();
    let (sink_name, batch_id, fork_group, expand_group, join_group, error_hash) = match outcome {
        TokenOutcome::Completed => (None, None, None, None, None, None),
        TokenOutcome::Failed {
            error_hash,
        } => (None, None, None, None, None, Some(error_hash.clone())),
        TokenOutcome::Routed {
            sink_name,
        } => (Some(sink_name.clone()), None, None, None, None, None),
        TokenOutcome::Forked {
            fork_group_id,
        } => (None, None, Some(fork_group_id.as_str().to_string()), None, None, None),
        TokenOutcome::Expanded {
            expand_group_id,
        } => (None, None, None, Some(expand_group_id.as_str().to_string()), None, None),
        TokenOutcome::Coalesced {
            join_group_id,
        } => (None, None, None, None, Some(join_group_id.as_str().to_string()), None),
        TokenOutcome::Buffered {
            batch_id,
        } => (None, batch_id.as_ref().map(|id| id.as_str().to_string()), None, None, None, None),
        TokenOutcome::ConsumedInBatch {
            batch_id,
        } => (None, batch_id.as_ref().map(|id| id.as_str().to_string()), None, None, None, None),
        TokenOutcome::Quarantined {
            error_hash,
        } => (None, None, None, None, None, error_hash.clone()),
    };
    // A `buffered` outcome is non-terminal bookkeeping and may be superseded;
    // terminal outcomes are immutable. The upsert only fires when the existing
    // outcome is `buffered`; a skipped upsert surfaces as zero changed rows.
    let changed = tx
        .execute(
            "INSERT INTO token_outcomes (token_id, run_id, outcome, sink_name, batch_id, \
             fork_group_id, expand_group_id, join_group_id, error_hash, recorded_at) VALUES (?1, \
             ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) ON CONFLICT(token_id) DO UPDATE SET outcome = \
             excluded.outcome, sink_name = excluded.sink_name, batch_id = excluded.batch_id, \
             fork_group_id = excluded.fork_group_id, expand_group_id = excluded.expand_group_id, \
             join_group_id = excluded.join_group_id, error_hash = excluded.error_hash, \
             recorded_at = excluded.recorded_at WHERE token_outcomes.outcome = 'buffered'",
            params![
                token_id.as_str(),
                run_id.as_str(),
                kind,
                sink_name,
                batch_id,
                fork_group,
                expand_group,
                join_group,
                error_hash,
                now_micros(),
            ],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(LandscapeError::Conflict(format!(
            "token outcome already recorded: {}",
            token_id.as_str()
        )));
    }
    Ok(())
}

/// Loads one batch record inside an open connection.
fn fetch_batch(
    connection: &Connection,
    batch_id: &BatchId,
) -> Result<Option<BatchRecord>, LandscapeError> {
    let raw = connection
        .query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?1"),
            params![batch_id.as_str()],
            RawBatch::read,
        )
        .optional()
        .map_err(db_err)?;
    raw.map(RawBatch::into_record).transpose()
}

// ============================================================================
// SECTION: Landscape Implementation
// ============================================================================

impl Landscape for SqliteLandscape {
    fn begin_run(
        &self,
        settings: &Value,
        canonical_version: &str,
    ) -> Result<RunRecord, LandscapeError> {
        let run_id = RunId::generate();
        let config_hash = stable_hash(settings)?;
        let settings_json = to_json_text("run settings", settings)?;
        let started_at = now_micros();
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO runs (run_id, started_at, completed_at, status, canonical_version, \
                 config_hash, settings_json) VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6)",
                params![
                    run_id.as_str(),
                    started_at,
                    RunStatus::Running.label(),
                    canonical_version,
                    config_hash,
                    settings_json,
                ],
            )
            .map_err(db_err)?;
        Ok(RunRecord {
            run_id,
            started_at: Timestamp::from_unix_micros(started_at),
            completed_at: None,
            status: RunStatus::Running,
            canonical_version: canonical_version.to_string(),
            config_hash,
            settings: settings.clone(),
        })
    }

    fn complete_run(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord, LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(current) = current else {
            return Err(LandscapeError::NotFound(format!("run not found: {}", run_id.as_str())));
        };
        if RunStatus::parse(&current)? != RunStatus::Running {
            return Err(LandscapeError::Conflict(format!(
                "run already finalised: {}",
                run_id.as_str()
            )));
        }
        tx.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2 WHERE run_id = ?3",
            params![status.label(), now_micros(), run_id.as_str()],
        )
        .map_err(db_err)?;
        let raw = tx
            .query_row(
                "SELECT run_id, started_at, completed_at, status, canonical_version, config_hash, \
                 settings_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                RawRun::read,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        raw.into_record()
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>, LandscapeError> {
        let guard = self.lock()?;
        let raw = guard
            .query_row(
                "SELECT run_id, started_at, completed_at, status, canonical_version, config_hash, \
                 settings_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                RawRun::read,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(RawRun::into_record).transpose()
    }

    fn register_node(&self, registration: NodeRegistration) -> Result<NodeRecord, LandscapeError> {
        let node_id = registration.node_id.unwrap_or_else(NodeId::generate);
        let config_hash = stable_hash(&registration.config)?;
        let schema_hash = registration.schema.schema_hash()?.value;
        let config_json = to_json_text("node config", &registration.config)?;
        let schema_fields_json = match &registration.schema.fields {
            None => None,
            Some(fields) => Some(serde_json::to_string(fields).map_err(|err| {
                LandscapeError::Invalid(format!("unserializable schema fields: {err}"))
            })?),
        };
        let created_at = now_micros();
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let frozen: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tokens WHERE run_id = ?1)",
                params![registration.run_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if frozen {
            return Err(LandscapeError::Conflict(
                "node registration is frozen once the run has tokens".to_string(),
            ));
        }
        tx.execute(
            "INSERT INTO nodes (run_id, node_id, plugin_name, plugin_version, node_type, \
             config_json, config_hash, schema_hash, schema_mode, schema_fields_json, determinism, \
             sequence_in_pipeline, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
             ?11, ?12, ?13)",
            params![
                registration.run_id.as_str(),
                node_id.as_str(),
                registration.plugin_name,
                registration.plugin_version,
                registration.node_type.label(),
                config_json,
                config_hash,
                schema_hash,
                registration.schema.mode.label(),
                schema_fields_json,
                registration.determinism.label(),
                registration.sequence_in_pipeline,
                created_at,
            ],
        )
        .map_err(|err| constraint_err(err, "node already registered"))?;
        tx.commit().map_err(db_err)?;
        Ok(NodeRecord {
            node_id,
            run_id: registration.run_id,
            plugin_name: registration.plugin_name,
            plugin_version: registration.plugin_version,
            node_type: registration.node_type,
            config: registration.config,
            config_hash,
            schema_hash,
            schema_mode: registration.schema.mode,
            schema_fields: registration.schema.fields,
            determinism: registration.determinism,
            sequence_in_pipeline: registration.sequence_in_pipeline,
            created_at: Timestamp::from_unix_micros(created_at),
        })
    }

    fn get_nodes(&self, run_id: &RunId) -> Result<Vec<NodeRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT node_id, run_id, plugin_name, plugin_version, node_type, config_json, \
                 config_hash, schema_hash, schema_mode, schema_fields_json, determinism, \
                 sequence_in_pipeline, created_at FROM nodes WHERE run_id = ?1 ORDER BY \
                 created_at, rowid",
            )
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawNode::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawNode::into_record).collect()
    }

    fn register_edge(
        &self,
        run_id: &RunId,
        from_node_id: &NodeId,
        to_node_id: &NodeId,
        label: &str,
        default_mode: RoutingMode,
    ) -> Result<EdgeRecord, LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let existing = tx
            .query_row(
                "SELECT edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
                 created_at FROM edges WHERE run_id = ?1 AND from_node_id = ?2 AND label = ?3",
                params![run_id.as_str(), from_node_id.as_str(), label],
                RawEdge::read,
            )
            .optional()
            .map_err(db_err)?;
        if let Some(raw) = existing {
            return raw.into_record();
        }
        let edge_id = EdgeId::generate();
        let created_at = now_micros();
        tx.execute(
            "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge_id.as_str(),
                run_id.as_str(),
                from_node_id.as_str(),
                to_node_id.as_str(),
                label,
                default_mode.label(),
                created_at,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(EdgeRecord {
            edge_id,
            run_id: run_id.clone(),
            from_node_id: from_node_id.clone(),
            to_node_id: to_node_id.clone(),
            label: label.to_string(),
            default_mode,
            created_at: Timestamp::from_unix_micros(created_at),
        })
    }

    fn get_edges(&self, run_id: &RunId) -> Result<Vec<EdgeRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
                 created_at FROM edges WHERE run_id = ?1 ORDER BY created_at, rowid",
            )
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawEdge::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawEdge::into_record).collect()
    }

    fn create_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        data: &PipelineRow,
    ) -> Result<RowRecord, LandscapeError> {
        let row_id = RowId::generate();
        let bytes = canonical_json_bytes(data.as_map())?;
        let created_at = now_micros();
        let row_index_value = from_u64("row_index", row_index)?;
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let data_ref = insert_payload(&tx, &bytes)?;
        tx.execute(
            "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, \
             data_ref, quarantine_error, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
            params![
                row_id.as_str(),
                run_id.as_str(),
                source_node_id.as_str(),
                row_index_value,
                data_ref,
                data_ref,
                created_at,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(RowRecord {
            row_id,
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash: data_ref.clone(),
            data_ref: Some(data_ref),
            quarantine_error: None,
            created_at: Timestamp::from_unix_micros(created_at),
        })
    }

    fn create_quarantined_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        raw_data: &str,
        error: &str,
    ) -> Result<RowRecord, LandscapeError> {
        let row_id = RowId::generate();
        let created_at = now_micros();
        let row_index_value = from_u64("row_index", row_index)?;
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let data_ref = insert_payload(&tx, raw_data.as_bytes())?;
        tx.execute(
            "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, \
             data_ref, quarantine_error, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row_id.as_str(),
                run_id.as_str(),
                source_node_id.as_str(),
                row_index_value,
                data_ref,
                data_ref,
                error,
                created_at,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(RowRecord {
            row_id,
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash: data_ref.clone(),
            data_ref: Some(data_ref),
            quarantine_error: Some(error.to_string()),
            created_at: Timestamp::from_unix_micros(created_at),
        })
    }

    fn get_rows(&self, run_id: &RunId, page: Page) -> Result<Vec<RowRecord>, LandscapeError> {
        let guard = self.lock()?;
        let sql = format!(
            "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, data_ref, \
             quarantine_error, created_at FROM rows WHERE run_id = ?1 ORDER BY created_at, \
             rowid{}",
            page_clause(page)
        );
        let mut statement = guard.prepare(&sql).map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawRow::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawRow::into_record).collect()
    }

    fn create_token(
        &self,
        run_id: &RunId,
        row_id: &RowId,
        step_in_pipeline: u32,
    ) -> Result<TokenRecord, LandscapeError> {
        let token_id = TokenId::generate();
        let created_at = now_micros();
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        insert_token(&tx, run_id, row_id, &token_id, None, None, None, None, step_in_pipeline, created_at)?;
        tx.commit().map_err(db_err)?;
        Ok(TokenRecord {
            token_id,
            run_id: run_id.clone(),
            row_id: row_id.clone(),
            branch_name: None,
            fork_group_id: None,
            expand_group_id: None,
            join_group_id: None,
            step_in_pipeline,
            created_at: Timestamp::from_unix_micros(created_at),
        })
    }

    fn fork_token(
        &self,
        run_id: &RunId,
        parent_token_id: &TokenId,
        row_id: &RowId,
        branches: &[String],
        step_in_pipeline: u32,
    ) -> Result<(Vec<TokenRecord>, GroupId), LandscapeError> {
        if branches.is_empty() {
            return Err(LandscapeError::Invalid("fork requires at least one branch".to_string()));
        }
        let fork_group_id = GroupId::generate();
        let created_at = now_micros();
        let mut records = Vec::with_capacity(branches.len());
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        for branch in branches {
            let token_id = TokenId::generate();
            insert_token(
                &tx,
                run_id,
                row_id,
                &token_id,
                Some(branch.as_str()),
                Some(&fork_group_id),
                None,
                None,
                step_in_pipeline,
                created_at,
            )?;
            insert_token_parent(&tx, &token_id, parent_token_id, 0)?;
            records.push(TokenRecord {
                token_id,
                run_id: run_id.clone(),
                row_id: row_id.clone(),
                branch_name: Some(branch.clone()),
                fork_group_id: Some(fork_group_id.clone()),
                expand_group_id: None,
                join_group_id: None,
                step_in_pipeline,
                created_at: Timestamp::from_unix_micros(created_at),
            });
        }
        tx.commit().map_err(db_err)?;
        Ok((records, fork_group_id))
    }

    fn expand_token(
        &self,
        run_id: &RunId,
        parent_token_id: &TokenId,
        row_id: &RowId,
        child_count: usize,
        step_in_pipeline: u32,
    ) -> Result<(Vec<TokenRecord>, GroupId), LandscapeError> {
        if child_count == 0 {
            return Err(LandscapeError::Invalid("expand requires at least one child".to_string()));
        }
        let expand_group_id = GroupId::generate();
        let created_at = now_micros();
        let mut records = Vec::with_capacity(child_count);
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        for _ in 0..child_count {
            let token_id = TokenId::generate();
            insert_token(
                &tx,
                run_id,
                row_id,
                &token_id,
                None,
                None,
                Some(&expand_group_id),
                None,
                step_in_pipeline,
                created_at,
            )?;
            insert_token_parent(&tx, &token_id, parent_token_id, 0)?;
            records.push(TokenRecord {
                token_id,
                run_id: run_id.clone(),
                row_id: row_id.clone(),
                branch_name: None,
                fork_group_id: None,
                expand_group_id: Some(expand_group_id.clone()),
                join_group_id: None,
                step_in_pipeline,
                created_at: Timestamp::from_unix_micros(created_at),
            });
        }
        tx.commit().map_err(db_err)?;
        Ok((records, expand_group_id))
    }

    fn coalesce_tokens(
        &self,
        run_id: &RunId,
        parent_token_ids: &[TokenId],
        row_id: &RowId,
        step_in_pipeline: u32,
    ) -> Result<(TokenRecord, GroupId), LandscapeError> {
        if parent_token_ids.is_empty() {
            return Err(LandscapeError::Invalid(
                "coalesce requires at least one parent".to_string(),
            ));
        }
        let join_group_id = GroupId::generate();
        let token_id = TokenId::generate();
        let created_at = now_micros();
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        insert_token(
            &tx,
            run_id,
            row_id,
            &token_id,
            None,
            None,
            None,
            Some(&join_group_id),
            step_in_pipeline,
            created_at,
        )?;
        for (ordinal, parent) in parent_token_ids.iter().enumerate() {
            let ordinal = u32::try_from(ordinal)
                .map_err(|_| LandscapeError::Invalid("too many coalesce parents".to_string()))?;
            insert_token_parent(&tx, &token_id, parent, ordinal)?;
            insert_outcome(
                &tx,
                run_id,
                parent,
                &TokenOutcome::Coalesced {
                    join_group_id: join_group_id.clone(),
                },
            )?;
        }
        tx.commit().map_err(db_err)?;
        Ok((
            TokenRecord {
                token_id,
                run_id: run_id.clone(),
                row_id: row_id.clone(),
                branch_name: None,
                fork_group_id: None,
                expand_group_id: None,
                join_group_id: Some(join_group_id.clone()),
                step_in_pipeline,
                created_at: Timestamp::from_unix_micros(created_at),
            },
            join_group_id,
        ))
    }

    fn get_tokens(&self, run_id: &RunId, page: Page) -> Result<Vec<TokenRecord>, LandscapeError> {
        let guard = self.lock()?;
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE run_id = ?1 ORDER BY created_at, rowid{}",
            page_clause(page)
        );
        let mut statement = guard.prepare(&sql).map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawToken::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawToken::into_record).collect()
    }

    fn get_token(&self, token_id: &TokenId) -> Result<Option<TokenRecord>, LandscapeError> {
        let guard = self.lock()?;
        let raw = guard
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_id = ?1"),
                params![token_id.as_str()],
                RawToken::read,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(RawToken::into_record).transpose()
    }

    fn get_token_parents(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TokenParentRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT tp.token_id, tp.parent_token_id, tp.ordinal FROM token_parents tp JOIN \
                 tokens t ON t.token_id = tp.token_id WHERE t.run_id = ?1 ORDER BY t.created_at, \
                 t.rowid, tp.ordinal",
            )
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter()
            .map(|(token_id, parent_token_id, ordinal)| {
                Ok(TokenParentRecord {
                    token_id: TokenId::new(token_id),
                    parent_token_id: TokenId::new(parent_token_id),
                    ordinal: to_u32("parent ordinal", ordinal)?,
                })
            })
            .collect()
    }

    fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        outcome: &TokenOutcome,
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        insert_outcome(&tx, run_id, token_id, outcome)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn get_token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcomeRecord>, LandscapeError> {
        let guard = self.lock()?;
        let raw = guard
            .query_row(
                "SELECT token_id, run_id, outcome, sink_name, batch_id, fork_group_id, \
                 expand_group_id, join_group_id, error_hash, recorded_at FROM token_outcomes \
                 WHERE token_id = ?1",
                params![token_id.as_str()],
                RawOutcome::read,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(RawOutcome::into_record).transpose()
    }

    fn get_token_outcomes(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TokenOutcomeRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT token_id, run_id, outcome, sink_name, batch_id, fork_group_id, \
                 expand_group_id, join_group_id, error_hash, recorded_at FROM token_outcomes \
                 WHERE run_id = ?1 ORDER BY recorded_at, rowid",
            )
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawOutcome::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawOutcome::into_record).collect()
    }

    fn begin_node_state(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: &str,
    ) -> Result<NodeStateRecord, LandscapeError> {
        let state_id = StateId::generate();
        let started_at = now_micros();
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO node_states (state_id, run_id, token_id, node_id, step_index, \
                 attempt, status, input_hash, output_hash, duration_ms, started_at, completed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9, NULL)",
                params![
                    state_id.as_str(),
                    run_id.as_str(),
                    token_id.as_str(),
                    node_id.as_str(),
                    step_index,
                    attempt,
                    NodeStateStatus::Running.label(),
                    input_hash,
                    started_at,
                ],
            )
            .map_err(db_err)?;
        Ok(NodeStateRecord {
            state_id,
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            node_id: node_id.clone(),
            step_index,
            attempt,
            status: NodeStateStatus::Running,
            input_hash: input_hash.to_string(),
            output_hash: None,
            duration_ms: None,
            started_at: Timestamp::from_unix_micros(started_at),
            completed_at: None,
        })
    }

    fn complete_node_state(
        &self,
        state_id: &StateId,
        status: NodeStateStatus,
        output_hash: Option<&str>,
    ) -> Result<NodeStateRecord, LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let started_at: Option<i64> = tx
            .query_row(
                "SELECT started_at FROM node_states WHERE state_id = ?1",
                params![state_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(started_at) = started_at else {
            return Err(LandscapeError::NotFound(format!(
                "node state not found: {}",
                state_id.as_str()
            )));
        };
        let completed_at = now_micros();
        let duration_ms = (completed_at.saturating_sub(started_at)).max(0) / 1_000;
        tx.execute(
            "UPDATE node_states SET status = ?1, output_hash = ?2, duration_ms = ?3, \
             completed_at = ?4 WHERE state_id = ?5",
            params![status.label(), output_hash, duration_ms, completed_at, state_id.as_str()],
        )
        .map_err(db_err)?;
        let raw = tx
            .query_row(
                &format!("SELECT {NODE_STATE_COLUMNS} FROM node_states WHERE state_id = ?1"),
                params![state_id.as_str()],
                RawNodeState::read,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        raw.into_record()
    }

    fn get_node_states_for_token(
        &self,
        token_id: &TokenId,
    ) -> Result<Vec<NodeStateRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(&format!(
                "SELECT {NODE_STATE_COLUMNS} FROM node_states WHERE token_id = ?1 ORDER BY \
                 started_at, rowid"
            ))
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![token_id.as_str()], RawNodeState::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawNodeState::into_record).collect()
    }

    fn get_node_states(&self, run_id: &RunId) -> Result<Vec<NodeStateRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(&format!(
                "SELECT {NODE_STATE_COLUMNS} FROM node_states WHERE run_id = ?1 ORDER BY \
                 started_at, rowid"
            ))
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawNodeState::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawNodeState::into_record).collect()
    }

    fn record_routing_event(
        &self,
        state_id: &StateId,
        edge_id: &EdgeId,
        mode: RoutingMode,
        reason: &Value,
    ) -> Result<RoutingEventRecord, LandscapeError> {
        let event_id = rowscape_core::identifiers::opaque_id();
        let reason_json = to_json_text("routing reason", reason)?;
        let recorded_at = now_micros();
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO routing_events (event_id, state_id, edge_id, mode, reason_json, \
                 recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event_id,
                    state_id.as_str(),
                    edge_id.as_str(),
                    mode.label(),
                    reason_json,
                    recorded_at,
                ],
            )
            .map_err(db_err)?;
        Ok(RoutingEventRecord {
            event_id,
            state_id: state_id.clone(),
            edge_id: edge_id.clone(),
            mode,
            reason: reason.clone(),
            recorded_at: Timestamp::from_unix_micros(recorded_at),
        })
    }

    fn get_routing_events(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<RoutingEventRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT re.event_id, re.state_id, re.edge_id, re.mode, re.reason_json, \
                 re.recorded_at FROM routing_events re JOIN node_states ns ON ns.state_id = \
                 re.state_id WHERE ns.run_id = ?1 ORDER BY re.recorded_at, re.rowid",
            )
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter()
            .map(|(event_id, state_id, edge_id, mode, reason_json, recorded_at)| {
                Ok(RoutingEventRecord {
                    event_id,
                    state_id: StateId::new(state_id),
                    edge_id: EdgeId::new(edge_id),
                    mode: RoutingMode::parse(&mode)?,
                    reason: parse_json("routing reason", &reason_json)?,
                    recorded_at: Timestamp::from_unix_micros(recorded_at),
                })
            })
            .collect()
    }

    fn allocate_call_index(
        &self,
        state_id: &StateId,
        call_type: CallType,
    ) -> Result<u32, LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO call_counters (state_id, call_type, next_index) VALUES (?1, ?2, 1) ON \
             CONFLICT(state_id, call_type) DO UPDATE SET next_index = next_index + 1",
            params![state_id.as_str(), call_type.label()],
        )
        .map_err(|err| constraint_err(err, "call counter references an unknown node state"))?;
        let next_index: i64 = tx
            .query_row(
                "SELECT next_index FROM call_counters WHERE state_id = ?1 AND call_type = ?2",
                params![state_id.as_str(), call_type.label()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        to_u32("call index", next_index - 1)
    }

    fn record_call(&self, call: CallSpec) -> Result<CallRecord, LandscapeError> {
        let call_id = CallId::generate();
        let request_bytes = canonical_json_bytes(&call.request_data)?;
        let response_bytes = match &call.response_data {
            None => None,
            Some(value) => Some(canonical_json_bytes(value)?),
        };
        let latency = from_u64("latency_ms", call.latency_ms)?;
        let created_at = now_micros();
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let request_ref = insert_payload(&tx, &request_bytes)?;
        let response_ref = match &response_bytes {
            None => None,
            Some(bytes) => Some(insert_payload(&tx, bytes)?),
        };
        tx.execute(
            "INSERT INTO calls (call_id, run_id, state_id, call_index, call_type, status, \
             request_hash, response_hash, request_ref, response_ref, latency_ms, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                call_id.as_str(),
                call.run_id.as_str(),
                call.state_id.as_str(),
                call.call_index,
                call.call_type.label(),
                call.status.label(),
                request_ref,
                response_ref,
                request_ref,
                response_ref,
                latency,
                created_at,
            ],
        )
        .map_err(|err| constraint_err(err, "duplicate call index or unknown node state"))?;
        tx.commit().map_err(db_err)?;
        Ok(CallRecord {
            call_id,
            run_id: call.run_id,
            state_id: call.state_id,
            call_index: call.call_index,
            call_type: call.call_type,
            status: call.status,
            request_hash: request_ref.clone(),
            response_hash: response_ref.clone(),
            request_ref: Some(request_ref),
            response_ref,
            latency_ms: call.latency_ms,
            created_at: Timestamp::from_unix_micros(created_at),
        })
    }

    fn get_calls(&self, run_id: &RunId) -> Result<Vec<CallRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(&format!(
                "SELECT {CALL_COLUMNS} FROM calls WHERE run_id = ?1 ORDER BY created_at, rowid"
            ))
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawCall::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawCall::into_record).collect()
    }

    fn find_calls_by_request_hash(
        &self,
        run_id: &RunId,
        call_type: CallType,
        request_hash: &str,
    ) -> Result<Vec<CallRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(&format!(
                "SELECT {CALL_COLUMNS} FROM calls WHERE run_id = ?1 AND call_type = ?2 AND \
                 request_hash = ?3 ORDER BY created_at, rowid"
            ))
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str(), call_type.label(), request_hash], RawCall::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawCall::into_record).collect()
    }

    fn create_batch(
        &self,
        run_id: &RunId,
        aggregation_node_id: &NodeId,
        attempt: u32,
    ) -> Result<BatchRecord, LandscapeError> {
        let batch_id = BatchId::generate();
        let created_at = now_micros();
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO batches (batch_id, run_id, aggregation_node_id, attempt, status, \
                 trigger_type, trigger_reason_json, aggregation_state_id, created_at, \
                 completed_at) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, NULL)",
                params![
                    batch_id.as_str(),
                    run_id.as_str(),
                    aggregation_node_id.as_str(),
                    attempt,
                    BatchStatus::Draft.label(),
                    created_at,
                ],
            )
            .map_err(db_err)?;
        Ok(BatchRecord {
            batch_id,
            run_id: run_id.clone(),
            aggregation_node_id: aggregation_node_id.clone(),
            attempt,
            status: BatchStatus::Draft,
            trigger_type: None,
            trigger_reason: None,
            aggregation_state_id: None,
            created_at: Timestamp::from_unix_micros(created_at),
            completed_at: None,
        })
    }

    fn add_batch_member(
        &self,
        batch_id: &BatchId,
        token_id: &TokenId,
        ordinal: u32,
    ) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
                params![batch_id.as_str(), token_id.as_str(), ordinal],
            )
            .map_err(|err| constraint_err(err, "token is already a member of the batch"))?;
        Ok(())
    }

    fn update_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
    ) -> Result<BatchRecord, LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE batches SET status = ?1 WHERE batch_id = ?2",
                params![status.label(), batch_id.as_str()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LandscapeError::NotFound(format!(
                "batch not found: {}",
                batch_id.as_str()
            )));
        }
        let raw = tx
            .query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?1"),
                params![batch_id.as_str()],
                RawBatch::read,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        raw.into_record()
    }

    fn complete_batch(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
        trigger_type: TriggerKind,
        trigger_reason: Option<&Value>,
        aggregation_state_id: Option<&StateId>,
    ) -> Result<BatchRecord, LandscapeError> {
        if status != BatchStatus::Completed && status != BatchStatus::Failed {
            return Err(LandscapeError::Invalid(
                "complete_batch requires a terminal status".to_string(),
            ));
        }
        let reason_json = match trigger_reason {
            None => None,
            Some(value) => Some(to_json_text("batch trigger reason", value)?),
        };
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE batches SET status = ?1, trigger_type = ?2, trigger_reason_json = ?3, \
                 aggregation_state_id = ?4, completed_at = ?5 WHERE batch_id = ?6",
                params![
                    status.label(),
                    trigger_type.label(),
                    reason_json,
                    aggregation_state_id.map(StateId::as_str),
                    now_micros(),
                    batch_id.as_str(),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LandscapeError::NotFound(format!(
                "batch not found: {}",
                batch_id.as_str()
            )));
        }
        let raw = tx
            .query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?1"),
                params![batch_id.as_str()],
                RawBatch::read,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        raw.into_record()
    }

    fn retry_batch(&self, batch_id: &BatchId) -> Result<BatchRecord, LandscapeError> {
        let new_batch_id = BatchId::generate();
        let created_at = now_micros();
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db_err)?;
        let prior = tx
            .query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?1"),
                params![batch_id.as_str()],
                RawBatch::read,
            )
            .optional()
            .map_err(db_err)?;
        let Some(prior) = prior else {
            return Err(LandscapeError::NotFound(format!(
                "batch not found: {}",
                batch_id.as_str()
            )));
        };
        let prior = prior.into_record()?;
        let attempt = prior.attempt + 1;
        tx.execute(
            "INSERT INTO batches (batch_id, run_id, aggregation_node_id, attempt, status, \
             trigger_type, trigger_reason_json, aggregation_state_id, created_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, NULL)",
            params![
                new_batch_id.as_str(),
                prior.run_id.as_str(),
                prior.aggregation_node_id.as_str(),
                attempt,
                BatchStatus::Draft.label(),
                created_at,
            ],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO batch_members (batch_id, token_id, ordinal) SELECT ?1, token_id, \
             ordinal FROM batch_members WHERE batch_id = ?2",
            params![new_batch_id.as_str(), batch_id.as_str()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(BatchRecord {
            batch_id: new_batch_id,
            run_id: prior.run_id,
            aggregation_node_id: prior.aggregation_node_id,
            attempt,
            status: BatchStatus::Draft,
            trigger_type: None,
            trigger_reason: None,
            aggregation_state_id: None,
            created_at: Timestamp::from_unix_micros(created_at),
            completed_at: None,
        })
    }

    fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, LandscapeError> {
        let guard = self.lock()?;
        fetch_batch(&guard, batch_id)
    }

    fn get_batches(&self, run_id: &RunId) -> Result<Vec<BatchRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(&format!(
                "SELECT {BATCH_COLUMNS} FROM batches WHERE run_id = ?1 ORDER BY created_at, \
                 rowid"
            ))
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawBatch::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawBatch::into_record).collect()
    }

    fn get_batch_members(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<BatchMemberRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT batch_id, token_id, ordinal FROM batch_members WHERE batch_id = ?1 ORDER \
                 BY ordinal, token_id",
            )
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![batch_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter()
            .map(|(batch_id, token_id, ordinal)| {
                Ok(BatchMemberRecord {
                    batch_id: BatchId::new(batch_id),
                    token_id: TokenId::new(token_id),
                    ordinal: to_u32("member ordinal", ordinal)?,
                })
            })
            .collect()
    }

    fn register_artifact(&self, artifact: ArtifactSpec) -> Result<ArtifactRecord, LandscapeError> {
        let artifact_id = ArtifactId::generate();
        let size = from_u64("artifact size", artifact.descriptor.size_bytes)?;
        let created_at = now_micros();
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO artifacts (artifact_id, run_id, produced_by_state_id, sink_node_id, \
                 artifact_type, path_or_uri, content_hash, size_bytes, idempotency_key, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    artifact_id.as_str(),
                    artifact.run_id.as_str(),
                    artifact.produced_by_state_id.as_str(),
                    artifact.sink_node_id.as_str(),
                    artifact.descriptor.artifact_type,
                    artifact.descriptor.path_or_uri,
                    artifact.descriptor.content_hash,
                    size,
                    artifact.idempotency_key,
                    created_at,
                ],
            )
            .map_err(db_err)?;
        Ok(ArtifactRecord {
            artifact_id,
            run_id: artifact.run_id,
            produced_by_state_id: artifact.produced_by_state_id,
            sink_node_id: artifact.sink_node_id,
            artifact_type: artifact.descriptor.artifact_type,
            path_or_uri: artifact.descriptor.path_or_uri,
            content_hash: artifact.descriptor.content_hash,
            size_bytes: artifact.descriptor.size_bytes,
            idempotency_key: artifact.idempotency_key,
            created_at: Timestamp::from_unix_micros(created_at),
        })
    }

    fn get_artifacts(&self, run_id: &RunId) -> Result<Vec<ArtifactRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT artifact_id, run_id, produced_by_state_id, sink_node_id, artifact_type, \
                 path_or_uri, content_hash, size_bytes, idempotency_key, created_at FROM \
                 artifacts WHERE run_id = ?1 ORDER BY created_at, rowid",
            )
            .map_err(db_err)?;
        let raws = statement
            .query_map(params![run_id.as_str()], RawArtifact::read)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        raws.into_iter().map(RawArtifact::into_record).collect()
    }

    fn get_payload(&self, content_hash: &str) -> Result<Option<PayloadRecord>, LandscapeError> {
        let guard = self.lock()?;
        let raw = guard
            .query_row(
                "SELECT content_hash, body, size_bytes, created_at FROM payloads WHERE \
                 content_hash = ?1",
                params![content_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        raw.map(|(content_hash, body, size_bytes, created_at)| {
            Ok(PayloadRecord {
                content_hash,
                body,
                size_bytes: to_u64("payload size", size_bytes)?,
                created_at: Timestamp::from_unix_micros(created_at),
            })
        })
        .transpose()
    }

    fn purge_payload(&self, content_hash: &str) -> Result<bool, LandscapeError> {
        let guard = self.lock()?;
        let had_body: Option<bool> = guard
            .query_row(
                "SELECT body IS NOT NULL FROM payloads WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(had_body) = had_body else {
            return Ok(false);
        };
        guard
            .execute("UPDATE payloads SET body = NULL WHERE content_hash = ?1", params![
                content_hash
            ])
            .map_err(db_err)?;
        Ok(had_body)
    }
}
