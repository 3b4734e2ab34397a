//! Error taxonomy for the migration engine.

use thiserror::Error;

/// A 1-based source position used by [`MigrationError::Parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SourcePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// All error kinds the engine can produce, per the taxonomy in §7.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// SQL syntax failure while parsing a schema source file.
    #[error("parse error in {file}:{pos}: {message}")]
    Parse {
        file: String,
        pos: SourcePos,
        message: String,
        /// Optional extra hint, e.g. "trailing comma before `)` near line N".
        hint: Option<String>,
    },

    /// References to unknown files, duplicate tables, unresolved `QueryBy` columns.
    #[error("malformed project: {0}")]
    MalformedProject(String),

    /// The planner could not order relations because of unresolved references.
    #[error("missing dependencies: left={left:?} right={right:?}")]
    MissingDependencies {
        left: Vec<String>,
        right: Vec<String>,
    },

    /// A DDL/DML statement failed against the live database.
    #[error("query failed: {sql}: {driver_message}")]
    FailedQuery { sql: String, driver_message: String },

    /// A migration pass produced the same plan as the previous pass.
    #[error("stale migration: plan did not change across passes")]
    StaleMigration,

    /// Drain encountered an entry for an unknown table, a missing FK
    /// mapping, or a shape mismatch.
    #[error("migration log error: {0}")]
    MigrationLog(#[from] MigrationLogError),

    /// A hot-migration command was invoked against an incompatible
    /// marker/status combination.
    #[error("state transition error: {0}")]
    StateTransition(String),
}

/// Sub-errors specific to drain replay (component J), broken out so
/// callers can match on them without unpacking `MigrationError`.
#[derive(Debug, Error)]
pub enum MigrationLogError {
    #[error("log entry references unknown table '{table}'")]
    UnknownTable { table: String },

    #[error("missing ID mapping for FK column(s) {columns:?} referencing {ref_table} with key {key}")]
    MissingIdentityMapping {
        columns: Vec<String>,
        ref_table: String,
        key: String,
    },

    #[error("log entry for table '{table}' has shape mismatch: {detail}")]
    ShapeMismatch { table: String, detail: String },

    #[error("malformed row_data JSON in log entry {log_id}: {detail}")]
    MalformedRowData { log_id: i64, detail: String },
}

/// Result alias used throughout the crate.
pub type MigrationResult<T> = Result<T, MigrationError>;

impl MigrationError {
    pub fn parse(file: impl Into<String>, pos: SourcePos, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            pos,
            message: message.into(),
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        if let Self::Parse { hint: h, .. } = &mut self {
            *h = Some(hint.into());
        }
        self
    }

    pub fn failed_query(sql: impl Into<String>, driver_message: impl Into<String>) -> Self {
        Self::FailedQuery {
            sql: sql.into(),
            driver_message: driver_message.into(),
        }
    }

    /// Whether this error indicates a transient, retryable condition
    /// (e.g. `SQLITE_BUSY`) rather than a real planning or data failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FailedQuery { driver_message, .. } => is_lock_error(driver_message),
            _ => false,
        }
    }
}

/// Check whether a driver error message indicates a database lock/busy
/// condition, mirroring the legacy heuristic this engine's host
/// applications already use for their own connection pools.
#[must_use]
pub fn is_lock_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("database is locked")
        || lower.contains("database is busy")
        || lower.contains("busy")
        || lower.contains("sqlite_busy")
}
