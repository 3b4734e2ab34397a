//! Migration log (component I): the write-interception / journaling
//! protocol applied to every guarded transaction on the old database.

use std::collections::HashMap;

use serde_json::Value as Json;
use tracing::trace;

use crate::ast::Expr;
use crate::error::{MigrationError, MigrationLogError, MigrationResult};

pub const MARKER_TABLE: &str = "_migration_marker";
pub const LOG_TABLE: &str = "_migration_log";

/// A plain row keyed by column name, the unit of data the log and bulk
/// copy both move around.
pub type Row = HashMap<String, Expr>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    Recording,
    Draining,
}

impl MarkerStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Draining => "draining",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recording" => Some(Self::Recording),
            "draining" => Some(Self::Draining),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOperation {
    Insert,
    Update,
    Delete,
}

impl LogOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A row appended to `_migration_log`, not yet assigned its `id` (that's
/// an autoincrement column filled in on insert).
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLogEntry {
    pub txn_id: i64,
    pub ordering: i32,
    pub operation: LogOperation,
    pub table_name: String,
    pub row_data: Json,
}

/// Returns true for any table excluded from logging per §4.I ("any table
/// name beginning with `_migration_`").
#[must_use]
pub fn is_untracked_table(table_name: &str) -> bool {
    table_name.to_ascii_lowercase().starts_with("_migration_")
}

/// Encodes a row into the `row_data` JSON object: field names verbatim,
/// values as JSON primitives.
#[must_use]
pub fn row_to_json(row: &Row) -> Json {
    let mut map = serde_json::Map::new();
    for (col, val) in row {
        let encoded = match val {
            Expr::String(s) => Json::String(s.clone()),
            Expr::Integer(i) => Json::Number((*i).into()),
            Expr::Real(r) => serde_json::Number::from_f64(*r).map_or(Json::Null, Json::Number),
            Expr::RawValue(s) => Json::String(s.clone()),
        };
        map.insert(col.clone(), encoded);
    }
    Json::Object(map)
}

/// Decodes a `row_data` JSON object back into a [`Row`]. Integers outside
/// `i32` range still round-trip as `Integer` here since `Expr::Integer` is
/// `i64`; the `RawValue(digits)` fallback in §6 only matters for hosts
/// whose JSON numeric type is narrower than ours.
pub fn row_from_json(log_id: i64, value: &Json) -> MigrationResult<Row> {
    let obj = value.as_object().ok_or_else(|| {
        MigrationError::MigrationLog(MigrationLogError::MalformedRowData {
            log_id,
            detail: "row_data is not a JSON object".to_string(),
        })
    })?;
    let mut row = Row::new();
    for (col, v) in obj {
        let expr = match v {
            Json::String(s) => Expr::String(s.clone()),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Expr::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Expr::Real(f)
                } else {
                    Expr::RawValue(n.to_string())
                }
            }
            Json::Bool(b) => Expr::Integer(i64::from(*b)),
            Json::Null => Expr::RawValue("NULL".to_string()),
            other => {
                return Err(MigrationError::MigrationLog(MigrationLogError::MalformedRowData {
                    log_id,
                    detail: format!("column '{col}' has non-scalar value {other}"),
                }))
            }
        };
        row.insert(col.clone(), expr);
    }
    Ok(row)
}

/// One guarded transaction per §4.I: reads the marker status once on
/// begin, then buffers log appends until the host commits them alongside
/// its own DML.
#[derive(Debug, Clone)]
pub struct GuardedTransaction {
    status: Option<MarkerStatus>,
    txn_id: Option<i64>,
    next_ordering: i32,
    entries: Vec<PendingLogEntry>,
}

impl GuardedTransaction {
    /// Begins a guarded transaction. `marker_status` is the raw
    /// `_migration_marker.status` value, or `None` if the table/row is
    /// absent (plain mode — no logging). `allocate_txn_id` is only invoked
    /// when logging is active.
    pub fn begin(marker_status: Option<&str>, allocate_txn_id: impl FnOnce() -> i64) -> MigrationResult<Self> {
        match marker_status.map(MarkerStatus::parse) {
            None => Ok(Self {
                status: None,
                txn_id: None,
                next_ordering: 1,
                entries: Vec::new(),
            }),
            Some(Some(MarkerStatus::Recording)) => Ok(Self {
                status: Some(MarkerStatus::Recording),
                txn_id: Some(allocate_txn_id()),
                next_ordering: 1,
                entries: Vec::new(),
            }),
            Some(Some(MarkerStatus::Draining)) => Err(MigrationError::StateTransition(
                "write rejected: database is in drain mode".to_string(),
            )),
            Some(None) => Err(MigrationError::MalformedProject(format!(
                "unknown _migration_marker.status '{}'",
                marker_status.unwrap_or_default()
            ))),
        }
    }

    #[must_use]
    pub fn is_logging(&self) -> bool {
        self.txn_id.is_some()
    }

    #[must_use]
    pub fn txn_id(&self) -> Option<i64> {
        self.txn_id
    }

    /// Records one DML event. A no-op in plain mode, and for any
    /// `_migration_`-prefixed table.
    pub fn record(&mut self, operation: LogOperation, table_name: &str, row: &Row) {
        if is_untracked_table(table_name) {
            return;
        }
        let Some(txn_id) = self.txn_id else {
            return;
        };
        let ordering = self.next_ordering;
        self.next_ordering += 1;
        trace!(table = %table_name, %ordering, op = operation.as_str(), "journaled write");
        self.entries.push(PendingLogEntry {
            txn_id,
            ordering,
            operation,
            table_name: table_name.to_string(),
            row_data: row_to_json(row),
        });
    }

    /// Consumes the transaction, returning the entries the host must
    /// persist atomically alongside its own DML (commit), or discard
    /// entirely (rollback).
    #[must_use]
    pub fn into_entries(self) -> Vec<PendingLogEntry> {
        self.entries
    }
}
