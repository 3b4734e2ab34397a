//! Execution driver (component L): runs a [`MigrationPlan`] against a live
//! database, transactionally, and exposes the narrow read/write seams the
//! bulk-copy, migration-log and drain-replay components need.

use tracing::{error, info, info_span};

use crate::ast::Expr;
use crate::error::{MigrationError, MigrationResult};
use crate::planner::MigrationPlan;

/// Row access during schema reflection or bulk copy: enough to read back
/// whatever the driver's native row representation is without committing
/// this crate to one column-value type.
pub trait RowReader {
    fn column_count(&self) -> usize;
    fn column_name(&self, idx: usize) -> &str;
    fn value(&self, idx: usize) -> Expr;
}

/// Runs arbitrary DDL/DML against a connection already inside a
/// transaction, surfacing the failing statement's index for diagnostics.
pub trait StatementExecutor {
    fn execute(&mut self, sql: &str) -> MigrationResult<()>;
}

/// The full seam the driver needs from a database connection: begin/commit
/// the wrapping transaction, execute statements, and run the `PRAGMA
/// foreign_key_check` sanity pass §4.L asks for before commit when the
/// plan flipped `foreign_keys` off.
pub trait SchemaConnection: StatementExecutor {
    fn begin(&mut self) -> MigrationResult<()>;
    fn commit(&mut self) -> MigrationResult<()>;
    fn rollback(&mut self) -> MigrationResult<()>;
    fn foreign_key_violations(&mut self) -> MigrationResult<Vec<String>>;
}

/// Outcome of a successful [`run_plan`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub statements_run: usize,
}

/// Applies every [`PlanStep::Statement`](crate::planner::PlanStep::Statement)
/// in `plan` inside one transaction: begin, run each statement in order,
/// check FK integrity if the plan used the `PRAGMA foreign_keys=OFF`
/// bookend, then commit. The first failing statement rolls the whole
/// transaction back and returns a [`MigrationError::FailedQuery`]
/// annotated with that statement's index.
pub fn run_plan(conn: &mut impl SchemaConnection, plan: &MigrationPlan) -> MigrationResult<ApplyReport> {
    let _span = info_span!("run_plan").entered();
    conn.begin()?;

    let statements = plan.statements();
    for (idx, sql) in statements.iter().enumerate() {
        if let Err(e) = conn.execute(sql) {
            error!(statement_index = idx, sql = %sql, "plan statement failed");
            let _ = conn.rollback();
            return Err(annotate_index(e, idx));
        }
    }

    match conn.foreign_key_violations() {
        Ok(violations) if !violations.is_empty() => {
            let _ = conn.rollback();
            return Err(MigrationError::MalformedProject(format!(
                "foreign key violations after migration: {violations:?}"
            )));
        }
        Err(e) => {
            let _ = conn.rollback();
            return Err(e);
        }
        Ok(_) => {}
    }

    conn.commit()?;
    info!(statements = statements.len(), "plan applied");
    Ok(ApplyReport {
        statements_run: statements.len(),
    })
}

fn annotate_index(err: MigrationError, idx: usize) -> MigrationError {
    match err {
        MigrationError::FailedQuery { sql, driver_message } => MigrationError::FailedQuery {
            sql,
            driver_message: format!("statement #{idx}: {driver_message}"),
        },
        other => other,
    }
}

#[cfg(feature = "sqlite-native")]
pub mod sqlite_native {
    //! `rusqlite`-backed reference implementation of [`SchemaConnection`],
    //! [`crate::bulk_copy::BulkCopyConnection`] and
    //! [`crate::drain::DrainConnection`].

    use rusqlite::types::ValueRef;
    use rusqlite::Connection;

    use std::time::Duration;

    use super::{MigrationError, MigrationResult, SchemaConnection, StatementExecutor};
    use crate::ast::Expr;
    use crate::bulk_copy::{BulkCopyConnection, Row as CopyRow};
    use crate::config::EngineConfig;
    use crate::drain::DrainConnection;

    fn expr_from_value(v: ValueRef<'_>) -> Expr {
        match v {
            ValueRef::Null => Expr::RawValue("NULL".to_string()),
            ValueRef::Integer(i) => Expr::Integer(i),
            ValueRef::Real(r) => Expr::Real(r),
            ValueRef::Text(t) => Expr::String(String::from_utf8_lossy(t).to_string()),
            ValueRef::Blob(_) => Expr::RawValue("<blob>".to_string()),
        }
    }

    fn expr_to_sql(e: &Expr) -> rusqlite::types::Value {
        use rusqlite::types::Value;
        match e {
            Expr::String(s) => Value::Text(s.clone()),
            Expr::Integer(i) => Value::Integer(*i),
            Expr::Real(r) => Value::Real(*r),
            Expr::RawValue(s) if s == "NULL" => Value::Null,
            Expr::RawValue(s) => Value::Text(s.clone()),
        }
    }

    fn as_failed_query(sql: &str, err: rusqlite::Error) -> MigrationError {
        MigrationError::failed_query(sql, err.to_string())
    }

    /// Wraps an open `rusqlite::Connection`, applying a plan or serving as
    /// the connection seam for bulk copy / drain replay.
    pub struct SqliteDriver {
        conn: Connection,
    }

    impl SqliteDriver {
        /// Opens `path`, applying `config.busy_timeout_ms` as
        /// `PRAGMA busy_timeout` and, when `config.auto_toggle_foreign_keys`
        /// is set, turning on `PRAGMA foreign_keys` immediately.
        pub fn open(path: &str, config: &EngineConfig) -> MigrationResult<Self> {
            let conn = Connection::open(path).map_err(|e| MigrationError::failed_query(format!("open {path}"), e.to_string()))?;
            conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
                .map_err(|e| as_failed_query("PRAGMA busy_timeout", e))?;
            if config.auto_toggle_foreign_keys {
                conn.pragma_update(None, "foreign_keys", "ON")
                    .map_err(|e| as_failed_query("PRAGMA foreign_keys=ON", e))?;
            }
            Ok(Self { conn })
        }

        #[must_use]
        pub fn inner(&self) -> &Connection {
            &self.conn
        }

        fn select_all_rows(&self, table: &str) -> MigrationResult<Vec<CopyRow>> {
            let sql = format!("SELECT * FROM \"{table}\"");
            let mut stmt = self.conn.prepare(&sql).map_err(|e| as_failed_query(&sql, e))?;
            let column_names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();
            let rows = stmt
                .query_map([], |r| {
                    let mut row = CopyRow::new();
                    for (i, name) in column_names.iter().enumerate() {
                        row.insert(name.clone(), expr_from_value(r.get_ref(i)?));
                    }
                    Ok(row)
                })
                .map_err(|e| as_failed_query(&sql, e))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| as_failed_query(&sql, e))
        }
    }

    impl StatementExecutor for SqliteDriver {
        fn execute(&mut self, sql: &str) -> MigrationResult<()> {
            self.conn.execute_batch(sql).map_err(|e| as_failed_query(sql, e))
        }
    }

    impl SchemaConnection for SqliteDriver {
        fn begin(&mut self) -> MigrationResult<()> {
            self.conn.execute_batch("BEGIN").map_err(|e| as_failed_query("BEGIN", e))
        }

        fn commit(&mut self) -> MigrationResult<()> {
            self.conn.execute_batch("COMMIT").map_err(|e| as_failed_query("COMMIT", e))
        }

        fn rollback(&mut self) -> MigrationResult<()> {
            self.conn.execute_batch("ROLLBACK").map_err(|e| as_failed_query("ROLLBACK", e))
        }

        fn foreign_key_violations(&mut self) -> MigrationResult<Vec<String>> {
            let mut stmt = self
                .conn
                .prepare("PRAGMA foreign_key_check")
                .map_err(|e| as_failed_query("PRAGMA foreign_key_check", e))?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(|e| as_failed_query("PRAGMA foreign_key_check", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| as_failed_query("PRAGMA foreign_key_check", e))
        }
    }

    impl BulkCopyConnection for SqliteDriver {
        fn select_all(&mut self, table: &str) -> MigrationResult<Vec<CopyRow>> {
            self.select_all_rows(table)
        }

        fn insert_row(&mut self, table: &str, insert_columns: &[String], values: &[Expr]) -> MigrationResult<Vec<Expr>> {
            let quoted_cols: Vec<String> = insert_columns.iter().map(|c| format!("\"{c}\"")).collect();
            let placeholders: Vec<String> = (0..values.len()).map(|_| "?".to_string()).collect();
            let sql = format!(
                "INSERT INTO \"{table}\" ({}) VALUES ({})",
                quoted_cols.join(", "),
                placeholders.join(", ")
            );
            let params: Vec<rusqlite::types::Value> = values.iter().map(expr_to_sql).collect();
            let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            self.conn.execute(&sql, params_ref.as_slice()).map_err(|e| as_failed_query(&sql, e))?;
            Ok(vec![Expr::Integer(self.conn.last_insert_rowid())])
        }
    }

    impl DrainConnection for SqliteDriver {
        fn insert_row(&mut self, table: &str, insert_columns: &[String], values: &[Expr]) -> MigrationResult<Vec<Expr>> {
            BulkCopyConnection::insert_row(self, table, insert_columns, values)
        }

        fn update_row(
            &mut self,
            table: &str,
            pk_columns: &[String],
            pk_values: &[Expr],
            set_columns: &[String],
            set_values: &[Expr],
        ) -> MigrationResult<()> {
            let set_clause: Vec<String> = set_columns.iter().map(|c| format!("\"{c}\" = ?")).collect();
            let where_clause: Vec<String> = pk_columns.iter().map(|c| format!("\"{c}\" = ?")).collect();
            let sql = format!(
                "UPDATE \"{table}\" SET {} WHERE {}",
                set_clause.join(", "),
                where_clause.join(" AND ")
            );
            let params: Vec<rusqlite::types::Value> = set_values.iter().chain(pk_values.iter()).map(expr_to_sql).collect();
            let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            self.conn.execute(&sql, params_ref.as_slice()).map_err(|e| as_failed_query(&sql, e))?;
            Ok(())
        }

        fn delete_row(&mut self, table: &str, pk_columns: &[String], pk_values: &[Expr]) -> MigrationResult<()> {
            let where_clause: Vec<String> = pk_columns.iter().map(|c| format!("\"{c}\" = ?")).collect();
            let sql = format!("DELETE FROM \"{table}\" WHERE {}", where_clause.join(" AND "));
            let params: Vec<rusqlite::types::Value> = pk_values.iter().map(expr_to_sql).collect();
            let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            self.conn.execute(&sql, params_ref.as_slice()).map_err(|e| as_failed_query(&sql, e))?;
            Ok(())
        }

        fn begin_group(&mut self) -> MigrationResult<()> {
            self.conn.execute_batch("BEGIN").map_err(|e| as_failed_query("BEGIN", e))
        }

        fn commit_group(&mut self, last_replayed_log_id: i64) -> MigrationResult<()> {
            let create_sql = format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (id INTEGER PRIMARY KEY CHECK (id = 0), last_replayed_log_id INTEGER NOT NULL)",
                table = crate::state_machine::PROGRESS_TABLE
            );
            self.conn.execute_batch(&create_sql).map_err(|e| as_failed_query(&create_sql, e))?;

            let upsert_sql = format!(
                "INSERT INTO \"{table}\" (id, last_replayed_log_id) VALUES (0, ?1) \
                 ON CONFLICT(id) DO UPDATE SET last_replayed_log_id = excluded.last_replayed_log_id",
                table = crate::state_machine::PROGRESS_TABLE
            );
            self.conn
                .execute(&upsert_sql, [last_replayed_log_id])
                .map_err(|e| as_failed_query(&upsert_sql, e))?;

            self.conn.execute_batch("COMMIT").map_err(|e| as_failed_query("COMMIT", e))
        }

        fn rollback_group(&mut self) -> MigrationResult<()> {
            self.conn.execute_batch("ROLLBACK").map_err(|e| as_failed_query("ROLLBACK", e))
        }
    }
}
