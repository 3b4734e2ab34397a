//! Drain replay (component J): replays journaled old-database writes into
//! the new database, grouped by transaction, with FK/identity remapping.

use serde_json::Value as Json;
use tracing::{info, info_span, warn};

use crate::ast::Expr;
use crate::bulk_copy::{identity_key, lookup, project_row, table_key, translate_foreign_keys, IdMappings, Row};
use crate::copy_plan::CopyPlan;
use crate::error::{MigrationError, MigrationLogError, MigrationResult};
use crate::migration_log::{row_from_json, LogOperation};

/// One row read back from `_migration_log`, with its assigned `id`.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub txn_id: i64,
    pub ordering: i32,
    pub operation: LogOperation,
    pub table_name: String,
    pub row_data: Json,
}

/// The narrow connection surface drain replay needs against the new
/// database: project-and-insert (shared with bulk copy), targeted update
/// and delete by primary key, and one transaction per replay group.
pub trait DrainConnection {
    fn insert_row(&mut self, table: &str, insert_columns: &[String], values: &[Expr]) -> MigrationResult<Vec<Expr>>;
    fn update_row(&mut self, table: &str, pk_columns: &[String], pk_values: &[Expr], set_columns: &[String], set_values: &[Expr]) -> MigrationResult<()>;
    fn delete_row(&mut self, table: &str, pk_columns: &[String], pk_values: &[Expr]) -> MigrationResult<()>;
    fn begin_group(&mut self) -> MigrationResult<()>;
    /// Commits the group's writes and persists `last_replayed_log_id`
    /// (the max `id` among the group's entries) in the same transaction,
    /// so a crash between groups can never leave the progress marker
    /// behind the data it describes.
    fn commit_group(&mut self, last_replayed_log_id: i64) -> MigrationResult<()>;
    fn rollback_group(&mut self) -> MigrationResult<()>;
}

/// A replay group that failed partway through. Earlier groups in the same
/// `drain()` call already committed and are reflected in
/// `DrainOutcome::last_replayed_log_id`; this only describes the first
/// group that didn't.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedGroup {
    pub txn_id: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainOutcome {
    pub last_replayed_log_id: i64,
    pub replayed_count: usize,
    pub drain_completed: bool,
    pub failed_group: Option<FailedGroup>,
}

fn group_by_txn(mut entries: Vec<LogEntry>) -> Vec<Vec<LogEntry>> {
    entries.sort_by_key(|e| (e.txn_id, e.ordering, e.id));
    let mut groups: Vec<Vec<LogEntry>> = Vec::new();
    for entry in entries {
        match groups.last_mut() {
            Some(group) if group[0].txn_id == entry.txn_id => group.push(entry),
            _ => groups.push(vec![entry]),
        }
    }
    groups
}

fn target_pk_for_source_row(identity: &crate::copy_plan::IdentityMapping, source_row: &Row, id_mappings: &IdMappings, ref_table: &str) -> MigrationResult<Vec<Expr>> {
    let source_pk_values: Vec<Expr> = identity.source_keys.iter().map(|k| lookup(source_row, k)).collect();
    let key = identity_key(&source_pk_values);
    id_mappings
        .get(&table_key(ref_table))
        .and_then(|m| m.get(&key))
        .cloned()
        .ok_or_else(|| {
            MigrationError::MigrationLog(MigrationLogError::MissingIdentityMapping {
                columns: identity.source_keys.clone(),
                ref_table: ref_table.to_string(),
                key,
            })
        })
}

fn replay_entry(conn: &mut impl DrainConnection, plan: &CopyPlan, entry: &LogEntry, id_mappings: &mut IdMappings) -> MigrationResult<()> {
    let step = plan.step_for_source_table(&entry.table_name).ok_or_else(|| {
        MigrationError::MigrationLog(MigrationLogError::UnknownTable {
            table: entry.table_name.clone(),
        })
    })?;
    let row = row_from_json(entry.id, &entry.row_data)?;

    match entry.operation {
        LogOperation::Insert => {
            let mut target_row = project_row(step, &row);
            translate_foreign_keys(step, &mut target_row, id_mappings)?;
            let insert_values: Vec<Expr> = step.insert_columns.iter().map(|c| lookup(&target_row, c)).collect();
            let target_identity = conn.insert_row(&step.target_table, &step.insert_columns, &insert_values)?;
            if let Some(identity) = &step.identity {
                let source_pk_values: Vec<Expr> = identity.source_keys.iter().map(|k| lookup(&row, k)).collect();
                let key = identity_key(&source_pk_values);
                id_mappings.entry(table_key(&step.target_table)).or_default().insert(key, target_identity);
            }
        }
        LogOperation::Update => {
            let Some(identity) = &step.identity else {
                return Err(MigrationError::MigrationLog(MigrationLogError::ShapeMismatch {
                    table: entry.table_name.clone(),
                    detail: "update replay requires an identity mapping".to_string(),
                }));
            };
            let target_pk = target_pk_for_source_row(identity, &row, id_mappings, &step.target_table)?;

            let mut target_row = project_row(step, &row);
            translate_foreign_keys(step, &mut target_row, id_mappings)?;
            let set_columns: Vec<String> = step
                .insert_columns
                .iter()
                .filter(|c| !identity.target_keys.iter().any(|k| k.eq_ignore_ascii_case(c)))
                .cloned()
                .collect();
            if set_columns.is_empty() {
                return Ok(());
            }
            let set_values: Vec<Expr> = set_columns.iter().map(|c| lookup(&target_row, c)).collect();
            conn.update_row(&step.target_table, &identity.target_keys, &target_pk, &set_columns, &set_values)?;
        }
        LogOperation::Delete => {
            let Some(identity) = &step.identity else {
                return Err(MigrationError::MigrationLog(MigrationLogError::ShapeMismatch {
                    table: entry.table_name.clone(),
                    detail: "delete replay requires an identity mapping".to_string(),
                }));
            };
            let target_pk = target_pk_for_source_row(identity, &row, id_mappings, &step.target_table)?;
            conn.delete_row(&step.target_table, &identity.target_keys, &target_pk)?;
        }
    }
    Ok(())
}

/// Replays `entries` (already filtered to `id > last_replayed_log_id` by
/// the caller) into the new database per §4.J. Every group commits (and
/// persists its own `last_replayed_log_id`) independently; on the first
/// group failure, that group rolls back and replay stops, but the call
/// still returns `Ok` — `last_replayed_log_id` in the outcome reflects the
/// groups that committed before the failure, and `failed_group` names the
/// one that didn't, so a caller can retry from exactly where replay left
/// off without re-applying already-committed groups.
pub fn drain(
    conn: &mut impl DrainConnection,
    plan: &CopyPlan,
    entries: Vec<LogEntry>,
    id_mappings: &mut IdMappings,
    last_replayed_log_id: i64,
) -> MigrationResult<DrainOutcome> {
    let _span = info_span!("drain").entered();
    let has_new_entries = !entries.is_empty();
    let groups = group_by_txn(entries);

    let mut replayed_log_id = last_replayed_log_id;
    let mut replayed_count = 0usize;

    for group in &groups {
        conn.begin_group()?;
        let mut group_failed = None;
        for entry in group {
            if let Err(e) = replay_entry(conn, plan, entry, id_mappings) {
                group_failed = Some(e);
                break;
            }
            replayed_count += 1;
        }
        match group_failed {
            Some(e) => {
                conn.rollback_group()?;
                warn!(txn_id = group[0].txn_id, "drain group failed, stopping");
                return Ok(DrainOutcome {
                    last_replayed_log_id: replayed_log_id,
                    replayed_count,
                    drain_completed: false,
                    failed_group: Some(FailedGroup {
                        txn_id: group[0].txn_id,
                        message: e.to_string(),
                    }),
                });
            }
            None => {
                let group_max = group.iter().map(|e| e.id).max().unwrap_or(replayed_log_id);
                conn.commit_group(group_max)?;
                replayed_log_id = group_max;
            }
        }
    }

    let drain_completed = !has_new_entries || groups.iter().all(|g| g.iter().all(|e| e.id <= replayed_log_id));
    info!(replayed_count, replayed_log_id, drain_completed, "drain batch complete");

    Ok(DrainOutcome {
        last_replayed_log_id: replayed_log_id,
        replayed_count,
        drain_completed,
        failed_group: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use std::collections::HashMap;

    struct MockConn {
        rows: HashMap<String, Vec<(Vec<Expr>, Row)>>, // target table -> (pk values, row)
        next_rowid: i64,
        in_group: bool,
        last_committed_log_id: i64,
    }

    impl MockConn {
        fn new() -> Self {
            Self {
                rows: HashMap::new(),
                next_rowid: 1,
                in_group: false,
                last_committed_log_id: 0,
            }
        }
    }

    impl DrainConnection for MockConn {
        fn insert_row(&mut self, table: &str, columns: &[String], values: &[Expr]) -> MigrationResult<Vec<Expr>> {
            assert!(self.in_group);
            let mut row = Row::new();
            for (c, v) in columns.iter().zip(values.iter()) {
                row.insert(c.clone(), v.clone());
            }
            let id = self.next_rowid;
            self.next_rowid += 1;
            row.insert("id".to_string(), Expr::Integer(id));
            self.rows.entry(table_key(table)).or_default().push((vec![Expr::Integer(id)], row));
            Ok(vec![Expr::Integer(id)])
        }

        fn update_row(&mut self, table: &str, pk_columns: &[String], pk_values: &[Expr], set_columns: &[String], set_values: &[Expr]) -> MigrationResult<()> {
            assert!(self.in_group);
            let _ = pk_columns;
            if let Some(rows) = self.rows.get_mut(&table_key(table)) {
                if let Some((_, row)) = rows.iter_mut().find(|(pk, _)| pk == pk_values) {
                    for (c, v) in set_columns.iter().zip(set_values.iter()) {
                        row.insert(c.clone(), v.clone());
                    }
                }
            }
            Ok(())
        }

        fn delete_row(&mut self, table: &str, _pk_columns: &[String], pk_values: &[Expr]) -> MigrationResult<()> {
            assert!(self.in_group);
            if let Some(rows) = self.rows.get_mut(&table_key(table)) {
                rows.retain(|(pk, _)| pk != pk_values);
            }
            Ok(())
        }

        fn begin_group(&mut self) -> MigrationResult<()> {
            self.in_group = true;
            Ok(())
        }

        fn commit_group(&mut self, last_replayed_log_id: i64) -> MigrationResult<()> {
            self.in_group = false;
            self.last_committed_log_id = last_replayed_log_id;
            Ok(())
        }

        fn rollback_group(&mut self) -> MigrationResult<()> {
            self.in_group = false;
            Ok(())
        }
    }

    fn row_json(pairs: &[(&str, Expr)]) -> Json {
        let mut row = Row::new();
        for (k, v) in pairs {
            row.insert((*k).to_string(), v.clone());
        }
        crate::migration_log::row_to_json(&row)
    }

    #[test]
    fn scenario_5_insert_update_delete() {
        let source = parse(
            "a.sql",
            "CREATE TABLE account(id integer PRIMARY KEY AUTOINCREMENT, name text NOT NULL);\
             CREATE TABLE invoice(id integer PRIMARY KEY AUTOINCREMENT, account_id integer REFERENCES account(id), total real NOT NULL);",
        )
        .unwrap();
        let target = source.clone();
        let plan = crate::copy_plan::build_copy_plan(&source, &target).unwrap();

        let mut conn = MockConn::new();
        let mut id_mappings: IdMappings = HashMap::new();
        // Simulate the state left by bulk copy: invoice 100 already exists
        // mapped to new id 100 (same ids, no prior rename).
        conn.rows.insert(
            "invoice".to_string(),
            vec![(
                vec![Expr::Integer(100)],
                {
                    let mut r = Row::new();
                    r.insert("id".to_string(), Expr::Integer(100));
                    r.insert("account_id".to_string(), Expr::Integer(1));
                    r.insert("total".to_string(), Expr::Real(42.5));
                    r
                },
            )],
        );
        id_mappings
            .entry("invoice".to_string())
            .or_default()
            .insert(identity_key(&[Expr::Integer(100)]), vec![Expr::Integer(100)]);
        id_mappings
            .entry("account".to_string())
            .or_default()
            .insert(identity_key(&[Expr::Integer(1)]), vec![Expr::Integer(1)]);

        let entries = vec![
            LogEntry {
                id: 1,
                txn_id: 1,
                ordering: 1,
                operation: LogOperation::Insert,
                table_name: "account".to_string(),
                row_data: row_json(&[("id", Expr::Integer(11)), ("name", Expr::String("Bob".to_string()))]),
            },
            LogEntry {
                id: 2,
                txn_id: 2,
                ordering: 1,
                operation: LogOperation::Insert,
                table_name: "invoice".to_string(),
                row_data: row_json(&[
                    ("id", Expr::Integer(101)),
                    ("account_id", Expr::Integer(11)),
                    ("total", Expr::Real(15.0)),
                ]),
            },
            LogEntry {
                id: 3,
                txn_id: 3,
                ordering: 1,
                operation: LogOperation::Update,
                table_name: "invoice".to_string(),
                row_data: row_json(&[
                    ("id", Expr::Integer(100)),
                    ("account_id", Expr::Integer(1)),
                    ("total", Expr::Real(99.0)),
                ]),
            },
            LogEntry {
                id: 4,
                txn_id: 4,
                ordering: 1,
                operation: LogOperation::Delete,
                table_name: "invoice".to_string(),
                row_data: row_json(&[("id", Expr::Integer(101)), ("account_id", Expr::Integer(11)), ("total", Expr::Real(15.0))]),
            },
        ];

        let outcome = drain(&mut conn, &plan, entries, &mut id_mappings, 0).unwrap();
        assert_eq!(outcome.last_replayed_log_id, 4);
        assert_eq!(outcome.replayed_count, 4);
        assert!(outcome.drain_completed);

        assert_eq!(conn.rows["account"].len(), 1);
        let invoices = &conn.rows["invoice"];
        assert_eq!(invoices.len(), 1);
        let (_, row) = &invoices[0];
        assert_eq!(row["id"], Expr::Integer(100));
        assert_eq!(row["total"], Expr::Real(99.0));
    }

    #[test]
    fn unknown_table_fails_its_group_only() {
        let source = parse("a.sql", "CREATE TABLE t(id integer PRIMARY KEY AUTOINCREMENT);").unwrap();
        let target = source.clone();
        let plan = crate::copy_plan::build_copy_plan(&source, &target).unwrap();
        let mut conn = MockConn::new();
        let mut id_mappings: IdMappings = HashMap::new();

        let good = LogEntry {
            id: 1,
            txn_id: 1,
            ordering: 1,
            operation: LogOperation::Insert,
            table_name: "t".to_string(),
            row_data: row_json(&[("id", Expr::Integer(1))]),
        };
        let bad = LogEntry {
            id: 2,
            txn_id: 2,
            ordering: 1,
            operation: LogOperation::Insert,
            table_name: "ghost".to_string(),
            row_data: row_json(&[("id", Expr::Integer(2))]),
        };

        let outcome = drain(&mut conn, &plan, vec![good, bad], &mut id_mappings, 0).unwrap();
        let failed = outcome.failed_group.expect("second group should fail");
        assert_eq!(failed.txn_id, 2);
        assert!(failed.message.contains("ghost") || failed.message.to_lowercase().contains("unknown"));
        assert!(!outcome.drain_completed);
        // The earlier, successful group's effects remain committed, and its
        // progress was persisted even though the batch stopped short.
        assert_eq!(outcome.last_replayed_log_id, 1);
        assert_eq!(conn.last_committed_log_id, 1);
        assert_eq!(conn.rows["t"].len(), 1);
    }
}
