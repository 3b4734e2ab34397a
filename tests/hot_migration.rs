//! Drives the hot-migration lifecycle (migrate -> drain -> cutover ->
//! cleanup-old) end to end against two real SQLite files, standing in for
//! the old and new databases.

#![cfg(feature = "sqlite-native")]

use sqlite_schema_migrator::bulk_copy::{BulkCopyConnection, Row};
use sqlite_schema_migrator::drain::LogEntry;
use sqlite_schema_migrator::driver::sqlite_native::SqliteDriver;
use sqlite_schema_migrator::migration_log::LogOperation;
use sqlite_schema_migrator::state_machine::{MigrationStatus, NewDbState, OldDbState};
use sqlite_schema_migrator::{cleanup_old, cutover, drain, migrate, parser, EngineConfig};

fn schema_source() -> &'static str {
    "CREATE TABLE account(id integer PRIMARY KEY AUTOINCREMENT, name text NOT NULL);"
}

#[test]
fn full_lifecycle_converges_old_and_new_databases() {
    let dir = tempfile::tempdir().unwrap();
    let old_path = dir.path().join("old.sqlite");
    let new_path = dir.path().join("new.sqlite");

    let old_schema = parser::parse("old.sql", schema_source()).unwrap();
    let new_schema = old_schema.clone();

    let mut old_conn = SqliteDriver::open(old_path.to_str().unwrap(), &EngineConfig::default()).unwrap();
    old_conn.inner().execute_batch(schema_source()).unwrap();
    old_conn
        .inner()
        .execute("INSERT INTO account(name) VALUES ('Alice')", [])
        .unwrap();

    let mut new_conn = SqliteDriver::open(new_path.to_str().unwrap(), &EngineConfig::default()).unwrap();

    let old = OldDbState { marker: None };
    let (migrate_outcome, mut id_mappings) = migrate(&mut new_conn, &old, &old_schema, &new_schema, schema_source(), None, false).unwrap();
    assert_eq!(migrate_outcome.new_status, MigrationStatus::Migrating);

    // Bulk copy ran as part of `migrate`; confirm the row landed in the new db.
    let copied = new_conn.select_all("account").unwrap();
    assert_eq!(copied.len(), 1);

    // A write lands on the old db after migrate started; simulate its
    // journal entry and drain it into the new db.
    old_conn
        .inner()
        .execute("INSERT INTO account(name) VALUES ('Bob')", [])
        .unwrap();
    let mut bob_row = Row::new();
    bob_row.insert("id".to_string(), sqlite_schema_migrator::ast::Expr::Integer(2));
    bob_row.insert(
        "name".to_string(),
        sqlite_schema_migrator::ast::Expr::String("Bob".to_string()),
    );
    let entry = LogEntry {
        id: 1,
        txn_id: 1,
        ordering: 1,
        operation: LogOperation::Insert,
        table_name: "account".to_string(),
        row_data: sqlite_schema_migrator::migration_log::row_to_json(&bob_row),
    };

    let recording = OldDbState {
        marker: Some(sqlite_schema_migrator::migration_log::MarkerStatus::Recording),
    };
    let copy_plan = sqlite_schema_migrator::copy_plan::build_copy_plan(&old_schema, &new_schema).unwrap();
    let (transition, drain_outcome) = drain(&mut new_conn, &recording, &copy_plan, vec![entry], &mut id_mappings, 0).unwrap();
    assert!(transition.marker_transitioned);
    assert_eq!(drain_outcome.replayed_count, 1);
    assert!(drain_outcome.drain_completed);

    let all_rows = new_conn.select_all("account").unwrap();
    assert_eq!(all_rows.len(), 2);

    // Cutover requires drain_completed to be set on the persisted state.
    let new_state = NewDbState {
        status: Some(MigrationStatus::Migrating),
        drain_completed: Some(drain_outcome.drain_completed),
        id_mapping_present: true,
        ..NewDbState::default()
    };
    let cutover_outcome = cutover(&new_state).unwrap();
    assert!(cutover_outcome.id_mapping_dropped);

    let draining = OldDbState {
        marker: Some(sqlite_schema_migrator::migration_log::MarkerStatus::Draining),
    };
    let cleanup_outcome = cleanup_old(&draining).unwrap();
    assert!(cleanup_outcome.marker_dropped);
    assert!(cleanup_outcome.log_dropped);
}
