//! `sqlite_schema_migrator`: declarative SQLite schema migration with a
//! hot-migration path for live-traffic cutover.
//!
//! A schema is a plain SQL source file (parsed by [`parser`]) or a live
//! database ([`reflection`]). [`planner::plan_migration`] diffs two
//! schemas into an ordered, idempotent DDL plan; [`driver::run_plan`]
//! applies it transactionally. The hot-migration path
//! (copy_plan/bulk_copy/migration_log/drain/state_machine) lets a new
//! database come up alongside a live old one, catch up via replayed
//! writes, and cut traffic over without downtime.

pub mod ast;
pub mod bulk_copy;
pub mod config;
pub mod copy_plan;
pub mod ddl;
pub mod differ;
pub mod drain;
pub mod driver;
pub mod error;
pub mod graph;
pub mod migration_log;
pub mod parser;
pub mod planner;
pub mod reflection;
pub mod state_machine;

use std::path::{Path, PathBuf};

use tracing::info_span;

pub use ast::SqlFile;
pub use config::EngineConfig;
pub use error::{MigrationError, MigrationResult};
pub use planner::MigrationPlan;
pub use state_machine::schema_hash;

/// Parses and diffs `old_schema` against `new_schema`, returning the
/// ordered plan a driver should run against the old database to bring it
/// in line with the new one.
pub fn plan_migration(old_schema: &SqlFile, new_schema: &SqlFile) -> MigrationResult<MigrationPlan> {
    planner::plan_migration(old_schema, new_schema)
}

/// Builds the plan to create a brand-new, empty database from scratch:
/// every table (in dependency order), then views, then indexes, then
/// triggers. Used by the `migrate` hot-migration transition to stand up
/// the new database before bulk copy runs.
#[must_use]
pub fn create_schema_plan(schema: &SqlFile) -> MigrationPlan {
    let _span = info_span!("create_schema_plan").entered();
    let graph = graph::DependencyGraph::build(schema);
    let order = graph.topological_order();

    let mut steps = Vec::new();
    let mut table_names: Vec<String> = schema.tables.iter().map(|t| t.name.clone()).collect();
    table_names.sort_by_key(|n| graph::DependencyGraph::order_index(&order, n).unwrap_or(usize::MAX));
    for name in &table_names {
        let table = schema.table(name).expect("table exists");
        steps.push(planner::PlanStep::Statement(ddl::render_create_table(table)));
    }

    let mut view_names: Vec<String> = schema.views.iter().map(|v| v.name.clone()).collect();
    view_names.sort_by_key(|n| graph::DependencyGraph::order_index(&order, n).unwrap_or(usize::MAX));
    for name in &view_names {
        let view = schema.view(name).expect("view exists");
        steps.push(planner::PlanStep::Statement(ddl::render_create_view(view)));
    }

    for index in &schema.indexes {
        steps.push(planner::PlanStep::Statement(ddl::render_create_index(index)));
    }
    for trigger in &schema.triggers {
        steps.push(planner::PlanStep::Statement(ddl::render_create_trigger(trigger)));
    }

    MigrationPlan { steps }
}

/// Runs the full `migrate` hot-migration transition (§4.K): validates the
/// old marker, creates the new schema fresh (unless `existing_new_db_matches`
/// short-circuits it), runs bulk copy, and returns the bookkeeping the
/// caller must persist alongside the copied data.
pub fn migrate<NewConn>(
    new_conn: &mut NewConn,
    old: &state_machine::OldDbState,
    old_schema: &SqlFile,
    new_schema: &SqlFile,
    schema_source: &str,
    schema_commit: Option<String>,
    existing_new_db_matches: bool,
) -> MigrationResult<(state_machine::MigrateOutcome, bulk_copy::IdMappings)>
where
    NewConn: driver::SchemaConnection + bulk_copy::BulkCopyConnection,
{
    let outcome = state_machine::migrate(old, schema_source, schema_commit, existing_new_db_matches)?;
    if existing_new_db_matches {
        return Ok((outcome, bulk_copy::IdMappings::new()));
    }

    let create_plan = create_schema_plan(new_schema);
    driver::run_plan(new_conn, &create_plan)?;

    let copy_plan = copy_plan::build_copy_plan(old_schema, new_schema)?;
    let id_mappings = bulk_copy::run_bulk_copy(new_conn, &copy_plan)?;

    Ok((outcome, id_mappings))
}

/// Runs one `drain` batch (§4.K / §4.J): transitions the old marker to
/// `draining` on first call, replays `entries` into the new database, and
/// returns the batch outcome. The caller is responsible for fetching
/// `entries` (`id > last_replayed_log_id`) and for deciding
/// `drain_completed` by re-checking for unfetched rows after this call
/// succeeds — see the design note on this in `DESIGN.md`.
pub fn drain<C: drain::DrainConnection>(
    conn: &mut C,
    old: &state_machine::OldDbState,
    plan: &copy_plan::CopyPlan,
    entries: Vec<drain::LogEntry>,
    id_mappings: &mut bulk_copy::IdMappings,
    last_replayed_log_id: i64,
) -> MigrationResult<(state_machine::DrainTransition, drain::DrainOutcome)> {
    let transition = state_machine::begin_drain_transition(old)?;
    let outcome = drain::drain(conn, plan, entries, id_mappings, last_replayed_log_id)?;
    Ok((transition, outcome))
}

/// Runs the `cutover` transition (§4.K).
pub fn cutover(new: &state_machine::NewDbState) -> MigrationResult<state_machine::CutoverOutcome> {
    state_machine::cutover(new)
}

/// Runs the `cleanup-old` transition (§4.K).
pub fn cleanup_old(old: &state_machine::OldDbState) -> MigrationResult<state_machine::CleanupOutcome> {
    state_machine::cleanup_old(old)
}

/// Builds the full status report (§4.K) from already-read bookkeeping
/// state, filling in the id-mapping count the caller counted separately
/// (reflection/driver-specific, so not owned by `state_machine`).
#[must_use]
pub fn status_report(old: &state_machine::OldDbState, new: &state_machine::NewDbState, id_mapping_count: Option<i64>) -> state_machine::StatusReport {
    let mut report = state_machine::status_report(old, new);
    report.id_mapping_count = id_mapping_count;
    report
}

/// The deterministic new-db path per §6: `<dir>/<dirname>-<hash>.sqlite`.
#[must_use]
pub fn deterministic_new_db_path(dir: &Path, dirname: &str, hash: &str) -> PathBuf {
    dir.join(format!("{dirname}-{hash}.sqlite"))
}

/// Infers the old database path per §6: the most recently modified
/// `.sqlite` file in `dir` matching `<dirname>-*.sqlite`, excluding the
/// deterministic new-db path itself.
#[must_use]
pub fn infer_old_db_path(dir: &Path, dirname: &str, deterministic_path: &Path) -> Option<PathBuf> {
    let prefix = format!("{dirname}-");
    let entries = std::fs::read_dir(dir).ok()?;

    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path == deterministic_path {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.starts_with(&prefix) || !file_name.ends_with(".sqlite") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        candidates.push((modified, path));
    }

    candidates.into_iter().max_by_key(|(t, _)| *t).map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_schema_plan_orders_tables_before_dependents() {
        let schema = parser::parse(
            "s.sql",
            "CREATE TABLE invoice(id integer PRIMARY KEY AUTOINCREMENT, account_id integer REFERENCES account(id));\
             CREATE TABLE account(id integer PRIMARY KEY AUTOINCREMENT, name text NOT NULL);",
        )
        .unwrap();
        let plan = create_schema_plan(&schema);
        let statements = plan.statements();
        let account_idx = statements.iter().position(|s| s.contains("CREATE TABLE account")).unwrap();
        let invoice_idx = statements.iter().position(|s| s.contains("CREATE TABLE invoice")).unwrap();
        assert!(account_idx < invoice_idx);
    }

    #[test]
    fn deterministic_path_matches_naming_rule() {
        let path = deterministic_new_db_path(Path::new("/tmp/proj"), "proj", "abcdef0123456789");
        assert_eq!(path, Path::new("/tmp/proj/proj-abcdef0123456789.sqlite"));
    }

    #[test]
    fn infer_old_db_path_picks_most_recent_match_excluding_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let deterministic = dir.path().join("proj-newhash.sqlite");
        std::fs::write(&deterministic, b"").unwrap();
        let older = dir.path().join("proj-oldhash1.sqlite");
        std::fs::write(&older, b"").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let newer = dir.path().join("proj-oldhash2.sqlite");
        std::fs::write(&newer, b"").unwrap();

        let found = infer_old_db_path(dir.path(), "proj", &deterministic).unwrap();
        assert_eq!(found, newer);
    }

    #[test]
    fn status_report_fills_in_caller_supplied_id_mapping_count() {
        let old = state_machine::OldDbState { marker: None };
        let new = state_machine::NewDbState::default();
        let report = status_report(&old, &new, Some(42));
        assert_eq!(report.id_mapping_count, Some(42));
    }
}
