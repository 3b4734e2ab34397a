//! Migration planner (component F): orchestrates the parser's AST, the
//! dependency graph, the differ and the DDL generator into one ordered
//! statement list.

use tracing::{debug, info_span};

use crate::ast::SqlFile;
use crate::ddl;
use crate::differ::{diff_schemas, ColumnChange, SchemaDiff, TableDiff};
use crate::error::{MigrationError, MigrationResult};
use crate::graph::DependencyGraph;

/// One step of a migration plan: either a real statement to execute, or an
/// advisory comment (never sent to the driver, but part of the plan's
/// textual record).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Statement(String),
    Comment(String),
}

impl PlanStep {
    #[must_use]
    pub fn as_sql(&self) -> Option<&str> {
        match self {
            Self::Statement(s) => Some(s),
            Self::Comment(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub steps: Vec<PlanStep>,
}

impl MigrationPlan {
    #[must_use]
    pub fn statements(&self) -> Vec<&str> {
        self.steps.iter().filter_map(PlanStep::as_sql).collect()
    }

    fn push_stmt(&mut self, sql: String) {
        self.steps.push(PlanStep::Statement(sql));
    }

    fn push_comment(&mut self, comment: String) {
        self.steps.push(PlanStep::Comment(comment));
    }
}

fn reverse_topo_order(graph: &DependencyGraph) -> Vec<String> {
    let mut order = graph.topological_order();
    order.reverse();
    order
}

fn sort_by_order(names: &[String], order: &[String]) -> Vec<String> {
    let mut out = names.to_vec();
    out.sort_by_key(|n| DependencyGraph::order_index(order, n).unwrap_or(usize::MAX));
    out
}

/// A table-level column-migration branch: which DDL shape §4.F applies.
enum ColumnPlan {
    /// No column changes at all.
    None,
    /// Plain drops, table has no foreign keys.
    PlainDrop { columns: Vec<String> },
    /// Full table recreate (FK-guarded drop, pure rename, or any addition).
    Recreate { warn_added: Vec<String> },
}

fn classify_column_plan(diff: &TableDiff, target: &crate::ast::CreateTable) -> ColumnPlan {
    let added: Vec<String> = diff
        .columns
        .iter()
        .filter(|c| matches!(c.change, ColumnChange::Added { .. }))
        .map(|c| c.target_column.clone())
        .collect();
    let renamed = diff.has_renamed_columns();
    let dropped = &diff.dropped_columns;

    if added.is_empty() && !renamed && dropped.is_empty() {
        return ColumnPlan::None;
    }
    if added.is_empty() && !renamed && !dropped.is_empty() {
        if target.foreign_keys().is_empty() {
            return ColumnPlan::PlainDrop {
                columns: dropped.clone(),
            };
        }
        return ColumnPlan::Recreate { warn_added: Vec::new() };
    }
    ColumnPlan::Recreate { warn_added: added }
}

/// Emits the `<t>_temp` recreate sequence for a matched table pair, per
/// §4.F and the worked example in §8 scenario 1. The `SELECT` projects each
/// target column from its matched source column, or from its fill
/// expression when the column is new.
fn emit_recreate(plan: &mut MigrationPlan, diff: &TableDiff, target: &crate::ast::CreateTable, warn_added: &[String]) {
    if !warn_added.is_empty() {
        plan.push_comment(format!(
            "WARNING addition of columns [{}] requires a complimentary script to ensure data integrity",
            warn_added.join(", ")
        ));
    }

    let temp_name = format!("{}_temp", target.name);
    plan.push_stmt(ddl::render_create_table_with_columns(&temp_name, &target.columns, &target.constraints));

    let target_cols: Vec<String> = target.columns.iter().map(|c| c.name.clone()).collect();
    let select_exprs: Vec<String> = diff
        .columns
        .iter()
        .map(|c| match &c.change {
            ColumnChange::Kept { source_name } | ColumnChange::Renamed { source_name } => source_name.clone(),
            ColumnChange::Added { fill } => render_fill(fill),
        })
        .collect();

    plan.push_stmt(format!(
        "INSERT INTO {}({}) SELECT {} FROM {}",
        temp_name,
        target_cols.join(", "),
        select_exprs.join(", "),
        diff.source_name,
    ));
    plan.push_stmt(ddl::render_drop_table(&diff.source_name));
    plan.push_stmt(ddl::render_rename_table(&temp_name, &target.name));
}

fn render_fill(expr: &crate::ast::Expr) -> String {
    match expr {
        crate::ast::Expr::String(s) => format!("'{}'", s.replace('\'', "''")),
        crate::ast::Expr::Integer(i) => i.to_string(),
        crate::ast::Expr::Real(r) => {
            if r.fract() == 0.0 {
                format!("{r:.1}")
            } else {
                r.to_string()
            }
        }
        crate::ast::Expr::RawValue(v) => v.clone(),
    }
}

/// Orchestrates parse+graph+diff+ddl into the ordered plan described by
/// §4.F. Fails with [`MigrationError::MissingDependencies`] if either
/// schema has unresolved references.
pub fn plan_migration(db_schema: &SqlFile, expected_schema: &SqlFile) -> MigrationResult<MigrationPlan> {
    let _span = info_span!("plan_migration").entered();

    let source_graph = DependencyGraph::build(db_schema);
    let target_graph = DependencyGraph::build(expected_schema);
    if source_graph.has_missing_references() || target_graph.has_missing_references() {
        return Err(MigrationError::MissingDependencies {
            left: source_graph.missing_references.clone(),
            right: target_graph.missing_references.clone(),
        });
    }

    let source_order = source_graph.topological_order();
    let target_order = target_graph.topological_order();
    let source_order_rev = reverse_topo_order(&source_graph);

    let diff: SchemaDiff = diff_schemas(db_schema, expected_schema);

    let mut plan = MigrationPlan::default();

    // Step 2: column migrations, and track which target tables were recreated
    // (used for the view cascade in step 3).
    let mut recreated_targets: Vec<String> = Vec::new();
    let mut table_bodies: Vec<(String, MigrationPlan)> = Vec::new();
    let mut renamed_without_change: Vec<(String, String)> = Vec::new();

    for (source_name, target_name) in &diff.matched_tables {
        let table_diff = diff
            .table_diffs
            .iter()
            .find(|d| d.source_name.eq_ignore_ascii_case(source_name) && d.target_name.eq_ignore_ascii_case(target_name))
            .expect("diff_schemas always produces a TableDiff per matched pair");
        let target_table = expected_schema.table(target_name).expect("target table exists");

        let mut body = MigrationPlan::default();
        match classify_column_plan(table_diff, target_table) {
            ColumnPlan::None => {
                if !source_name.eq_ignore_ascii_case(target_name) {
                    renamed_without_change.push((source_name.clone(), target_name.clone()));
                }
            }
            ColumnPlan::PlainDrop { columns } => {
                for col in &columns {
                    body.push_stmt(ddl::render_drop_column(source_name, col));
                }
                debug!(table = %source_name, dropped = ?columns, "plain column drop");
            }
            ColumnPlan::Recreate { warn_added } => {
                emit_recreate(&mut body, table_diff, target_table, &warn_added);
                recreated_targets.push(target_name.clone());
            }
        }
        if !body.steps.is_empty() {
            table_bodies.push((target_name.clone(), body));
        }
    }

    // Step 3: view cascade around recreated tables.
    let affected_views: Vec<String> = expected_schema
        .views
        .iter()
        .filter(|v| {
            v.dependencies
                .iter()
                .any(|d| recreated_targets.iter().any(|t| t.eq_ignore_ascii_case(d)))
        })
        .map(|v| v.name.clone())
        .collect();

    let needs_pragma_bookend =
        !recreated_targets.is_empty() || source_graph.has_cycles() || target_graph.has_cycles();

    if needs_pragma_bookend {
        plan.push_stmt("PRAGMA foreign_keys=OFF".to_string());
    }

    for name in sort_by_order(&affected_views, &reverse_topo_order(&target_graph)) {
        plan.push_stmt(ddl::render_drop_view(&name));
    }

    // Column bodies themselves, ordered by target topological order for
    // determinism.
    let body_order = sort_by_order(
        &table_bodies.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
        &target_order,
    );
    for name in &body_order {
        if let Some((_, body)) = table_bodies.iter().find(|(n, _)| n == name) {
            plan.steps.extend(body.steps.iter().cloned());
        }
    }

    // Step 4: table migrations (drops, creates, plain renames).
    let drop_order = sort_by_order(&diff.removed_tables, &source_order_rev);
    for name in &drop_order {
        plan.push_stmt(ddl::render_drop_table(name));
    }
    let create_order = sort_by_order(&diff.added_tables, &target_order);
    for name in &create_order {
        let t = expected_schema.table(name).expect("added table exists");
        plan.push_stmt(ddl::render_create_table(t));
    }
    for (old, new) in &renamed_without_change {
        plan.push_stmt(ddl::render_rename_table(old, new));
    }

    // Step 5: unaffected view migrations (by-name added/removed).
    let removed_views_order = sort_by_order(&diff.removed_views, &source_order_rev);
    for name in &removed_views_order {
        plan.push_stmt(ddl::render_drop_view(name));
    }
    let added_views_order = sort_by_order(&diff.added_views, &target_order);
    for name in &added_views_order {
        let v = expected_schema.view(name).expect("added view exists");
        plan.push_stmt(ddl::render_create_view(v));
    }

    // Post-table view creates (the cascade views dropped in step 3).
    for name in sort_by_order(&affected_views, &target_order) {
        let v = expected_schema.view(&name).expect("affected view exists in target");
        plan.push_stmt(ddl::render_create_view(v));
    }

    // Step 6: index migrations.
    let removed_index_order = sort_by_order(&diff.removed_indexes, &source_order_rev);
    for name in &removed_index_order {
        plan.push_stmt(ddl::render_drop_index(name));
    }
    let added_index_order = sort_by_order(&diff.added_indexes, &target_order);
    for name in &added_index_order {
        let idx = expected_schema
            .indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
            .expect("added index exists");
        plan.push_stmt(ddl::render_create_index(idx));
    }

    // Trigger migrations.
    let removed_trigger_order = sort_by_order(&diff.removed_triggers, &source_order_rev);
    for name in &removed_trigger_order {
        plan.push_stmt(ddl::render_drop_trigger(name));
    }
    let added_trigger_order = sort_by_order(&diff.added_triggers, &target_order);
    for name in &added_trigger_order {
        let trg = expected_schema
            .triggers
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .expect("added trigger exists");
        plan.push_stmt(ddl::render_create_trigger(trg));
    }

    if needs_pragma_bookend {
        plan.push_stmt("PRAGMA foreign_keys=ON".to_string());
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn scenario_1_add_column_with_default() {
        let source = parse("a.sql", "CREATE TABLE student(id integer NOT NULL, name text NOT NULL);").unwrap();
        let target = parse(
            "b.sql",
            "CREATE TABLE student(id integer NOT NULL, name text NOT NULL, age integer NOT NULL);",
        )
        .unwrap();
        let plan = plan_migration(&source, &target).unwrap();
        let stmts = plan.statements();
        assert_eq!(stmts[0], "PRAGMA foreign_keys=OFF");
        assert!(stmts[1].starts_with("CREATE TABLE student_temp("));
        assert_eq!(
            stmts[2],
            "INSERT INTO student_temp(id, name, age) SELECT id, name, 0 FROM student"
        );
        assert_eq!(stmts[3], "DROP TABLE student");
        assert_eq!(stmts[4], "ALTER TABLE student_temp RENAME TO student");
        assert_eq!(stmts[5], "PRAGMA foreign_keys=ON");
    }

    #[test]
    fn scenario_2_rename_table_by_signature() {
        let source = parse("a.sql", "CREATE TABLE table0(id integer NOT NULL);").unwrap();
        let target = parse("b.sql", "CREATE TABLE table1(id integer NOT NULL);").unwrap();
        let plan = plan_migration(&source, &target).unwrap();
        assert_eq!(plan.statements(), vec!["ALTER TABLE table0 RENAME TO table1"]);
    }

    #[test]
    fn scenario_3_view_cascade_around_recreate() {
        let source = parse(
            "a.sql",
            "CREATE TABLE parent(id integer PRIMARY KEY);\
             CREATE TABLE child(id integer PRIMARY KEY, parent_id integer REFERENCES parent(id));\
             CREATE VIEW child_view AS SELECT c.id, c.parent_id FROM child c;",
        )
        .unwrap();
        let target = parse(
            "b.sql",
            "CREATE TABLE parent(id integer PRIMARY KEY);\
             CREATE TABLE child(id integer PRIMARY KEY, parent_id integer REFERENCES parent(id) ON DELETE CASCADE);\
             CREATE VIEW child_view AS SELECT c.id, c.parent_id FROM child c;",
        )
        .unwrap();
        let plan = plan_migration(&source, &target).unwrap();
        let stmts = plan.statements();
        let drop_view_idx = stmts.iter().position(|s| *s == "DROP VIEW child_view").unwrap();
        let recreate_idx = stmts.iter().position(|s| s.starts_with("CREATE TABLE child_temp(")).unwrap();
        let rename_idx = stmts.iter().position(|s| *s == "ALTER TABLE child_temp RENAME TO child").unwrap();
        let create_view_idx = stmts.iter().position(|s| s.starts_with("CREATE VIEW child_view")).unwrap();
        assert!(drop_view_idx < recreate_idx);
        assert!(recreate_idx < rename_idx);
        assert!(rename_idx < create_view_idx);
    }

    #[test]
    fn missing_dependency_fails() {
        let source = parse("a.sql", "CREATE TABLE t(id integer PRIMARY KEY);").unwrap();
        let target = parse(
            "b.sql",
            "CREATE TABLE t(id integer PRIMARY KEY, ghost_id integer REFERENCES ghost(id));",
        )
        .unwrap();
        let result = plan_migration(&source, &target);
        assert!(matches!(result, Err(MigrationError::MissingDependencies { .. })));
    }

    #[test]
    fn plain_drop_column_no_fk() {
        let source = parse("a.sql", "CREATE TABLE t(id integer NOT NULL, extra text);").unwrap();
        let target = parse("b.sql", "CREATE TABLE t(id integer NOT NULL);").unwrap();
        let plan = plan_migration(&source, &target).unwrap();
        assert_eq!(plan.statements(), vec!["ALTER TABLE t DROP COLUMN extra"]);
    }
}
