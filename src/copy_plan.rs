//! Schema copy planner (component G): builds the table-copy mappings the
//! bulk-copy engine and drain replay both execute against.

use tracing::debug;

use crate::ast::{Expr, SqlFile, SqlType};
use crate::differ::diff_schemas;
use crate::error::{MigrationError, MigrationResult};
use crate::graph::DependencyGraph;

/// Where a target column's value comes from when copying a row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSource {
    SourceColumn(String),
    DefaultExpr(Expr),
    TypeDefault(SqlType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    pub target_col: String,
    pub source: ColumnSource,
}

/// A FK edge whose referenced table is also being copied, so the value
/// needs ID-mapping translation during bulk copy / drain replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyMapping {
    pub columns: Vec<String>,
    pub ref_table: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMapping {
    pub source_keys: Vec<String>,
    pub target_keys: Vec<String>,
    pub target_autoincrement_col: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableCopyStep {
    pub source_table: String,
    pub target_table: String,
    pub column_mappings: Vec<ColumnMapping>,
    pub foreign_keys: Vec<ForeignKeyMapping>,
    pub identity: Option<IdentityMapping>,
    /// Target columns minus the autoincrement PK column, in insert order.
    pub insert_columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyPlan {
    /// Topologically ordered so a table's FK targets appear earlier.
    pub steps: Vec<TableCopyStep>,
}

impl CopyPlan {
    #[must_use]
    pub fn step_for_source_table(&self, name: &str) -> Option<&TableCopyStep> {
        self.steps.iter().find(|s| s.source_table.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn step_for_target_table(&self, name: &str) -> Option<&TableCopyStep> {
        self.steps.iter().find(|s| s.target_table.eq_ignore_ascii_case(name))
    }
}

/// Builds the copy plan per §4.G. Only tables matched between `source` and
/// `target` (by the differ's rename detection) get a step — newly added
/// tables have no source rows to copy.
pub fn build_copy_plan(source: &SqlFile, target: &SqlFile) -> MigrationResult<CopyPlan> {
    let diff = diff_schemas(source, target);
    let target_graph = DependencyGraph::build(target);
    let target_order = target_graph.topological_order();

    let mapped_target_names: Vec<String> = diff.matched_tables.iter().map(|(_, t)| t.clone()).collect();

    let mut steps: Vec<TableCopyStep> = Vec::new();
    for (source_name, target_name) in &diff.matched_tables {
        let table_diff = diff
            .table_diffs
            .iter()
            .find(|d| d.source_name.eq_ignore_ascii_case(source_name) && d.target_name.eq_ignore_ascii_case(target_name))
            .expect("diff_schemas always produces a TableDiff per matched pair");
        let source_table = source.table(source_name).expect("matched source table exists");
        let target_table = target.table(target_name).expect("matched target table exists");

        let column_mappings: Vec<ColumnMapping> = table_diff
            .columns
            .iter()
            .map(|c| {
                let source = match &c.change {
                    crate::differ::ColumnChange::Kept { source_name } | crate::differ::ColumnChange::Renamed { source_name } => {
                        ColumnSource::SourceColumn(source_name.clone())
                    }
                    crate::differ::ColumnChange::Added { .. } => {
                        let tc = target_table.column(&c.target_column).expect("target column exists");
                        match tc.default_expr() {
                            Some(expr) => ColumnSource::DefaultExpr(expr.clone()),
                            None => ColumnSource::TypeDefault(tc.column_type),
                        }
                    }
                };
                ColumnMapping {
                    target_col: c.target_column.clone(),
                    source,
                }
            })
            .collect();

        let foreign_keys: Vec<ForeignKeyMapping> = target_table
            .foreign_keys()
            .into_iter()
            .filter(|fk| mapped_target_names.iter().any(|n| n.eq_ignore_ascii_case(&fk.ref_table)))
            .map(|fk| ForeignKeyMapping {
                columns: fk.columns,
                ref_table: fk.ref_table,
            })
            .collect();

        let identity = match (source_table.primary_key(), target_table.primary_key()) {
            (Some(spk), Some(tpk)) if spk.columns.len() == tpk.columns.len() => Some(IdentityMapping {
                source_keys: spk.columns.clone(),
                target_keys: tpk.columns.clone(),
                target_autoincrement_col: if tpk.is_autoincrement && tpk.columns.len() == 1 {
                    Some(tpk.columns[0].clone())
                } else {
                    None
                },
            }),
            _ => None,
        };

        let autoincrement_col = identity.as_ref().and_then(|i| i.target_autoincrement_col.clone());
        let insert_columns: Vec<String> = target_table
            .columns
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| Some(name) != autoincrement_col.as_ref())
            .collect();

        debug!(source = %source_name, target = %target_name, columns = column_mappings.len(), "copy step built");

        steps.push(TableCopyStep {
            source_table: source_name.clone(),
            target_table: target_name.clone(),
            column_mappings,
            foreign_keys,
            identity,
            insert_columns,
        });
    }

    steps.sort_by_key(|s| DependencyGraph::order_index(&target_order, &s.target_table).unwrap_or(usize::MAX));

    for step in &steps {
        for fk in &step.foreign_keys {
            let ref_step = steps.iter().find(|s| s.target_table.eq_ignore_ascii_case(&fk.ref_table));
            let has_identity = ref_step.is_some_and(|s| s.identity.is_some());
            if !has_identity {
                return Err(MigrationError::MalformedProject(format!(
                    "table '{}' has a foreign key to '{}' which has no identity mapping",
                    step.target_table, fk.ref_table
                )));
            }
        }
    }

    Ok(CopyPlan { steps })
}
