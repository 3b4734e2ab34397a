//! Schema differ and rename detector (component D).

use std::collections::{HashMap, HashSet};

use crate::ast::{ColumnDef, CreateTable, Expr, SqlFile};

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnChange {
    /// Target column has no viable source match; carries the expression to
    /// populate it with (its own `DEFAULT`, or the type default).
    Added { fill: Expr },
    /// Source and target column names differ but were matched by type/PK/FK
    /// compatibility or name similarity.
    Renamed { source_name: String },
    /// Exact name match, no structural change beyond constraints.
    Kept { source_name: String },
}

#[derive(Debug, Clone)]
pub struct ColumnDiff {
    pub target_column: String,
    pub change: ColumnChange,
}

#[derive(Debug, Clone)]
pub struct TableDiff {
    pub source_name: String,
    pub target_name: String,
    pub columns: Vec<ColumnDiff>,
    pub dropped_columns: Vec<String>,
}

impl TableDiff {
    #[must_use]
    pub fn is_rename(&self) -> bool {
        !self.source_name.eq_ignore_ascii_case(&self.target_name)
    }

    #[must_use]
    pub fn has_added_columns(&self) -> bool {
        self.columns.iter().any(|c| matches!(c.change, ColumnChange::Added { .. }))
    }

    #[must_use]
    pub fn has_renamed_columns(&self) -> bool {
        self.columns.iter().any(|c| match &c.change {
            ColumnChange::Renamed { source_name } => !source_name.eq_ignore_ascii_case(&c.target_column),
            _ => false,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    /// `(source_name, target_name)`, sorted by target name.
    pub matched_tables: Vec<(String, String)>,
    pub table_diffs: Vec<TableDiff>,
    pub removed_tables: Vec<String>,
    pub added_tables: Vec<String>,
    pub removed_views: Vec<String>,
    pub added_views: Vec<String>,
    pub removed_indexes: Vec<String>,
    pub added_indexes: Vec<String>,
    pub removed_triggers: Vec<String>,
    pub added_triggers: Vec<String>,
}

fn underscore_tokens(name: &str) -> HashSet<String> {
    name.to_ascii_lowercase()
        .split('_')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Name-similarity score per §4.D: token-intersection size × 3, plus an
/// equal-name bonus of 20, plus a suffix-containment bonus of 4.
fn name_similarity_score(a: &str, b: &str) -> i64 {
    let ta = underscore_tokens(a);
    let tb = underscore_tokens(b);
    let intersection = ta.intersection(&tb).count() as i64;
    let mut score = intersection * 3;
    if a.eq_ignore_ascii_case(b) {
        score += 20;
    }
    let (la, lb) = (a.to_ascii_lowercase(), b.to_ascii_lowercase());
    if la.ends_with(&lb) || lb.ends_with(&la) {
        score += 4;
    }
    score
}

fn column_compat_key(c: &ColumnDef) -> (crate::ast::SqlType, bool, bool) {
    (c.column_type, c.primary_key().is_some(), c.foreign_key().is_some())
}

/// Diffs two schemas per §4.D: exact signature-based renames, then
/// heuristic renames, leaving the rest as plain removed/added.
#[must_use]
pub fn diff_schemas(source: &SqlFile, target: &SqlFile) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    let mut unmatched_source: Vec<&CreateTable> = source.tables.iter().collect();
    let mut unmatched_target: Vec<&CreateTable> = target.tables.iter().collect();

    let mut renamed_pairs: Vec<(String, String)> = Vec::new();
    let mut unchanged: Vec<String> = Vec::new();

    // Unchanged: same name present on both sides.
    unmatched_source.retain(|s| {
        if let Some(pos) = unmatched_target.iter().position(|t| t.name.eq_ignore_ascii_case(&s.name)) {
            unchanged.push(s.name.clone());
            unmatched_target.remove(pos);
            false
        } else {
            true
        }
    });

    // Exact renames: structural-signature equality among the remainder.
    let mut still_unmatched_source: Vec<&CreateTable> = Vec::new();
    'outer: for s in unmatched_source {
        let sig = s.signature();
        for (i, t) in unmatched_target.iter().enumerate() {
            if t.signature() == sig {
                renamed_pairs.push((s.name.clone(), t.name.clone()));
                unmatched_target.remove(i);
                continue 'outer;
            }
        }
        still_unmatched_source.push(s);
    }
    let unmatched_source = still_unmatched_source;

    // Heuristic renames: greedy assignment by (copied_columns, name_score, -target_columns).
    #[derive(Debug)]
    struct Candidate<'a> {
        source: &'a CreateTable,
        target: &'a CreateTable,
        copied: usize,
        name_score: i64,
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for s in &unmatched_source {
        for t in &unmatched_target {
            let mut used_target_cols: HashSet<String> = HashSet::new();
            let mut copied = 0usize;
            for sc in &s.columns {
                let key = column_compat_key(sc);
                if let Some(tc) = t.columns.iter().find(|tc| {
                    !used_target_cols.contains(&tc.name.to_ascii_lowercase())
                        && tc.name.eq_ignore_ascii_case(&sc.name)
                        && column_compat_key(tc) == key
                }) {
                    used_target_cols.insert(tc.name.to_ascii_lowercase());
                    copied += 1;
                }
            }
            let name_score = name_similarity_score(&s.name, &t.name);
            let src_len = s.columns.len();
            let tgt_len = t.columns.len();
            let eligible = (copied >= src_len.min(tgt_len) && copied > 0)
                || (copied * 2 >= tgt_len && name_score > 0);
            if eligible {
                candidates.push(Candidate {
                    source: s,
                    target: t,
                    copied,
                    name_score,
                });
            }
        }
    }
    candidates.sort_by(|a, b| {
        b.copied
            .cmp(&a.copied)
            .then(b.name_score.cmp(&a.name_score))
            .then(a.target.columns.len().cmp(&b.target.columns.len()))
    });

    let mut bound_source: HashSet<String> = HashSet::new();
    let mut bound_target: HashSet<String> = HashSet::new();
    for c in &candidates {
        let sk = c.source.name.to_ascii_lowercase();
        let tk = c.target.name.to_ascii_lowercase();
        if bound_source.contains(&sk) || bound_target.contains(&tk) {
            continue;
        }
        bound_source.insert(sk);
        bound_target.insert(tk);
        renamed_pairs.push((c.source.name.clone(), c.target.name.clone()));
    }

    diff.removed_tables = unmatched_source
        .iter()
        .filter(|s| !bound_source.contains(&s.name.to_ascii_lowercase()))
        .map(|s| s.name.clone())
        .collect();
    diff.added_tables = unmatched_target
        .iter()
        .filter(|t| !bound_target.contains(&t.name.to_ascii_lowercase()))
        .map(|t| t.name.clone())
        .collect();

    let mut matched: Vec<(String, String)> = unchanged.iter().map(|n| (n.clone(), n.clone())).collect();
    matched.extend(renamed_pairs);
    matched.sort_by(|a, b| a.1.to_ascii_lowercase().cmp(&b.1.to_ascii_lowercase()));
    diff.matched_tables = matched.clone();

    for (sname, tname) in &matched {
        let s = source.table(sname).expect("matched source table exists");
        let t = target.table(tname).expect("matched target table exists");
        diff.table_diffs.push(diff_columns(s, t));
    }

    // Views: removed/added by name.
    let src_view_names: HashSet<String> = source.views.iter().map(|v| v.name.to_ascii_lowercase()).collect();
    let tgt_view_names: HashSet<String> = target.views.iter().map(|v| v.name.to_ascii_lowercase()).collect();
    diff.removed_views = source
        .views
        .iter()
        .filter(|v| !tgt_view_names.contains(&v.name.to_ascii_lowercase()))
        .map(|v| v.name.clone())
        .collect();
    diff.added_views = target
        .views
        .iter()
        .filter(|v| !src_view_names.contains(&v.name.to_ascii_lowercase()))
        .map(|v| v.name.clone())
        .collect();

    // Triggers: removed/added by name.
    let src_trg_names: HashSet<String> = source.triggers.iter().map(|t| t.name.to_ascii_lowercase()).collect();
    let tgt_trg_names: HashSet<String> = target.triggers.iter().map(|t| t.name.to_ascii_lowercase()).collect();
    diff.removed_triggers = source
        .triggers
        .iter()
        .filter(|t| !tgt_trg_names.contains(&t.name.to_ascii_lowercase()))
        .map(|t| t.name.clone())
        .collect();
    diff.added_triggers = target
        .triggers
        .iter()
        .filter(|t| !src_trg_names.contains(&t.name.to_ascii_lowercase()))
        .map(|t| t.name.clone())
        .collect();

    // Indexes: removed/added by generated CREATE SQL (structural change = remove+add).
    let src_index_sql: HashMap<String, String> = source
        .indexes
        .iter()
        .map(|i| (i.name.to_ascii_lowercase(), crate::ddl::render_create_index(i)))
        .collect();
    let tgt_index_sql: HashMap<String, String> = target
        .indexes
        .iter()
        .map(|i| (i.name.to_ascii_lowercase(), crate::ddl::render_create_index(i)))
        .collect();
    for (name, sql) in &src_index_sql {
        if tgt_index_sql.get(name) != Some(sql) {
            diff.removed_indexes.push(
                source
                    .indexes
                    .iter()
                    .find(|i| i.name.eq_ignore_ascii_case(name))
                    .unwrap()
                    .name
                    .clone(),
            );
        }
    }
    for (name, sql) in &tgt_index_sql {
        if src_index_sql.get(name) != Some(sql) {
            diff.added_indexes.push(
                target
                    .indexes
                    .iter()
                    .find(|i| i.name.eq_ignore_ascii_case(name))
                    .unwrap()
                    .name
                    .clone(),
            );
        }
    }

    diff
}

/// Diffs the columns of a single matched `(source, target)` table pair per
/// §4.D's four-step column-matching rule.
fn diff_columns(source: &CreateTable, target: &CreateTable) -> TableDiff {
    let mut consumed_source: HashSet<String> = HashSet::new();
    let mut columns = Vec::new();

    for tc in &target.columns {
        // (1) exact name match.
        if let Some(sc) = source
            .columns
            .iter()
            .find(|sc| sc.name.eq_ignore_ascii_case(&tc.name) && !consumed_source.contains(&sc.name.to_ascii_lowercase()))
        {
            consumed_source.insert(sc.name.to_ascii_lowercase());
            columns.push(ColumnDiff {
                target_column: tc.name.clone(),
                change: ColumnChange::Kept {
                    source_name: sc.name.clone(),
                },
            });
            continue;
        }

        // (2)/(3) compatible-type candidates not yet consumed.
        let key = column_compat_key(tc);
        let candidates: Vec<&ColumnDef> = source
            .columns
            .iter()
            .filter(|sc| !consumed_source.contains(&sc.name.to_ascii_lowercase()) && column_compat_key(sc) == key)
            .collect();

        let chosen = match candidates.len() {
            0 => None,
            1 => Some(candidates[0]),
            _ => {
                let mut scored: Vec<(i64, &ColumnDef)> = candidates
                    .iter()
                    .map(|sc| (name_similarity_score(&sc.name, &tc.name), *sc))
                    .collect();
                scored.sort_by(|a, b| b.0.cmp(&a.0));
                if scored.len() >= 2 && scored[0].0 > scored[1].0 {
                    Some(scored[0].1)
                } else {
                    None
                }
            }
        };

        if let Some(sc) = chosen {
            consumed_source.insert(sc.name.to_ascii_lowercase());
            columns.push(ColumnDiff {
                target_column: tc.name.clone(),
                change: ColumnChange::Renamed {
                    source_name: sc.name.clone(),
                },
            });
        } else {
            let fill = tc.default_expr().cloned().unwrap_or_else(|| tc.column_type.type_default());
            columns.push(ColumnDiff {
                target_column: tc.name.clone(),
                change: ColumnChange::Added { fill },
            });
        }
    }

    let dropped_columns: Vec<String> = source
        .columns
        .iter()
        .filter(|sc| !consumed_source.contains(&sc.name.to_ascii_lowercase()))
        .map(|sc| sc.name.clone())
        .collect();

    TableDiff {
        source_name: source.name.clone(),
        target_name: target.name.clone(),
        columns,
        dropped_columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn unchanged_table_has_no_changes() {
        let sql = "CREATE TABLE t(id integer NOT NULL);";
        let s = parse("a.sql", sql).unwrap();
        let t = parse("b.sql", sql).unwrap();
        let diff = diff_schemas(&s, &t);
        assert_eq!(diff.matched_tables, vec![("t".to_string(), "t".to_string())]);
        assert!(diff.removed_tables.is_empty());
        assert!(diff.added_tables.is_empty());
    }

    #[test]
    fn exact_signature_rename() {
        let s = parse("a.sql", "CREATE TABLE table0(id integer NOT NULL);").unwrap();
        let t = parse("b.sql", "CREATE TABLE table1(id integer NOT NULL);").unwrap();
        let diff = diff_schemas(&s, &t);
        assert_eq!(diff.matched_tables, vec![("table0".to_string(), "table1".to_string())]);
        assert!(diff.removed_tables.is_empty());
        assert!(diff.added_tables.is_empty());
    }

    #[test]
    fn add_column_with_default() {
        let s = parse("a.sql", "CREATE TABLE student(id integer NOT NULL, name text NOT NULL);").unwrap();
        let t = parse(
            "b.sql",
            "CREATE TABLE student(id integer NOT NULL, name text NOT NULL, age integer NOT NULL);",
        )
        .unwrap();
        let diff = diff_schemas(&s, &t);
        let td = &diff.table_diffs[0];
        assert!(td.has_added_columns());
        let age = td.columns.iter().find(|c| c.target_column == "age").unwrap();
        assert!(matches!(age.change, ColumnChange::Added { fill: Expr::Integer(0) }));
    }

    #[test]
    fn removed_column_tracked() {
        let s = parse("a.sql", "CREATE TABLE t(id integer NOT NULL, old_col text);").unwrap();
        let t = parse("b.sql", "CREATE TABLE t(id integer NOT NULL);").unwrap();
        let diff = diff_schemas(&s, &t);
        assert_eq!(diff.table_diffs[0].dropped_columns, vec!["old_col".to_string()]);
    }
}
