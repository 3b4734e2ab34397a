//! Bulk copy & ID mapping (component H): projects source rows into target
//! rows, translates foreign keys through the identity map, and records new
//! `(source identity -> target identity)` pairs as it inserts.

use std::collections::HashMap;

use tracing::{debug, info_span};

use crate::ast::Expr;
use crate::copy_plan::{ColumnSource, CopyPlan, TableCopyStep};
use crate::error::{MigrationError, MigrationLogError, MigrationResult};

/// A single row, keyed by column name.
pub type Row = HashMap<String, Expr>;

/// `table_name -> (identity_key(source pk) -> target identity column values)`.
pub type IdMappings = HashMap<String, HashMap<String, Vec<Expr>>>;

pub(crate) fn table_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Encodes a row's identity-column values into a single string per §4.H:
/// `s:`/`i:`/`r:`/`v:` per-value prefixes, joined with `|`, with `|`
/// doubled inside string/raw payloads to keep the encoding injective.
#[must_use]
pub fn identity_key(values: &[Expr]) -> String {
    values
        .iter()
        .map(|v| match v {
            Expr::String(s) => format!("s:{}", s.replace('|', "||")),
            Expr::Integer(i) => format!("i:{i}"),
            Expr::Real(r) => format!("r:{r}"),
            Expr::RawValue(s) => format!("v:{}", s.replace('|', "||")),
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// The narrow connection surface bulk copy needs: read every row of a
/// source table, and insert one projected row into a target table,
/// returning the inserted row's identity column values (via
/// `last_insert_rowid()` for an autoincrement PK, or read back from the
/// row otherwise).
pub trait BulkCopyConnection {
    fn select_all(&mut self, table: &str) -> MigrationResult<Vec<Row>>;
    fn insert_row(&mut self, table: &str, insert_columns: &[String], values: &[Expr]) -> MigrationResult<Vec<Expr>>;
}

pub(crate) fn lookup(row: &Row, col: &str) -> Expr {
    row.get(col).cloned().unwrap_or_else(|| Expr::RawValue("NULL".to_string()))
}

pub(crate) fn project_row(step: &TableCopyStep, source_row: &Row) -> Row {
    let mut out = Row::new();
    for mapping in &step.column_mappings {
        let value = match &mapping.source {
            ColumnSource::SourceColumn(name) => lookup(source_row, name),
            ColumnSource::DefaultExpr(expr) => expr.clone(),
            ColumnSource::TypeDefault(ty) => ty.type_default(),
        };
        out.insert(mapping.target_col.clone(), value);
    }
    out
}

pub(crate) fn translate_foreign_keys(step: &TableCopyStep, target_row: &mut Row, id_mappings: &IdMappings) -> MigrationResult<()> {
    for fk in &step.foreign_keys {
        let values: Vec<Expr> = fk.columns.iter().map(|c| lookup(target_row, c)).collect();
        let key = identity_key(&values);
        let mapped = id_mappings
            .get(&table_key(&fk.ref_table))
            .and_then(|m| m.get(&key))
            .ok_or_else(|| {
                MigrationError::MigrationLog(MigrationLogError::MissingIdentityMapping {
                    columns: fk.columns.clone(),
                    ref_table: fk.ref_table.clone(),
                    key: key.clone(),
                })
            })?;
        for (col, v) in fk.columns.iter().zip(mapped.iter()) {
            target_row.insert(col.clone(), v.clone());
        }
    }
    Ok(())
}

/// Executes the full copy plan against `conn`, returning the accumulated
/// ID mappings for every table with an identity mapping.
pub fn run_bulk_copy(conn: &mut impl BulkCopyConnection, plan: &CopyPlan) -> MigrationResult<IdMappings> {
    let _span = info_span!("run_bulk_copy").entered();
    let mut id_mappings: IdMappings = HashMap::new();

    for step in &plan.steps {
        let source_rows = conn.select_all(&step.source_table)?;
        debug!(table = %step.source_table, rows = source_rows.len(), "bulk copy step");
        for source_row in &source_rows {
            let mut target_row = project_row(step, source_row);
            translate_foreign_keys(step, &mut target_row, &id_mappings)?;

            let insert_values: Vec<Expr> = step.insert_columns.iter().map(|c| lookup(&target_row, c)).collect();
            let target_identity = conn.insert_row(&step.target_table, &step.insert_columns, &insert_values)?;

            if let Some(identity) = &step.identity {
                let source_pk_values: Vec<Expr> = identity.source_keys.iter().map(|k| lookup(source_row, k)).collect();
                let key = identity_key(&source_pk_values);
                id_mappings
                    .entry(table_key(&step.target_table))
                    .or_default()
                    .insert(key, target_identity);
            }
        }
    }

    Ok(id_mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    struct MockConn {
        rows: HashMap<String, Vec<Row>>,
        inserted: HashMap<String, Vec<Row>>,
        next_rowid: i64,
    }

    impl MockConn {
        fn new() -> Self {
            Self {
                rows: HashMap::new(),
                inserted: HashMap::new(),
                next_rowid: 1,
            }
        }
    }

    impl BulkCopyConnection for MockConn {
        fn select_all(&mut self, table: &str) -> MigrationResult<Vec<Row>> {
            Ok(self.rows.get(&table_key(table)).cloned().unwrap_or_default())
        }

        fn insert_row(&mut self, table: &str, columns: &[String], values: &[Expr]) -> MigrationResult<Vec<Expr>> {
            let mut row = Row::new();
            for (c, v) in columns.iter().zip(values.iter()) {
                row.insert(c.clone(), v.clone());
            }
            let id = self.next_rowid;
            self.next_rowid += 1;
            row.insert("id".to_string(), Expr::Integer(id));
            self.inserted.entry(table_key(table)).or_default().push(row);
            Ok(vec![Expr::Integer(id)])
        }
    }

    #[test]
    fn identity_key_escapes_pipe() {
        let key = identity_key(&[Expr::String("a|b".to_string()), Expr::Integer(5)]);
        assert_eq!(key, "s:a||b|i:5");
    }

    #[test]
    fn scenario_4_bulk_copy_with_fk_translation() {
        let source = parse(
            "a.sql",
            "CREATE TABLE legacy_account(id integer PRIMARY KEY AUTOINCREMENT, name text NOT NULL);\
             CREATE TABLE invoice(id integer PRIMARY KEY AUTOINCREMENT, legacy_account_id integer REFERENCES legacy_account(id), total real NOT NULL);",
        )
        .unwrap();
        let target = parse(
            "b.sql",
            "CREATE TABLE account(id integer PRIMARY KEY AUTOINCREMENT, name text NOT NULL);\
             CREATE TABLE invoice(id integer PRIMARY KEY AUTOINCREMENT, account_id integer REFERENCES account(id), total real NOT NULL);",
        )
        .unwrap();
        let plan = crate::copy_plan::build_copy_plan(&source, &target).unwrap();

        let mut conn = MockConn::new();
        let mut account_row = Row::new();
        account_row.insert("id".to_string(), Expr::Integer(10));
        account_row.insert("name".to_string(), Expr::String("Alice".to_string()));
        conn.rows.insert("legacy_account".to_string(), vec![account_row]);

        let mut invoice_row = Row::new();
        invoice_row.insert("id".to_string(), Expr::Integer(100));
        invoice_row.insert("legacy_account_id".to_string(), Expr::Integer(10));
        invoice_row.insert("total".to_string(), Expr::Real(42.5));
        conn.rows.insert("invoice".to_string(), vec![invoice_row]);

        let id_mappings = run_bulk_copy(&mut conn, &plan).unwrap();

        let accounts = &conn.inserted["account"];
        assert_eq!(accounts.len(), 1);
        let new_account_id = accounts[0]["id"].clone();

        let invoices = &conn.inserted["invoice"];
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0]["account_id"], new_account_id);

        let mapped = &id_mappings["account"][&identity_key(&[Expr::Integer(10)])];
        assert_eq!(mapped, &vec![new_account_id]);
    }

    #[test]
    fn missing_fk_mapping_is_an_error() {
        let source = parse(
            "a.sql",
            "CREATE TABLE parent(id integer PRIMARY KEY AUTOINCREMENT);\
             CREATE TABLE child(id integer PRIMARY KEY AUTOINCREMENT, parent_id integer REFERENCES parent(id));",
        )
        .unwrap();
        let target = source.clone();
        let plan = crate::copy_plan::build_copy_plan(&source, &target).unwrap();

        let mut conn = MockConn::new();
        // No parent rows at all, so child's FK translation has nothing to map.
        let mut child_row = Row::new();
        child_row.insert("id".to_string(), Expr::Integer(1));
        child_row.insert("parent_id".to_string(), Expr::Integer(99));
        conn.rows.insert("child".to_string(), vec![child_row]);

        let result = run_bulk_copy(&mut conn, &plan);
        assert!(matches!(
            result,
            Err(MigrationError::MigrationLog(MigrationLogError::MissingIdentityMapping { .. }))
        ));
    }
}
