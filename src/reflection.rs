//! Schema reflection (component M): builds a [`SqlFile`] by describing a
//! live database's actual tables rather than parsing a source file,
//! letting the planner diff "what's there" against "what's wanted" the
//! same way it diffs two parsed schemas.

use crate::ast::{ColumnConstraint, ColumnDef, CreateTable, Expr, ForeignKey, PrimaryKey, SqlFile, SqlType};

/// One column as reported by a live database's own catalog (e.g.
/// `PRAGMA table_info`).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub sql_type: SqlType,
    pub not_null: bool,
    pub default: Option<Expr>,
    pub is_primary_key: bool,
    pub pk_autoincrement: bool,
}

impl ColumnDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            not_null: false,
            default: None,
            is_primary_key: false,
            pk_autoincrement: false,
        }
    }
}

/// A foreign key as reported by a live database's own catalog (e.g.
/// `PRAGMA foreign_key_list`).
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDescriptor {
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

/// Reflects a live database into a [`SqlFile`]. Views, indexes and
/// triggers are intentionally out of scope: reflection exists to compare
/// a live table's column shape against an expected schema, not to
/// reconstruct arbitrary SQL text the catalog only stores as opaque
/// strings anyway.
pub trait SchemaSource {
    fn table_names(&self) -> Vec<String>;
    fn describe_columns(&self, table: &str) -> Vec<ColumnDescriptor>;
    fn describe_foreign_keys(&self, table: &str) -> Vec<ForeignKeyDescriptor>;
}

/// Folds `(table_name, columns, foreign_keys)` triples into a [`SqlFile`],
/// reusing the same `CreateTable` invariants the parser enforces (a
/// single-column integer PK marked `is_autoincrement` only when the
/// catalog itself reports it, multi-column PKs as a table-level
/// constraint).
#[derive(Debug, Default)]
pub struct ReflectedSchemaBuilder {
    tables: Vec<CreateTable>,
}

impl ReflectedSchemaBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_table(mut self, name: impl Into<String>, columns: Vec<ColumnDescriptor>, foreign_keys: Vec<ForeignKeyDescriptor>) -> Self {
        let name = name.into();
        let pk_cols: Vec<&ColumnDescriptor> = columns.iter().filter(|c| c.is_primary_key).collect();

        let mut table = CreateTable::new(name.clone());
        for col in &columns {
            let mut def = ColumnDef::new(col.name.clone(), col.sql_type);
            if col.not_null {
                def.constraints.push(ColumnConstraint::NotNull);
            }
            if let Some(expr) = &col.default {
                def.constraints.push(ColumnConstraint::Default(expr.clone()));
            }
            if col.is_primary_key && pk_cols.len() == 1 {
                def.constraints.push(ColumnConstraint::PrimaryKey(PrimaryKey {
                    constraint_name: None,
                    columns: Vec::new(),
                    is_autoincrement: col.pk_autoincrement,
                }));
            }
            if let Some(fk) = foreign_keys.iter().find(|fk| fk.columns == vec![col.name.clone()]) {
                def.constraints.push(ColumnConstraint::ForeignKey(ForeignKey {
                    columns: fk.columns.clone(),
                    ref_table: fk.ref_table.clone(),
                    ref_columns: fk.ref_columns.clone(),
                    on_delete: None,
                    on_update: None,
                }));
            }
            table.columns.push(def);
        }

        if pk_cols.len() > 1 {
            table.constraints.push(ColumnConstraint::PrimaryKey(PrimaryKey {
                constraint_name: None,
                columns: pk_cols.iter().map(|c| c.name.clone()).collect(),
                is_autoincrement: false,
            }));
        }

        for fk in &foreign_keys {
            if fk.columns.len() > 1 {
                table.constraints.push(ColumnConstraint::ForeignKey(ForeignKey {
                    columns: fk.columns.clone(),
                    ref_table: fk.ref_table.clone(),
                    ref_columns: fk.ref_columns.clone(),
                    on_delete: None,
                    on_update: None,
                }));
            }
        }

        self.tables.push(table);
        self
    }

    #[must_use]
    pub fn build(self) -> SqlFile {
        SqlFile {
            tables: self.tables,
            ..SqlFile::default()
        }
    }
}

/// Reflects every table `source` reports into a [`SqlFile`].
#[must_use]
pub fn reflect_schema(source: &impl SchemaSource) -> SqlFile {
    let mut builder = ReflectedSchemaBuilder::new();
    for table in source.table_names() {
        let columns = source.describe_columns(&table);
        let foreign_keys = source.describe_foreign_keys(&table);
        builder = builder.add_table(table, columns, foreign_keys);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    impl SchemaSource for FixedSource {
        fn table_names(&self) -> Vec<String> {
            vec!["account".to_string()]
        }

        fn describe_columns(&self, _table: &str) -> Vec<ColumnDescriptor> {
            vec![
                ColumnDescriptor {
                    is_primary_key: true,
                    pk_autoincrement: true,
                    ..ColumnDescriptor::new("id", SqlType::Integer)
                },
                ColumnDescriptor {
                    not_null: true,
                    ..ColumnDescriptor::new("name", SqlType::Text)
                },
            ]
        }

        fn describe_foreign_keys(&self, _table: &str) -> Vec<ForeignKeyDescriptor> {
            Vec::new()
        }
    }

    #[test]
    fn reflects_single_column_autoincrement_pk() {
        let schema = reflect_schema(&FixedSource);
        let table = schema.table("account").unwrap();
        let pk = table.primary_key().unwrap();
        assert_eq!(pk.columns, vec!["id".to_string()]);
        assert!(pk.is_autoincrement);
        assert!(!table.column("name").unwrap().is_nullable());
    }

    #[test]
    fn reflects_composite_primary_key_as_table_constraint() {
        struct CompositeSource;
        impl SchemaSource for CompositeSource {
            fn table_names(&self) -> Vec<String> {
                vec!["membership".to_string()]
            }
            fn describe_columns(&self, _table: &str) -> Vec<ColumnDescriptor> {
                vec![
                    ColumnDescriptor {
                        is_primary_key: true,
                        ..ColumnDescriptor::new("account_id", SqlType::Integer)
                    },
                    ColumnDescriptor {
                        is_primary_key: true,
                        ..ColumnDescriptor::new("group_id", SqlType::Integer)
                    },
                ]
            }
            fn describe_foreign_keys(&self, _table: &str) -> Vec<ForeignKeyDescriptor> {
                Vec::new()
            }
        }

        let schema = reflect_schema(&CompositeSource);
        let table = schema.table("membership").unwrap();
        let pk = table.primary_key().unwrap();
        assert_eq!(pk.columns, vec!["account_id".to_string(), "group_id".to_string()]);
    }
}
