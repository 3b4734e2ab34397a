//! AST → SQL serialization (component E). Pure functions, no parsing.

use crate::ast::{
    ColumnConstraint, ColumnDef, CreateIndex, CreateTable, CreateTrigger, CreateView, Expr,
    ForeignKey, InsertInto, PrimaryKey, Token,
};

fn quote_string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::String(s) => quote_string_literal(s),
        Expr::Integer(i) => i.to_string(),
        Expr::Real(r) => {
            if r.fract() == 0.0 {
                format!("{r:.1}")
            } else {
                r.to_string()
            }
        }
        Expr::RawValue(v) => v.clone(),
    }
}

fn render_fk_action(action: crate::ast::FkAction) -> &'static str {
    action.spelling()
}

/// Renders the trailing `[ON DELETE ...] [ON UPDATE ...]` clause of a FK.
fn render_fk_tail(fk: &ForeignKey) -> String {
    let mut out = String::new();
    if let Some(a) = fk.on_delete {
        out.push_str(" ON DELETE ");
        out.push_str(render_fk_action(a));
    }
    if let Some(a) = fk.on_update {
        out.push_str(" ON UPDATE ");
        out.push_str(render_fk_action(a));
    }
    out
}

fn render_fk_references(fk: &ForeignKey) -> String {
    let refs = if fk.ref_columns.is_empty() {
        String::new()
    } else {
        format!("({})", fk.ref_columns.join(", "))
    };
    format!("REFERENCES {}{}{}", fk.ref_table, refs, render_fk_tail(fk))
}

fn render_primary_key_column_suffix(pk: &PrimaryKey) -> String {
    let mut out = "PRIMARY KEY".to_string();
    if pk.is_autoincrement {
        out.push_str(" AUTOINCREMENT");
    }
    out
}

fn render_column_constraint(c: &ColumnConstraint) -> String {
    match c {
        ColumnConstraint::NotNull => "NOT NULL".to_string(),
        ColumnConstraint::PrimaryKey(pk) => render_primary_key_column_suffix(pk),
        ColumnConstraint::Autoincrement => "AUTOINCREMENT".to_string(),
        ColumnConstraint::Unique(cols) if cols.is_empty() => "UNIQUE".to_string(),
        ColumnConstraint::Unique(cols) => format!("UNIQUE({})", cols.join(", ")),
        ColumnConstraint::Default(Expr::RawValue(v)) => format!("DEFAULT {v}"),
        ColumnConstraint::Default(expr) => format!("DEFAULT {}", render_expr(expr)),
        ColumnConstraint::Check(toks) => format!("CHECK ({})", render_token_stream(toks)),
        ColumnConstraint::ForeignKey(fk) if fk.columns.is_empty() => render_fk_references(fk),
        ColumnConstraint::ForeignKey(fk) => {
            format!("FOREIGN KEY({}) {}", fk.columns.join(", "), render_fk_references(fk))
        }
    }
}

/// Renders a single column definition: `<name> <type> <constraints...>`.
#[must_use]
pub fn render_column_def(col: &ColumnDef) -> String {
    let type_spelling = col.column_type.spelling();
    let mut parts = vec![col.name.clone()];
    if !type_spelling.is_empty() {
        parts.push(type_spelling.to_string());
    }
    for c in &col.constraints {
        parts.push(render_column_constraint(c));
    }
    parts.join(" ")
}

fn render_table_constraint(c: &ColumnConstraint) -> String {
    match c {
        ColumnConstraint::PrimaryKey(pk) => {
            let prefix = match &pk.constraint_name {
                Some(n) => format!("CONSTRAINT {n} "),
                None => String::new(),
            };
            format!("{prefix}PRIMARY KEY({})", pk.columns.join(", "))
        }
        ColumnConstraint::ForeignKey(fk) => {
            format!("FOREIGN KEY({}) {}", fk.columns.join(", "), render_fk_references(fk))
        }
        ColumnConstraint::Unique(cols) => format!("UNIQUE({})", cols.join(", ")),
        other => render_column_constraint(other),
    }
}

/// Renders `CREATE TABLE <name>(<cols>, <table constraints>);` with no
/// `IF NOT EXISTS` per the emitted-DDL dialect rules.
#[must_use]
pub fn render_create_table(table: &CreateTable) -> String {
    let mut items: Vec<String> = table.columns.iter().map(render_column_def).collect();
    items.extend(table.constraints.iter().map(render_table_constraint));
    format!("CREATE TABLE {}({})", table.name, items.join(", "))
}

/// Renders `CREATE TABLE <name>(<cols>)` using an explicit column list
/// (used for the `<table>_temp` recreate target, which may add/rename
/// columns relative to the live table's own AST).
#[must_use]
pub fn render_create_table_with_columns(name: &str, columns: &[ColumnDef], table_constraints: &[ColumnConstraint]) -> String {
    let mut items: Vec<String> = columns.iter().map(render_column_def).collect();
    items.extend(table_constraints.iter().map(render_table_constraint));
    format!("CREATE TABLE {}({})", name, items.join(", "))
}

#[must_use]
pub fn render_drop_table(name: &str) -> String {
    format!("DROP TABLE {name}")
}

#[must_use]
pub fn render_rename_table(old: &str, new: &str) -> String {
    format!("ALTER TABLE {old} RENAME TO {new}")
}

#[must_use]
pub fn render_drop_column(table: &str, column: &str) -> String {
    format!("ALTER TABLE {table} DROP COLUMN {column}")
}

/// Joins a token stream with the spacing rules from §4.E: no space before
/// `,`/`.`/`)`, no space after `(`/`.`, single space otherwise.
#[must_use]
pub fn render_token_stream(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut prev_no_trailing_space = false;
    for (i, tok) in tokens.iter().enumerate() {
        let text = tok.text.as_str();
        let needs_leading_space = i > 0 && !matches!(text, "," | "." | ")") && !prev_no_trailing_space;
        if needs_leading_space {
            out.push(' ');
        }
        out.push_str(text);
        prev_no_trailing_space = matches!(text, "(" | ".");
    }
    out
}

#[must_use]
pub fn render_create_view(view: &CreateView) -> String {
    format!("CREATE VIEW {} AS {}", view.name, render_token_stream(&view.sql_tokens))
}

#[must_use]
pub fn render_drop_view(name: &str) -> String {
    format!("DROP VIEW {name}")
}

#[must_use]
pub fn render_create_trigger(trigger: &CreateTrigger) -> String {
    format!("CREATE TRIGGER {}", render_token_stream(&trigger.sql_tokens))
}

#[must_use]
pub fn render_drop_trigger(name: &str) -> String {
    format!("DROP TRIGGER {name}")
}

#[must_use]
pub fn render_create_index(index: &CreateIndex) -> String {
    let kw = if index.unique { "CREATE UNIQUE INDEX" } else { "CREATE INDEX" };
    format!("{} {} ON {}({})", kw, index.name, index.table, index.columns.join(", "))
}

#[must_use]
pub fn render_drop_index(name: &str) -> String {
    format!("DROP INDEX {name}")
}

/// Renders `INSERT OR REPLACE INTO t(cols) VALUES (r1),(r2),...`.
#[must_use]
pub fn render_insert_into(insert: &InsertInto) -> String {
    let rows: Vec<String> = insert
        .values
        .iter()
        .map(|row| {
            let cells: Vec<String> = row.iter().map(render_expr).collect();
            format!("({})", cells.join(","))
        })
        .collect();
    format!(
        "INSERT OR REPLACE INTO {}({}) VALUES {}",
        insert.table,
        insert.columns.join(","),
        rows.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FkAction, SqlType};
    use crate::parser::parse;

    #[test]
    fn renders_simple_table() {
        let sql = "CREATE TABLE student(id integer NOT NULL, name text NOT NULL);";
        let file = parse("t.sql", sql).unwrap();
        let rendered = render_create_table(&file.tables[0]);
        assert_eq!(rendered, "CREATE TABLE student(id integer NOT NULL, name text NOT NULL)");
    }

    #[test]
    fn renders_fk_with_actions() {
        let fk = ForeignKey {
            columns: vec![],
            ref_table: "parent".to_string(),
            ref_columns: vec!["id".to_string()],
            on_delete: Some(FkAction::Cascade),
            on_update: None,
        };
        let rendered = render_fk_references(&fk);
        assert_eq!(rendered, "REFERENCES parent(id) ON DELETE CASCADE");
    }

    #[test]
    fn default_string_quotes_doubled() {
        let col = ColumnDef {
            name: "note".to_string(),
            column_type: SqlType::Text,
            constraints: vec![ColumnConstraint::Default(Expr::String("it's".to_string()))],
        };
        let rendered = render_column_def(&col);
        assert_eq!(rendered, "note text DEFAULT 'it''s'");
    }

    #[test]
    fn insert_or_replace_rendering() {
        let insert = InsertInto {
            table: "t".to_string(),
            columns: vec!["a".to_string(), "b".to_string()],
            values: vec![
                vec![Expr::Integer(1), Expr::String("x".to_string())],
                vec![Expr::Integer(2), Expr::String("y".to_string())],
            ],
        };
        let rendered = render_insert_into(&insert);
        assert_eq!(rendered, "INSERT OR REPLACE INTO t(a,b) VALUES (1,'x'),(2,'y')");
    }

    #[test]
    fn token_stream_spacing() {
        let toks = vec![
            Token::new("SELECT"),
            Token::new("a"),
            Token::new("."),
            Token::new("id"),
            Token::new(","),
            Token::new("b"),
            Token::new("FROM"),
            Token::new("t"),
            Token::new("("),
            Token::new("x"),
            Token::new(")"),
        ];
        let rendered = render_token_stream(&toks);
        assert_eq!(rendered, "SELECT a.id, b FROM t (x)");
    }
}
