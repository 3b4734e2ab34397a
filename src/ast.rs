//! Canonical schema AST (component A).
//!
//! Values are immutable after parse; the planner and differ only ever read
//! from a [`SqlFile`], never mutate one in place.

use std::collections::BTreeSet;

/// A single lexical token, preserved verbatim for view/trigger bodies and
/// `CHECK` clauses so regeneration can be byte-stable modulo whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
}

impl Token {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A literal or caller-controlled raw expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    String(String),
    Integer(i64),
    Real(f64),
    /// Unquoted tokens preserved verbatim (e.g. `strftime('now')`).
    RawValue(String),
}

impl Eq for Expr {}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Self::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Self::Real(r) => {
                2u8.hash(state);
                r.to_bits().hash(state);
            }
            Self::RawValue(s) => {
                3u8.hash(state);
                s.hash(state);
            }
        }
    }
}

/// SQLite type affinity as declared in source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Integer,
    Text,
    Real,
    Timestamp,
    String,
    /// Type affinity unknown (no type name given).
    Flexible,
}

impl SqlType {
    /// The type-default `Expr` used when a new column is added without an
    /// explicit `DEFAULT` (§3: "Default value per type").
    #[must_use]
    pub fn type_default(self) -> Expr {
        match self {
            Self::Integer => Expr::Integer(0),
            Self::Real => Expr::Real(0.0),
            Self::Text | Self::Timestamp | Self::String | Self::Flexible => {
                Expr::String(String::new())
            }
        }
    }

    #[must_use]
    pub fn spelling(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Text => "text",
            Self::Real => "real",
            Self::Timestamp => "timestamp",
            Self::String => "string",
            Self::Flexible => "",
        }
    }

    #[must_use]
    pub fn from_keyword(kw: &str) -> Self {
        match kw.to_ascii_lowercase().as_str() {
            "integer" => Self::Integer,
            "text" => Self::Text,
            "real" => Self::Real,
            "timestamp" => Self::Timestamp,
            "string" => Self::String,
            _ => Self::Flexible,
        }
    }
}

/// `ON DELETE`/`ON UPDATE` behavior for a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FkAction {
    Cascade,
    Restrict,
    NoAction,
    SetNull,
    SetDefault,
}

impl FkAction {
    #[must_use]
    pub fn spelling(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
            Self::NoAction => "NO ACTION",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }

    #[must_use]
    pub fn from_keywords(kw: &str) -> Option<Self> {
        match kw.to_ascii_uppercase().as_str() {
            "CASCADE" => Some(Self::Cascade),
            "RESTRICT" => Some(Self::Restrict),
            "NO ACTION" => Some(Self::NoAction),
            "SET NULL" => Some(Self::SetNull),
            "SET DEFAULT" => Some(Self::SetDefault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    pub on_delete: Option<FkAction>,
    pub on_update: Option<FkAction>,
}

/// A primary-key constraint. `columns == []` on a column constraint means
/// the PK is on that column itself (the column-level shorthand).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PrimaryKey {
    pub constraint_name: Option<String>,
    pub columns: Vec<String>,
    pub is_autoincrement: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    NotNull,
    PrimaryKey(PrimaryKey),
    Autoincrement,
    Unique(Vec<String>),
    Default(Expr),
    Check(Vec<Token>),
    ForeignKey(ForeignKey),
}

impl ColumnConstraint {
    #[must_use]
    pub fn is_not_null(&self) -> bool {
        matches!(self, Self::NotNull)
    }

    #[must_use]
    pub fn as_primary_key(&self) -> Option<&PrimaryKey> {
        match self {
            Self::PrimaryKey(pk) => Some(pk),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_foreign_key(&self) -> Option<&ForeignKey> {
        match self {
            Self::ForeignKey(fk) => Some(fk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: SqlType,
    pub constraints: Vec<ColumnConstraint>,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: SqlType) -> Self {
        Self {
            name: name.into(),
            column_type,
            constraints: Vec::new(),
        }
    }

    /// SQLite quirk: `INTEGER PRIMARY KEY` is implicitly non-null even
    /// without an explicit `NOT NULL`.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        let has_not_null = self.constraints.iter().any(ColumnConstraint::is_not_null);
        let has_integer_pk = self.column_type == SqlType::Integer
            && self
                .constraints
                .iter()
                .any(|c| c.as_primary_key().is_some());
        !has_not_null && !has_integer_pk
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        self.constraints.iter().find_map(ColumnConstraint::as_primary_key)
    }

    #[must_use]
    pub fn foreign_key(&self) -> Option<&ForeignKey> {
        self.constraints.iter().find_map(ColumnConstraint::as_foreign_key)
    }

    #[must_use]
    pub fn default_expr(&self) -> Option<&Expr> {
        self.constraints.iter().find_map(|c| match c {
            ColumnConstraint::Default(e) => Some(e),
            _ => None,
        })
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| matches!(c, ColumnConstraint::Unique(_)))
            || self.primary_key().is_some()
    }
}

/// A comment annotation attached to a `CREATE TABLE`/`CREATE VIEW`, e.g.
/// `-- QueryBy(col1, col2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anno {
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Table-level constraints (table-level PK, table-level FK, table-level UNIQUE).
    pub constraints: Vec<ColumnConstraint>,
    pub query_by: Vec<Anno>,
    pub query_like: Vec<Anno>,
    pub query_by_or_insert: Vec<Anno>,
    pub insert_or_ignore: Vec<Anno>,
}

impl CreateTable {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The table's effective primary key, whether declared column- or
    /// table-level. Returns `None` if there is no PK at all.
    #[must_use]
    pub fn primary_key(&self) -> Option<PrimaryKey> {
        for c in &self.columns {
            if let Some(pk) = c.primary_key() {
                let mut pk = pk.clone();
                if pk.columns.is_empty() {
                    pk.columns = vec![c.name.clone()];
                }
                return Some(pk);
            }
        }
        self.constraints.iter().find_map(|c| match c {
            ColumnConstraint::PrimaryKey(pk) => Some(pk.clone()),
            _ => None,
        })
    }

    /// All foreign keys on this table, column-level and table-level.
    #[must_use]
    pub fn foreign_keys(&self) -> Vec<ForeignKey> {
        let mut out: Vec<ForeignKey> = Vec::new();
        for c in &self.columns {
            if let Some(fk) = c.foreign_key() {
                let mut fk = fk.clone();
                if fk.columns.is_empty() {
                    fk.columns = vec![c.name.clone()];
                }
                out.push(fk);
            }
        }
        for tc in &self.constraints {
            if let ColumnConstraint::ForeignKey(fk) = tc {
                out.push(fk.clone());
            }
        }
        out
    }

    /// Structural signature used for exact-rename detection (§4.D):
    /// columns and table-level constraints, ignoring the table's own name.
    #[must_use]
    pub fn signature(&self) -> TableSignature {
        TableSignature {
            columns: self
                .columns
                .iter()
                .map(|c| ColumnSignature {
                    name: c.name.to_ascii_lowercase(),
                    column_type: c.column_type,
                    constraints: format!("{:?}", c.constraints),
                })
                .collect(),
            table_constraints: format!("{:?}", self.constraints),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnSignature {
    pub name: String,
    pub column_type: SqlType,
    pub constraints: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSignature {
    pub columns: Vec<ColumnSignature>,
    pub table_constraints: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateView {
    pub name: String,
    pub sql_tokens: Vec<Token>,
    pub dependencies: Vec<String>,
    pub query_by: Vec<Anno>,
    pub query_like: Vec<Anno>,
    pub query_by_or_insert: Vec<Anno>,
    pub insert_or_ignore: Vec<Anno>,
}

impl CreateView {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_tokens: Vec::new(),
            dependencies: Vec::new(),
            query_by: Vec::new(),
            query_like: Vec::new(),
            query_by_or_insert: Vec::new(),
            insert_or_ignore: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndex {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTrigger {
    pub name: String,
    pub sql_tokens: Vec<Token>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertInto {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Expr>>,
}

/// The root AST produced by the parser (component B) or by schema
/// reflection (component M).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFile {
    pub tables: Vec<CreateTable>,
    pub views: Vec<CreateView>,
    pub indexes: Vec<CreateIndex>,
    pub triggers: Vec<CreateTrigger>,
    pub inserts: Vec<InsertInto>,
}

impl SqlFile {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&CreateTable> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn view(&self, name: &str) -> Option<&CreateView> {
        self.views.iter().find(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// All relation names (tables ∪ views ∪ indexes), used as dependency
    /// graph node ids.
    #[must_use]
    pub fn relation_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for t in &self.tables {
            names.insert(t.name.clone());
        }
        for v in &self.views {
            names.insert(v.name.clone());
        }
        for i in &self.indexes {
            names.insert(i.name.clone());
        }
        names
    }
}
