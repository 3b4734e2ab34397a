//! Tokenizer and recursive-descent parser for the SQLite DDL/INSERT subset
//! (component B).

use crate::ast::{
    Anno, ColumnConstraint, ColumnDef, CreateIndex, CreateTable, CreateTrigger, CreateView, Expr,
    FkAction, ForeignKey, InsertInto, PrimaryKey, SqlFile, SqlType, Token,
};
use crate::error::{MigrationError, SourcePos};

/// Reserved keywords that cannot be used as a bare (unquoted) identifier.
const RESERVED: &[&str] = &[
    "create", "table", "view", "index", "trigger", "insert", "into", "values", "select", "from",
    "where", "join", "on", "primary", "key", "foreign", "references", "not", "null", "unique",
    "default", "check", "constraint", "autoincrement", "temp", "temporary", "if", "exists",
    "drop", "alter", "rename", "to", "column", "and", "or", "as", "with", "cascade", "restrict",
    "set", "action", "update", "delete", "or", "replace", "ignore",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|k| k.eq_ignore_ascii_case(word))
}

#[derive(Debug, Clone, PartialEq)]
enum TokKind {
    Ident(String),
    QuotedIdent(String),
    StringLit(String),
    IntLit(i64),
    RealLit(f64),
    Punct(char),
    Eof,
}

#[derive(Debug, Clone)]
struct Tok {
    kind: TokKind,
    pos: SourcePos,
    /// Exact source spelling, used for byte-preserving view/trigger capture.
    raw: String,
    /// Byte offsets of this token in the source, `[start, end)`.
    start_byte: usize,
    end_byte: usize,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    idx: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            idx: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.idx).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.idx += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn pos(&self) -> SourcePos {
        SourcePos {
            line: self.line,
            column: self.col,
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'-') if self.bytes.get(self.idx + 1) == Some(&b'-') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self, file: &str) -> Result<Tok, MigrationError> {
        self.skip_trivia();
        let pos = self.pos();
        let start = self.idx;
        let Some(b) = self.peek_byte() else {
            return Ok(Tok {
                kind: TokKind::Eof,
                pos,
                raw: String::new(),
                start_byte: start,
                end_byte: start,
            });
        };

        if b == b'\'' {
            return self.lex_string(file, pos, b'\'');
        }
        if b == b'"' || b == b'`' {
            let quote = b;
            self.advance();
            let ident_start = self.idx;
            while let Some(c) = self.peek_byte() {
                if c == quote {
                    break;
                }
                self.advance();
            }
            let text = self.src[ident_start..self.idx].to_string();
            self.advance();
            let raw = self.src[start..self.idx].to_string();
            return Ok(Tok {
                kind: TokKind::QuotedIdent(text),
                pos,
                raw,
                start_byte: start,
                end_byte: self.idx,
            });
        }
        if b == b'[' {
            self.advance();
            let ident_start = self.idx;
            while let Some(c) = self.peek_byte() {
                if c == b']' {
                    break;
                }
                self.advance();
            }
            let text = self.src[ident_start..self.idx].to_string();
            self.advance();
            let raw = self.src[start..self.idx].to_string();
            return Ok(Tok {
                kind: TokKind::QuotedIdent(text),
                pos,
                raw,
                start_byte: start,
                end_byte: self.idx,
            });
        }
        if b.is_ascii_digit() || (b == b'-' && self.bytes.get(self.idx + 1).is_some_and(u8::is_ascii_digit)) {
            return Ok(self.lex_number(pos, start));
        }
        if b == b'_' || b.is_ascii_alphabetic() {
            while let Some(c) = self.peek_byte() {
                if c == b'_' || c.is_ascii_alphanumeric() {
                    self.advance();
                } else {
                    break;
                }
            }
            let text = self.src[start..self.idx].to_string();
            return Ok(Tok {
                kind: TokKind::Ident(text.clone()),
                pos,
                raw: text,
                start_byte: start,
                end_byte: self.idx,
            });
        }
        self.advance();
        let raw = self.src[start..self.idx].to_string();
        Ok(Tok {
            kind: TokKind::Punct(b as char),
            pos,
            raw,
            start_byte: start,
            end_byte: self.idx,
        })
    }

    fn lex_string(&mut self, file: &str, pos: SourcePos, quote: u8) -> Result<Tok, MigrationError> {
        let start = self.idx;
        self.advance();
        let mut out = String::new();
        loop {
            match self.peek_byte() {
                None => {
                    return Err(MigrationError::parse(
                        file,
                        pos,
                        "unterminated string literal",
                    ));
                }
                Some(c) if c == quote => {
                    self.advance();
                    if self.peek_byte() == Some(quote) {
                        out.push(quote as char);
                        self.advance();
                        continue;
                    }
                    break;
                }
                Some(_) => {
                    let ch_start = self.idx;
                    self.advance();
                    out.push_str(&self.src[ch_start..self.idx]);
                }
            }
        }
        let raw = self.src[start..self.idx].to_string();
        Ok(Tok {
            kind: TokKind::StringLit(out),
            pos,
            raw,
            start_byte: start,
            end_byte: self.idx,
        })
    }

    fn lex_number(&mut self, pos: SourcePos, start: usize) -> Tok {
        if self.peek_byte() == Some(b'-') {
            self.advance();
        }
        let mut is_real = false;
        while let Some(c) = self.peek_byte() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == b'.' && !is_real {
                is_real = true;
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.src[start..self.idx];
        let raw = text.to_string();
        if is_real {
            Tok {
                kind: TokKind::RealLit(text.parse().unwrap_or(0.0)),
                pos,
                raw,
                start_byte: start,
                end_byte: self.idx,
            }
        } else {
            Tok {
                kind: TokKind::IntLit(text.parse().unwrap_or(0)),
                pos,
                raw,
                start_byte: start,
                end_byte: self.idx,
            }
        }
    }
}

struct Parser {
    file: String,
    toks: Vec<Tok>,
    idx: usize,
}

impl Parser {
    fn new(file: &str, toks: Vec<Tok>) -> Self {
        Self {
            file: file.to_string(),
            toks,
            idx: 0,
        }
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.idx]
    }

    fn bump(&mut self) -> Tok {
        let t = self.toks[self.idx].clone();
        if self.idx + 1 < self.toks.len() {
            self.idx += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> MigrationError {
        MigrationError::parse(self.file.clone(), self.peek().pos, msg.into())
    }

    fn err_at(&self, pos: SourcePos, msg: impl Into<String>) -> MigrationError {
        MigrationError::parse(self.file.clone(), pos, msg.into())
    }

    fn is_ident_word(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokKind::Ident(s) if s.eq_ignore_ascii_case(word))
    }

    fn eat_ident_word(&mut self, word: &str) -> bool {
        if self.is_ident_word(word) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_ident_word(&mut self, word: &str) -> Result<(), MigrationError> {
        if self.eat_ident_word(word) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{word}'")))
        }
    }

    fn is_punct(&self, c: char) -> bool {
        matches!(self.peek().kind, TokKind::Punct(p) if p == c)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.is_punct(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), MigrationError> {
        if self.eat_punct(c) {
            Ok(())
        } else if c == ')' && self.is_punct(',') {
            Err(self
                .err("unexpected ')'")
                .with_hint(format!("trailing comma before ')' near line {}", self.peek().pos.line)))
        } else {
            Err(self.err(format!("expected '{c}'")))
        }
    }

    /// Parses an identifier, rejecting unquoted reserved keywords.
    fn parse_ident(&mut self) -> Result<String, MigrationError> {
        let tok = self.bump();
        match tok.kind {
            TokKind::Ident(s) => {
                if is_reserved(&s) {
                    Err(self.err_at(tok.pos, format!("'{s}' is a reserved keyword; quote it to use as an identifier")))
                } else {
                    Ok(s)
                }
            }
            TokKind::QuotedIdent(s) => Ok(s),
            _ => Err(self.err_at(tok.pos, "expected identifier")),
        }
    }

    fn parse_ident_list(&mut self) -> Result<Vec<String>, MigrationError> {
        self.expect_punct('(')?;
        let mut out = Vec::new();
        loop {
            out.push(self.parse_ident()?);
            if self.eat_punct(',') {
                continue;
            }
            break;
        }
        self.expect_punct(')')?;
        Ok(out)
    }

    fn parse_fk_action(&mut self) -> Result<Option<FkAction>, MigrationError> {
        if self.eat_ident_word("cascade") {
            return Ok(Some(FkAction::Cascade));
        }
        if self.eat_ident_word("restrict") {
            return Ok(Some(FkAction::Restrict));
        }
        if self.eat_ident_word("no") {
            self.expect_ident_word("action")?;
            return Ok(Some(FkAction::NoAction));
        }
        if self.eat_ident_word("set") {
            if self.eat_ident_word("null") {
                return Ok(Some(FkAction::SetNull));
            }
            self.expect_ident_word("default")?;
            return Ok(Some(FkAction::SetDefault));
        }
        Err(self.err("expected a foreign key action"))
    }

    fn parse_fk_tail(&mut self, columns: Vec<String>) -> Result<ForeignKey, MigrationError> {
        self.expect_ident_word("references")?;
        let ref_table = self.parse_ident()?;
        let ref_columns = if self.is_punct('(') {
            self.parse_ident_list()?
        } else {
            Vec::new()
        };
        let mut on_delete = None;
        let mut on_update = None;
        loop {
            if self.eat_ident_word("on") {
                if self.eat_ident_word("delete") {
                    on_delete = self.parse_fk_action()?;
                } else if self.eat_ident_word("update") {
                    on_update = self.parse_fk_action()?;
                } else {
                    return Err(self.err("expected 'delete' or 'update' after 'on'"));
                }
            } else {
                break;
            }
        }
        Ok(ForeignKey {
            columns,
            ref_table,
            ref_columns,
            on_delete,
            on_update,
        })
    }

    /// `DEFAULT <expr>`: string / int / real literal, or a parenthesized
    /// expression captured as `RawValue` with balanced-paren scanning that
    /// treats single-quoted segments as opaque.
    fn parse_default_expr(&mut self) -> Result<Expr, MigrationError> {
        match &self.peek().kind {
            TokKind::StringLit(s) => {
                let s = s.clone();
                self.bump();
                Ok(Expr::String(s))
            }
            TokKind::IntLit(i) => {
                let i = *i;
                self.bump();
                Ok(Expr::Integer(i))
            }
            TokKind::RealLit(r) => {
                let r = *r;
                self.bump();
                Ok(Expr::Real(r))
            }
            _ => {
                let start = self.peek().pos;
                let raw = self.capture_balanced_raw_value(start)?;
                Ok(Expr::RawValue(raw))
            }
        }
    }

    /// Captures a raw default expression up to (but not including) the next
    /// top-level `,` or `)`, or (if it begins with `(`) through the matching
    /// close paren. Single-quoted segments are treated as opaque.
    fn capture_balanced_raw_value(&mut self, start_pos: SourcePos) -> Result<String, MigrationError> {
        let mut depth: i32 = 0;
        let mut out = String::new();
        loop {
            let tok = self.peek().clone();
            match &tok.kind {
                TokKind::Eof => {
                    return Err(self.err_at(start_pos, "unterminated default expression"));
                }
                TokKind::Punct('(') => {
                    depth += 1;
                    out.push_str(&tok.raw);
                    self.bump();
                }
                TokKind::Punct(')') => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    out.push_str(&tok.raw);
                    self.bump();
                }
                TokKind::Punct(',') if depth == 0 => break,
                TokKind::StringLit(s) => {
                    out.push('\'');
                    out.push_str(&s.replace('\'', "''"));
                    out.push('\'');
                    self.bump();
                }
                _ => {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&tok.raw);
                    self.bump();
                }
            }
        }
        Ok(out)
    }

    fn parse_column_constraint(&mut self) -> Result<Option<ColumnConstraint>, MigrationError> {
        if self.eat_ident_word("not") {
            self.expect_ident_word("null")?;
            return Ok(Some(ColumnConstraint::NotNull));
        }
        if self.eat_ident_word("primary") {
            self.expect_ident_word("key")?;
            let is_autoincrement = self.eat_ident_word("autoincrement");
            return Ok(Some(ColumnConstraint::PrimaryKey(PrimaryKey {
                constraint_name: None,
                columns: Vec::new(),
                is_autoincrement,
            })));
        }
        if self.eat_ident_word("autoincrement") {
            return Ok(Some(ColumnConstraint::Autoincrement));
        }
        if self.eat_ident_word("unique") {
            return Ok(Some(ColumnConstraint::Unique(Vec::new())));
        }
        if self.eat_ident_word("default") {
            let expr = self.parse_default_expr()?;
            return Ok(Some(ColumnConstraint::Default(expr)));
        }
        if self.eat_ident_word("check") {
            self.expect_punct('(')?;
            let mut toks = Vec::new();
            let mut depth = 1;
            loop {
                let tok = self.peek().clone();
                match tok.kind {
                    TokKind::Eof => return Err(self.err("unterminated CHECK clause")),
                    TokKind::Punct('(') => {
                        depth += 1;
                        toks.push(Token::new(tok.raw.clone()));
                        self.bump();
                    }
                    TokKind::Punct(')') => {
                        depth -= 1;
                        self.bump();
                        if depth == 0 {
                            break;
                        }
                        toks.push(Token::new(tok.raw.clone()));
                    }
                    _ => {
                        toks.push(Token::new(tok.raw.clone()));
                        self.bump();
                    }
                }
            }
            return Ok(Some(ColumnConstraint::Check(toks)));
        }
        if self.eat_ident_word("references") {
            self.idx -= 1; // rewind past 'references' so parse_fk_tail sees it
            let fk = self.parse_fk_tail(Vec::new())?;
            return Ok(Some(ColumnConstraint::ForeignKey(fk)));
        }
        Ok(None)
    }

    fn parse_column_type(&mut self) -> Result<SqlType, MigrationError> {
        match &self.peek().kind {
            TokKind::Ident(s) if !is_reserved(s) => {
                let kw = s.clone();
                self.bump();
                Ok(SqlType::from_keyword(&kw))
            }
            _ => Ok(SqlType::Flexible),
        }
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef, MigrationError> {
        let name = self.parse_ident()?;
        let column_type = self.parse_column_type()?;
        let mut constraints = Vec::new();
        while let Some(c) = self.parse_column_constraint()? {
            constraints.push(c);
        }
        Ok(ColumnDef {
            name,
            column_type,
            constraints,
        })
    }

    fn parse_table_constraint(&mut self) -> Result<Option<ColumnConstraint>, MigrationError> {
        if self.eat_ident_word("constraint") {
            let name = self.parse_ident()?;
            if self.eat_ident_word("primary") {
                self.expect_ident_word("key")?;
                let columns = self.parse_ident_list()?;
                return Ok(Some(ColumnConstraint::PrimaryKey(PrimaryKey {
                    constraint_name: Some(name),
                    columns,
                    is_autoincrement: false,
                })));
            }
            return Err(self.err("unsupported named table constraint"));
        }
        if self.eat_ident_word("primary") {
            self.expect_ident_word("key")?;
            let columns = self.parse_ident_list()?;
            return Ok(Some(ColumnConstraint::PrimaryKey(PrimaryKey {
                constraint_name: None,
                columns,
                is_autoincrement: false,
            })));
        }
        if self.eat_ident_word("foreign") {
            self.expect_ident_word("key")?;
            let columns = self.parse_ident_list()?;
            let fk = self.parse_fk_tail(columns)?;
            return Ok(Some(ColumnConstraint::ForeignKey(fk)));
        }
        if self.eat_ident_word("unique") {
            let columns = self.parse_ident_list()?;
            return Ok(Some(ColumnConstraint::Unique(columns)));
        }
        Ok(None)
    }

    fn looks_like_table_constraint(&self) -> bool {
        self.is_ident_word("primary")
            || self.is_ident_word("foreign")
            || self.is_ident_word("unique")
            || self.is_ident_word("constraint")
    }

    fn eat_if_not_exists(&mut self) {
        if self.eat_ident_word("if") {
            self.eat_ident_word("not");
            self.eat_ident_word("exists");
        }
    }

    fn parse_create_table(&mut self) -> Result<CreateTable, MigrationError> {
        self.eat_if_not_exists();
        let name = self.parse_ident()?;
        self.expect_punct('(')?;
        let mut table = CreateTable::new(name);
        loop {
            if self.looks_like_table_constraint() {
                if let Some(c) = self.parse_table_constraint()? {
                    table.constraints.push(c);
                }
            } else {
                let col = self.parse_column_def()?;
                table.columns.push(col);
            }
            if self.eat_punct(',') {
                if self.is_punct(')') {
                    let line = self.peek().pos.line;
                    return Err(self
                        .err("unexpected ')' after ','")
                        .with_hint(format!("trailing comma before ')' near line {line}")));
                }
                continue;
            }
            break;
        }
        self.expect_punct(')')?;
        self.eat_punct(';');
        Ok(table)
    }

    /// Captures raw tokens from the current position through the
    /// terminating `;` (not included), with simple spacing-insensitive
    /// join semantics for downstream reserialization.
    fn capture_tokens_until_semicolon(&mut self) -> Vec<Token> {
        let mut toks = Vec::new();
        loop {
            match &self.peek().kind {
                TokKind::Eof => break,
                TokKind::Punct(';') => break,
                _ => {
                    toks.push(Token::new(self.peek().raw.clone()));
                    self.bump();
                }
            }
        }
        toks
    }

    fn extract_view_dependencies(tokens: &[Token]) -> Vec<String> {
        let mut bound: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut deps = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let word = tokens[i].text.to_ascii_lowercase();
            if word == "with" {
                let mut j = i + 1;
                while j < tokens.len() {
                    let w = tokens[j].text.to_ascii_lowercase();
                    if w == "as" {
                        if j > i + 1 {
                            bound.insert(tokens[j - 1].text.to_ascii_lowercase());
                        }
                    }
                    if w == "select" {
                        break;
                    }
                    j += 1;
                }
            }
            if (word == "from" || word == "join") && i + 1 < tokens.len() {
                let ident = tokens[i + 1].text.clone();
                if ident.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_') {
                    deps.push(ident);
                }
            }
            i += 1;
        }
        let mut out = Vec::new();
        for d in deps {
            if !bound.contains(&d.to_ascii_lowercase()) && !out.iter().any(|e: &String| e.eq_ignore_ascii_case(&d)) {
                out.push(d);
            }
        }
        out
    }

    fn parse_create_view(&mut self) -> Result<CreateView, MigrationError> {
        self.eat_if_not_exists();
        let name = self.parse_ident()?;
        self.expect_ident_word("as")?;
        let tokens = self.capture_tokens_until_semicolon();
        self.eat_punct(';');
        let dependencies = Self::extract_view_dependencies(&tokens);
        let mut view = CreateView::new(name);
        view.sql_tokens = tokens;
        view.dependencies = dependencies;
        Ok(view)
    }

    fn parse_create_trigger(&mut self, name: String) -> Result<CreateTrigger, MigrationError> {
        let tokens = self.capture_tokens_until_semicolon();
        self.eat_punct(';');
        let dependencies = Self::extract_view_dependencies(&tokens);
        Ok(CreateTrigger {
            name,
            sql_tokens: tokens,
            dependencies,
        })
    }

    fn parse_create_index(&mut self, unique: bool) -> Result<CreateIndex, MigrationError> {
        self.eat_if_not_exists();
        let name = self.parse_ident()?;
        self.expect_ident_word("on")?;
        let table = self.parse_ident()?;
        let columns = self.parse_ident_list()?;
        self.eat_punct(';');
        Ok(CreateIndex {
            name,
            table,
            columns,
            unique,
        })
    }

    fn parse_insert_into(&mut self) -> Result<InsertInto, MigrationError> {
        self.expect_ident_word("into")?;
        let table = self.parse_ident()?;
        let columns = self.parse_ident_list()?;
        self.expect_ident_word("values")?;
        let mut values = Vec::new();
        loop {
            self.expect_punct('(')?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_value_expr()?);
                if self.eat_punct(',') {
                    continue;
                }
                break;
            }
            self.expect_punct(')')?;
            values.push(row);
            if self.eat_punct(',') {
                continue;
            }
            break;
        }
        self.eat_punct(';');
        Ok(InsertInto {
            table,
            columns,
            values,
        })
    }

    fn parse_value_expr(&mut self) -> Result<Expr, MigrationError> {
        match &self.peek().kind {
            TokKind::StringLit(s) => {
                let s = s.clone();
                self.bump();
                Ok(Expr::String(s))
            }
            TokKind::IntLit(i) => {
                let i = *i;
                self.bump();
                Ok(Expr::Integer(i))
            }
            TokKind::RealLit(r) => {
                let r = *r;
                self.bump();
                Ok(Expr::Real(r))
            }
            TokKind::Ident(s) => {
                let s = s.clone();
                self.bump();
                Ok(Expr::RawValue(s))
            }
            _ => Err(self.err("expected a value expression")),
        }
    }

    fn parse_statement(&mut self, file: &mut SqlFile) -> Result<Option<String>, MigrationError> {
        if matches!(self.peek().kind, TokKind::Eof) {
            return Ok(None);
        }
        if self.eat_ident_word("create") {
            self.eat_ident_word("temp");
            self.eat_ident_word("temporary");
            if self.eat_ident_word("table") {
                let t = self.parse_create_table()?;
                let name = t.name.clone();
                file.tables.push(t);
                return Ok(Some(name));
            }
            if self.eat_ident_word("view") {
                let v = self.parse_create_view()?;
                let name = v.name.clone();
                file.views.push(v);
                return Ok(Some(name));
            }
            let unique = self.eat_ident_word("unique");
            if self.eat_ident_word("index") {
                let idx = self.parse_create_index(unique)?;
                file.indexes.push(idx);
                return Ok(None);
            }
            if self.eat_ident_word("trigger") {
                self.eat_if_not_exists();
                let name = self.parse_ident()?;
                let trg = self.parse_create_trigger(name)?;
                file.triggers.push(trg);
                return Ok(None);
            }
            return Err(self.err("expected TABLE, VIEW, INDEX or TRIGGER after CREATE"));
        }
        if self.eat_ident_word("insert") {
            let ins = self.parse_insert_into()?;
            file.inserts.push(ins);
            return Ok(None);
        }
        Err(self.err("expected a CREATE or INSERT statement"))
    }

    /// Scans `-- QueryBy(...)`/`-- QueryLike(...)`/`-- QueryByOrInsert(...)`/
    /// `-- InsertOrIgnore[()]` comment lines following a statement, using the
    /// raw source text (not tokens) since comments are stripped by the lexer.
    fn scan_annotations(src: &str, from_byte: usize, to_byte: usize) -> Vec<(String, Vec<String>)> {
        let region = &src[from_byte.min(src.len())..to_byte.min(src.len())];
        let mut out = Vec::new();
        for line in region.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix("--") else {
                continue;
            };
            let rest = rest.trim();
            for (kw, canon) in [
                ("QueryByOrInsert", "QueryByOrInsert"),
                ("QueryByOrCreate", "QueryByOrInsert"),
                ("QueryBy", "QueryBy"),
                ("QueryLike", "QueryLike"),
                ("InsertOrIgnore", "InsertOrIgnore"),
            ] {
                if let Some(args) = rest.strip_prefix(kw) {
                    let args = args.trim();
                    let cols = if let Some(inner) = args.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
                        inner
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    } else {
                        Vec::new()
                    };
                    out.push((canon.to_string(), cols));
                    break;
                }
            }
        }
        out
    }
}

/// Parses `sql_source` (attributed to `file` for error messages) into a
/// canonical [`SqlFile`].
pub fn parse(file: &str, sql_source: &str) -> Result<SqlFile, MigrationError> {
    let mut lexer = Lexer::new(sql_source);
    let mut toks = Vec::new();
    loop {
        let t = lexer.next_token(file)?;
        let is_eof = matches!(t.kind, TokKind::Eof);
        toks.push(t);
        if is_eof {
            break;
        }
    }

    let mut parser = Parser::new(file, toks);
    let mut out = SqlFile::default();
    let mut last_entity: Option<String> = None;

    loop {
        if matches!(parser.peek().kind, TokKind::Eof) {
            break;
        }
        let produced = parser.parse_statement(&mut out)?;
        if produced.is_some() {
            last_entity = produced;
        }
        // Comments between statements are trivia stripped from the token
        // stream; the raw source span between the end of the statement just
        // parsed and the start of the next token is exactly the annotation
        // region (possibly empty), and attaches to the most recent table/view.
        let scan_start = parser.last_consumed_end_byte();
        let scan_end = parser.peek().start_byte;
        let annos = Parser::scan_annotations(sql_source, scan_start, scan_end);
        if let Some(name) = &last_entity {
            apply_annotations(&mut out, name, annos)?;
        }
    }
    Ok(out)
}

fn apply_annotations(
    file: &mut SqlFile,
    entity_name: &str,
    annos: Vec<(String, Vec<String>)>,
) -> Result<(), MigrationError> {
    if annos.is_empty() {
        return Ok(());
    }
    let available: Vec<String> = if let Some(t) = file.table(entity_name) {
        t.columns.iter().map(|c| c.name.clone()).collect()
    } else if let Some(_v) = file.view(entity_name) {
        Vec::new()
    } else {
        Vec::new()
    };

    let check_cols = |cols: &[String]| -> Result<(), MigrationError> {
        if available.is_empty() {
            return Ok(());
        }
        for c in cols {
            if !available.iter().any(|a| a.eq_ignore_ascii_case(c)) {
                return Err(MigrationError::MalformedProject(format!(
                    "Non-existent column '{c}'. Available columns: {}",
                    available.join(", ")
                )));
            }
        }
        Ok(())
    };

    for (kind, cols) in annos {
        match kind.as_str() {
            "QueryLike" => {
                if cols.len() != 1 {
                    return Err(MigrationError::MalformedProject(
                        "QueryLike must name exactly one column".to_string(),
                    ));
                }
                check_cols(&cols)?;
                push_anno(file, entity_name, AnnoKind::QueryLike, cols);
            }
            "QueryBy" => {
                check_cols(&cols)?;
                push_anno(file, entity_name, AnnoKind::QueryBy, cols);
            }
            "QueryByOrInsert" => {
                check_cols(&cols)?;
                push_anno(file, entity_name, AnnoKind::QueryByOrInsert, cols);
            }
            "InsertOrIgnore" => {
                push_anno(file, entity_name, AnnoKind::InsertOrIgnore, cols);
            }
            _ => {}
        }
    }
    Ok(())
}

enum AnnoKind {
    QueryBy,
    QueryLike,
    QueryByOrInsert,
    InsertOrIgnore,
}

fn push_anno(file: &mut SqlFile, entity_name: &str, kind: AnnoKind, cols: Vec<String>) {
    let anno = Anno { columns: cols };
    if let Some(t) = file.tables.iter_mut().find(|t| t.name.eq_ignore_ascii_case(entity_name)) {
        match kind {
            AnnoKind::QueryBy => t.query_by.push(anno),
            AnnoKind::QueryLike => t.query_like.push(anno),
            AnnoKind::QueryByOrInsert => t.query_by_or_insert.push(anno),
            AnnoKind::InsertOrIgnore => t.insert_or_ignore.push(anno),
        }
        return;
    }
    if let Some(v) = file.views.iter_mut().find(|v| v.name.eq_ignore_ascii_case(entity_name)) {
        match kind {
            AnnoKind::QueryBy => v.query_by.push(anno),
            AnnoKind::QueryLike => v.query_like.push(anno),
            AnnoKind::QueryByOrInsert => v.query_by_or_insert.push(anno),
            AnnoKind::InsertOrIgnore => v.insert_or_ignore.push(anno),
        }
    }
}

impl Parser {
    /// End byte of the most recently consumed token, or 0 before the first
    /// token is consumed.
    fn last_consumed_end_byte(&self) -> usize {
        if self.idx == 0 {
            0
        } else {
            self.toks[self.idx - 1].end_byte
        }
    }
}
