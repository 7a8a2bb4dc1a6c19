//! Statement splitting and read/write classification.
//!
//! Drivers prefer their own metadata (described columns, result-set
//! metadata) to decide whether a statement returns rows. This module is the
//! single place that decides when no such metadata exists.

use sqlparser::{
    ast::{Query, Select, SetExpr, Statement},
    dialect::{Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect},
    parser::Parser,
    tokenizer::{Location, Token, Tokenizer},
};

use std::ops::Range;

use crate::engine::registry::EngineKind;

/// One statement of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementSpan {
    /// Statement text without the terminating semicolon
    pub text: String,
    /// 1-based line of the batch the statement starts on
    pub line: u64,
    /// 1-based line of the batch the statement ends on
    pub end_line: u64,
}

fn dialect_for(kind: EngineKind) -> Box<dyn Dialect> {
    match kind {
        EngineKind::Postgres => Box::new(PostgreSqlDialect {}),
        EngineKind::MySql => Box::new(MySqlDialect {}),
        EngineKind::SqlServer => Box::new(MsSqlDialect {}),
        EngineKind::Couchbase => Box::new(GenericDialect {}),
    }
}

/// Splits a batch on top-level semicolons.
///
/// Quoted strings, quoted identifiers, comments and dollar-quoted bodies are
/// respected. Empty and comment-only segments are dropped. If the batch
/// cannot be tokenized it is returned whole so the server reports the error.
pub fn split_statements(kind: EngineKind, sql: &str) -> Vec<StatementSpan> {
    let dialect = dialect_for(kind);
    let tokens = match Tokenizer::new(&*dialect, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(err) => {
            tracing::debug!(error = %err, "Tokenizer failed, keeping batch whole");
            let text = sql.trim();
            if text.is_empty() {
                return Vec::new();
            }
            return vec![StatementSpan {
                text: text.to_string(),
                line: 1,
                end_line: sql.lines().count().max(1) as u64,
            }];
        }
    };

    let offsets = LineOffsets::new(sql);
    let mut statements = Vec::new();
    // (byte offset, first line, last line) of the statement being read
    let mut current: Option<(usize, u64, u64)> = None;

    for token in tokens {
        match token.token {
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon => {
                if let Some((begin, line, end_line)) = current.take() {
                    let end = offsets.byte_offset(token.span.start);
                    push_statement(&mut statements, &sql[begin..end], line, end_line);
                }
            }
            _ => {
                let start = token.span.start;
                let end_line = token.span.end.line.max(start.line);
                match current.as_mut() {
                    Some((_, _, last)) => *last = end_line,
                    None => current = Some((offsets.byte_offset(start), start.line, end_line)),
                }
            }
        }
    }

    if let Some((begin, line, end_line)) = current {
        push_statement(&mut statements, &sql[begin..], line, end_line);
    }

    statements
}

fn push_statement(statements: &mut Vec<StatementSpan>, text: &str, line: u64, end_line: u64) {
    let text = text.trim();
    if !text.is_empty() {
        statements.push(StatementSpan {
            text: text.to_string(),
            line,
            end_line,
        });
    }
}

/// Maps tokenizer locations (1-based line, 1-based char column) to byte offsets
struct LineOffsets<'a> {
    sql: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineOffsets<'a> {
    fn new(sql: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(sql.match_indices('\n').map(|(idx, _)| idx + 1));
        Self { sql, starts }
    }

    fn byte_offset(&self, location: Location) -> usize {
        let line = (location.line.max(1) - 1) as usize;
        let Some(&line_start) = self.starts.get(line) else {
            return self.sql.len();
        };
        let column = (location.column.max(1) - 1) as usize;
        self.sql[line_start..]
            .char_indices()
            .nth(column)
            .map(|(idx, _)| line_start + idx)
            .unwrap_or(self.sql.len())
    }
}

/// Indexes of the statements covering `line`, for errors that only carry a
/// line number.
///
/// Several statements sharing the line are all returned; a line between
/// statements belongs to the one before it. Never empty for a non-empty
/// batch.
pub fn statements_at_line(statements: &[StatementSpan], line: u64) -> Range<usize> {
    let first = statements
        .iter()
        .position(|statement| statement.line <= line && line <= statement.end_line);

    match first {
        Some(first) => {
            let count = statements[first..]
                .iter()
                .take_while(|statement| statement.line <= line)
                .count();
            first..first + count
        }
        None => {
            let before = statements
                .iter()
                .rposition(|statement| statement.line <= line)
                .unwrap_or(0);
            before..(before + 1).min(statements.len().max(1))
        }
    }
}

/// Decides whether a single statement returns a result set.
///
/// Stored procedure calls on SQL Server are assumed to return rows, since
/// most of them end in a SELECT and the batch would otherwise lose them.
pub fn statement_returns_rows(kind: EngineKind, sql: &str) -> bool {
    if kind == EngineKind::SqlServer && starts_with_keyword(sql, &["EXEC", "EXECUTE"]) {
        return true;
    }
    returns_rows(kind, sql).unwrap_or_else(|_| is_select_prefix(sql))
}

/// Parser-based classification; errors when the dialect cannot parse `sql`.
pub fn returns_rows(kind: EngineKind, sql: &str) -> Result<bool, String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err("Empty SQL".to_string());
    }

    let dialect = dialect_for(kind);
    let statements = Parser::parse_sql(&*dialect, trimmed).map_err(|err| err.to_string())?;

    Ok(statements.iter().any(statement_has_result_set))
}

/// Keyword fallback for statements the parser does not understand
pub fn is_select_prefix(sql: &str) -> bool {
    starts_with_keyword(
        sql,
        &["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "VALUES", "INFER"],
    )
}

fn starts_with_keyword(sql: &str, keywords: &[&str]) -> bool {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or("");
    keywords.iter().any(|keyword| first.eq_ignore_ascii_case(keyword))
}

fn statement_has_result_set(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => query_has_result_set(query),
        Statement::Insert(insert) => insert.returning.is_some(),
        Statement::Update(update) => update.returning.is_some(),
        Statement::Delete(delete) => delete.returning.is_some(),
        Statement::Explain { .. }
        | Statement::ExplainTable { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCharset(_)
        | Statement::ShowObjects(_)
        | Statement::ShowTables { .. }
        | Statement::ShowViews { .. }
        | Statement::ShowCollation { .. } => true,
        _ => false,
    }
}

fn query_has_result_set(query: &Query) -> bool {
    set_expr_has_result_set(&query.body)
}

fn set_expr_has_result_set(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Select(select) => !select_has_into(select),
        SetExpr::Query(query) => query_has_result_set(query),
        SetExpr::SetOperation { left, .. } => set_expr_has_result_set(left),
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        SetExpr::Insert(_)
        | SetExpr::Update(_)
        | SetExpr::Delete(_)
        | SetExpr::Merge(_) => false,
    }
}

fn select_has_into(select: &Select) -> bool {
    select.into.is_some()
}
