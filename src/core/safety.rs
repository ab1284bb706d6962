use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{ObjectName, Query, Visit, Visitor};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::core::error::SafetyViolation;
use crate::core::schema::SchemaDescription;

/// SQL that passed every policy check, possibly rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    pub sql: String,
    pub limit_appended: bool,
    /// Tables the statement reads, lowercased.
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Semicolon,
    OpenParen,
    CloseParen,
    Other,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

/// Split SQL into the tokens the policy cares about. String literals, quoted
/// identifiers and comments are skipped so their contents never count as
/// keywords or separators.
fn scan(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b if b.is_ascii_whitespace() => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            b'\'' | b'"' | b'`' | b'[' => {
                let close = if b == b'[' { b']' } else { b };
                let start = i;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == close {
                        // Doubled quote is an escaped quote.
                        if close != b']' && bytes.get(i + 1) == Some(&close) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
                tokens.push(Token {
                    kind: TokenKind::Other,
                    start,
                    end: i,
                });
            }
            b';' | b'(' | b')' => {
                let kind = match b {
                    b';' => TokenKind::Semicolon,
                    b'(' => TokenKind::OpenParen,
                    _ => TokenKind::CloseParen,
                };
                tokens.push(Token {
                    kind,
                    start: i,
                    end: i + 1,
                });
                i += 1;
            }
            b if b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80 => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'$'
                        || bytes[i] >= 0x80)
                {
                    i += 1;
                }
                let kind = if b.is_ascii_digit() {
                    TokenKind::Other
                } else {
                    TokenKind::Word
                };
                tokens.push(Token {
                    kind,
                    start,
                    end: i,
                });
            }
            _ => {
                tokens.push(Token {
                    kind: TokenKind::Other,
                    start: i,
                    end: i + 1,
                });
                i += 1;
            }
        }
    }
    tokens
}

pub struct SqlValidator {
    default_row_limit: u32,
}

impl SqlValidator {
    pub fn new(default_row_limit: u32) -> Self {
        Self { default_row_limit }
    }

    /// Check `sql` against the read-only policy.
    ///
    /// Rules apply in order: single statement, leading `SELECT`, row cap
    /// (appends `LIMIT` when absent), and known tables only.
    pub fn validate(
        &self,
        sql: &str,
        schema: &SchemaDescription,
    ) -> Result<ValidatedSql, SafetyViolation> {
        let mut tokens = scan(sql);
        while tokens
            .last()
            .is_some_and(|t| t.kind == TokenKind::Semicolon)
        {
            tokens.pop();
        }
        if tokens.iter().any(|t| t.kind == TokenKind::Semicolon) {
            return Err(SafetyViolation::MultipleStatements);
        }

        let (first, last) = match (tokens.first(), tokens.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(SafetyViolation::EmptyStatement),
        };
        let leading = &sql[first.start..first.end];
        if first.kind != TokenKind::Word || !leading.eq_ignore_ascii_case("select") {
            return Err(SafetyViolation::WriteOperationForbidden {
                keyword: leading.to_uppercase(),
            });
        }

        // Trailing separators and comments are dropped so an appended LIMIT
        // can never end up inside a comment.
        let mut body = sql[first.start..last.end].to_string();
        let limit_appended = !has_top_level_limit(sql, &tokens);
        if limit_appended {
            body.push_str(&format!(" LIMIT {}", self.default_row_limit));
        }

        let tables = match referenced_tables(&body) {
            Some(tables) => tables,
            None => {
                debug!("SQL did not parse; checking tables from the token stream");
                scanned_tables(sql, &tokens)
            }
        };
        if let Some(unknown) = tables.iter().find(|t| !schema.has_table(t)) {
            return Err(SafetyViolation::UnknownTable {
                table: unknown.clone(),
            });
        }

        Ok(ValidatedSql {
            sql: body,
            limit_appended,
            tables,
        })
    }
}

fn has_top_level_limit(sql: &str, tokens: &[Token]) -> bool {
    let mut depth = 0i32;
    for token in tokens {
        match token.kind {
            TokenKind::OpenParen => depth += 1,
            TokenKind::CloseParen => depth -= 1,
            TokenKind::Word if depth == 0 => {
                if sql[token.start..token.end].eq_ignore_ascii_case("limit") {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

#[derive(Default)]
struct RelationCollector {
    relations: BTreeSet<String>,
    ctes: BTreeSet<String>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.insert(bare_table_name(&relation.to_string()));
        ControlFlow::Continue(())
    }
}

/// Last dotted segment, unquoted and lowercased: `main."Teachers"` -> `teachers`.
fn bare_table_name(name: &str) -> String {
    let last = name.rsplit('.').next().unwrap_or(name);
    last.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
        .to_lowercase()
}

fn referenced_tables(sql: &str) -> Option<Vec<String>> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql).ok()?;
    let mut collector = RelationCollector::default();
    for statement in &statements {
        let _ = statement.visit(&mut collector);
    }
    let RelationCollector { relations, ctes } = collector;
    Some(relations.into_iter().filter(|r| !ctes.contains(r)).collect())
}

fn is_name(sql: &str, token: &Token) -> bool {
    match token.kind {
        TokenKind::Word => true,
        TokenKind::Other => matches!(sql.as_bytes()[token.start], b'"' | b'`' | b'['),
        _ => false,
    }
}

fn is_keyword(sql: &str, token: Option<&Token>, keyword: &str) -> bool {
    token.is_some_and(|t| {
        t.kind == TokenKind::Word && sql[t.start..t.end].eq_ignore_ascii_case(keyword)
    })
}

fn is_punct(sql: &str, token: Option<&Token>, punct: &str) -> bool {
    token.is_some_and(|t| t.kind == TokenKind::Other && &sql[t.start..t.end] == punct)
}

const FROM_CLAUSE_END: &[&str] = &[
    "where", "group", "having", "order", "limit", "window", "union", "except", "intersect",
];

/// Tables named by a statement the parser rejected.
///
/// Every relation after `FROM`, `JOIN`, or a comma of a `FROM` list at the
/// same nesting depth counts, so syntax the parser does not know (`GLOB`,
/// `INDEXED BY`) cannot hide a table. Table-valued functions are reported
/// as tables.
fn scanned_tables(sql: &str, tokens: &[Token]) -> Vec<String> {
    let mut relations = BTreeSet::new();
    let mut ctes = BTreeSet::new();
    // Depths at which a FROM list is open.
    let mut from_depths: Vec<i32> = Vec::new();
    let mut depth = 0i32;
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        match token.kind {
            TokenKind::OpenParen => depth += 1,
            TokenKind::CloseParen => {
                depth -= 1;
                from_depths.retain(|d| *d <= depth);
            }
            _ => {}
        }

        // `name AS (` defines a CTE.
        if is_name(sql, token)
            && is_keyword(sql, tokens.get(i + 1), "as")
            && tokens.get(i + 2).is_some_and(|t| t.kind == TokenKind::OpenParen)
        {
            ctes.insert(bare_table_name(&sql[token.start..token.end]));
        }

        let in_from = from_depths.last() == Some(&depth);
        let starts_relation = if is_keyword(sql, Some(token), "from")
            || is_keyword(sql, Some(token), "join")
        {
            if !in_from {
                from_depths.push(depth);
            }
            true
        } else if in_from && is_punct(sql, Some(token), ",") {
            true
        } else {
            if in_from
                && FROM_CLAUSE_END
                    .iter()
                    .any(|kw| is_keyword(sql, Some(token), kw))
            {
                from_depths.pop();
            }
            false
        };

        if starts_relation && let Some((name, next)) = relation_at(sql, tokens, i + 1) {
            relations.insert(name);
            i = next;
            continue;
        }
        i += 1;
    }
    relations.into_iter().filter(|r| !ctes.contains(r)).collect()
}

/// A possibly qualified relation name starting at `start`, with the index of
/// the token after it.
fn relation_at(sql: &str, tokens: &[Token], start: usize) -> Option<(String, usize)> {
    let first = tokens.get(start).filter(|t| is_name(sql, t))?;
    let mut last = first;
    let mut next = start + 1;
    while is_punct(sql, tokens.get(next), ".")
        && let Some(part) = tokens.get(next + 1).filter(|t| is_name(sql, t))
    {
        last = part;
        next += 2;
    }
    Some((bare_table_name(&sql[last.start..last.end]), next))
}
