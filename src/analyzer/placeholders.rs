//! Placeholder handling for engines without parameter metadata.
//!
//! Queries are tokenized so placeholders inside string literals and comments
//! are left alone. When tokenizing fails the text is scanned directly.

use regex::Regex;
use sqlparser::dialect::Dialect;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer};
use std::ops::Range;
use std::sync::OnceLock;

fn named_param_regex() -> &'static Regex {
    static NAMED: OnceLock<Regex> = OnceLock::new();
    NAMED.get_or_init(|| Regex::new(r"\{(\w+):(\w+)\}|\?").expect("valid regex"))
}

/// A placeholder found in query text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `?`, `$1`, `:name` and similar
    Positional(String),
    /// ClickHouse `{name:Type}`
    Typed { name: String, data_type: String },
}

/// Placeholders with their byte ranges in the query.
fn scan(dialect: &dyn Dialect, query: &str) -> Vec<(Placeholder, Range<usize>)> {
    match Tokenizer::new(dialect, query).tokenize_with_location() {
        Ok(tokens) => scan_tokens(query, &tokens),
        Err(e) => {
            tracing::debug!(error = %e, "tokenizer failed, scanning placeholders textually");
            scan_text(query)
        }
    }
}

fn scan_tokens(query: &str, tokens: &[TokenWithSpan]) -> Vec<(Placeholder, Range<usize>)> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let rest = &tokens[i..];
        if let [open, name, colon, ty, close, ..] = rest {
            if let (Token::LBrace, Token::Word(name), Token::Colon, Token::Word(ty), Token::RBrace) =
                (&open.token, &name.token, &colon.token, &ty.token, &close.token)
            {
                let range = byte_offset(query, open.span.start)..byte_offset(query, close.span.end);
                found.push((
                    Placeholder::Typed {
                        name: name.value.clone(),
                        data_type: ty.value.clone(),
                    },
                    range,
                ));
                i += 5;
                continue;
            }
        }
        if let Token::Placeholder(p) = &rest[0].token {
            let span = &rest[0].span;
            let range = byte_offset(query, span.start)..byte_offset(query, span.end);
            found.push((Placeholder::Positional(p.clone()), range));
        }
        i += 1;
    }
    found
}

fn scan_text(query: &str) -> Vec<(Placeholder, Range<usize>)> {
    named_param_regex()
        .captures_iter(query)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let placeholder = match (caps.get(1), caps.get(2)) {
                (Some(name), Some(ty)) => Placeholder::Typed {
                    name: name.as_str().to_string(),
                    data_type: ty.as_str().to_string(),
                },
                _ => Placeholder::Positional("?".into()),
            };
            Some((placeholder, whole.range()))
        })
        .collect()
}

/// Converts a 1-based line/column location into a byte offset.
fn byte_offset(query: &str, loc: Location) -> usize {
    let mut offset = 0;
    for (idx, line) in query.split_inclusive('\n').enumerate() {
        if idx + 1 == loc.line as usize {
            let col = (loc.column as usize).saturating_sub(1);
            return offset
                + line
                    .char_indices()
                    .nth(col)
                    .map(|(i, _)| i)
                    .unwrap_or(line.len());
        }
        offset += line.len();
    }
    query.len()
}

/// Placeholders in `query`, in textual order.
pub fn find_placeholders(dialect: &dyn Dialect, query: &str) -> Vec<Placeholder> {
    scan(dialect, query).into_iter().map(|(p, _)| p).collect()
}

/// A query with its placeholders replaced, remembering where each
/// substitution happened so engine positions can be mapped back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub sql: String,
    original_len: usize,
    /// (range in the original query, range in `sql`)
    splices: Vec<(Range<usize>, Range<usize>)>,
}

impl Rewritten {
    /// Maps a byte offset in `sql` back to the query it was rewritten from.
    /// Offsets inside a substitution land on the placeholder's start; offsets
    /// past the end of `sql` have no counterpart.
    pub fn original_offset(&self, offset: usize) -> Option<usize> {
        if offset > self.sql.len() {
            return None;
        }
        let mut shift: isize = 0;
        for (original, replaced) in &self.splices {
            if offset < replaced.start {
                break;
            }
            if offset < replaced.end {
                return Some(original.start);
            }
            shift = original.end as isize - replaced.end as isize;
        }
        let mapped = (offset as isize + shift).max(0) as usize;
        Some(mapped.min(self.original_len))
    }
}

/// Replace every placeholder with `NULL`, keeping the substitution ranges.
pub fn rewrite_placeholders(dialect: &dyn Dialect, query: &str) -> Rewritten {
    let mut sql = String::with_capacity(query.len());
    let mut splices = Vec::new();
    let mut last = 0;
    for (_, range) in scan(dialect, query) {
        sql.push_str(&query[last..range.start]);
        let start = sql.len();
        sql.push_str("NULL");
        splices.push((range.clone(), start..sql.len()));
        last = range.end;
    }
    sql.push_str(&query[last..]);
    Rewritten {
        sql,
        original_len: query.len(),
        splices,
    }
}

/// Replace every placeholder with `NULL` so the query can be described
/// without bound values.
pub fn replace_placeholders(dialect: &dyn Dialect, query: &str) -> String {
    rewrite_placeholders(dialect, query).sql
}

/// Whether the statement returns rows: its first keyword, after comments and
/// blank lines, is `SELECT` or `WITH`.
pub fn is_select(query: &str) -> bool {
    for line in query.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("--") || line.starts_with('#') {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        return lower.starts_with("select") || lower.starts_with("with");
    }
    false
}
