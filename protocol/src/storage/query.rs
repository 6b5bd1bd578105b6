//! # World-State Queries
//!
//! A deliberately small, read-only SQL dialect over the `world_state` table:
//!
//! ```text
//! SELECT <* | col[, col]*> FROM world_state
//!     [WHERE <col> <op> <operand> [AND <col> <op> <operand>]*]
//!     [ORDER BY <col> [ASC | DESC]]
//!     [LIMIT <n | ?>]
//! ```
//!
//! Columns: `key`, `value`, `version`, `updated_at`, `updated_by`,
//! `block_height`. Operators: `=`, `!=`, `<>`, `<`, `<=`, `>`, `>=`, `LIKE`
//! (`%` and `_` wildcards). Operands are `'quoted strings'`, numbers,
//! `TRUE`/`FALSE`/`NULL`, or `?` placeholders bound positionally.
//!
//! The statement kind is checked before anything else. Anything that isn't
//! a single `SELECT` fails with [`QueryError::NotReadOnly`] and nothing is
//! evaluated.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

use super::db::StorageError;
use super::state::WorldStateEntry;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("only SELECT statements are allowed, got {0}")]
    NotReadOnly(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown table {0:?}; the only table is world_state")]
    UnknownTable(String),

    #[error("unknown column {0:?}")]
    UnknownColumn(String),

    #[error("statement has {expected} placeholders but {got} parameters were bound")]
    ParamCount { expected: usize, got: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type QueryResult<T> = Result<T, QueryError>;

pub const TABLE: &str = "world_state";

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Key,
    Value,
    Version,
    UpdatedAt,
    UpdatedBy,
    BlockHeight,
}

impl Column {
    pub const ALL: [Column; 6] = [
        Column::Key,
        Column::Value,
        Column::Version,
        Column::UpdatedAt,
        Column::UpdatedBy,
        Column::BlockHeight,
    ];

    fn parse(name: &str) -> QueryResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "key" => Ok(Self::Key),
            "value" => Ok(Self::Value),
            "version" => Ok(Self::Version),
            "updated_at" => Ok(Self::UpdatedAt),
            "updated_by" => Ok(Self::UpdatedBy),
            "block_height" => Ok(Self::BlockHeight),
            _ => Err(QueryError::UnknownColumn(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Value => "value",
            Self::Version => "version",
            Self::UpdatedAt => "updated_at",
            Self::UpdatedBy => "updated_by",
            Self::BlockHeight => "block_height",
        }
    }

    fn read(&self, row: &WorldStateEntry) -> Value {
        match self {
            Self::Key => Value::from(row.key.clone()),
            Self::Value => row.value.clone(),
            Self::Version => Value::from(row.version),
            Self::UpdatedAt => Value::from(row.updated_at),
            Self::UpdatedBy => Value::from(row.updated_by.clone()),
            Self::BlockHeight => Value::from(row.block_height),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(f64),
    Param,
    Star,
    Comma,
    Semicolon,
    Op(&'static str),
}

fn tokenize(sql: &str) -> QueryResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Param);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += 1;
            }
            '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('!', Some('=')) => ("!=", 2),
                    ('<', Some('>')) => ("!=", 2),
                    ('<', Some('=')) => ("<=", 2),
                    ('>', Some('=')) => (">=", 2),
                    ('<', _) => ("<", 1),
                    ('>', _) => (">", 1),
                    _ => return Err(QueryError::Parse(format!("unexpected {:?}", c))),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(QueryError::Parse("unterminated string".into())),
                        // '' is an escaped quote
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| QueryError::Parse(format!("bad number {:?}", text)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => return Err(QueryError::Parse(format!("unexpected {:?}", other))),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Statement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

#[derive(Debug, Clone)]
struct Condition {
    column: Column,
    op: CmpOp,
    operand: Value,
}

/// A parsed, parameter-bound `SELECT`.
#[derive(Debug, Clone)]
pub struct Select {
    columns: Vec<Column>,
    conditions: Vec<Condition>,
    order_by: Option<(Column, bool)>,
    limit: Option<usize>,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [Value],
    next_param: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn expect_keyword(&mut self, kw: &str) -> QueryResult<()> {
        if self.peek_keyword(kw) {
            self.pos += 1;
            Ok(())
        } else {
            Err(QueryError::Parse(format!(
                "expected {}, found {:?}",
                kw,
                self.peek()
            )))
        }
    }

    fn word(&mut self) -> QueryResult<String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            other => Err(QueryError::Parse(format!("expected identifier, found {:?}", other))),
        }
    }

    fn operand(&mut self) -> QueryResult<Value> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::from(s)),
            Some(Token::Num(n)) => Ok(number(n)),
            Some(Token::Param) => {
                let v = self.params.get(self.next_param).cloned();
                self.next_param += 1;
                // Checked against the total once parsing is done.
                Ok(v.unwrap_or(Value::Null))
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("null") => Ok(Value::Null),
            other => Err(QueryError::Parse(format!("expected value, found {:?}", other))),
        }
    }

    fn condition(&mut self) -> QueryResult<Condition> {
        let column = Column::parse(&self.word()?)?;
        let op = match self.next() {
            Some(Token::Op("=")) => CmpOp::Eq,
            Some(Token::Op("!=")) => CmpOp::Ne,
            Some(Token::Op("<")) => CmpOp::Lt,
            Some(Token::Op("<=")) => CmpOp::Le,
            Some(Token::Op(">")) => CmpOp::Gt,
            Some(Token::Op(">=")) => CmpOp::Ge,
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("like") => CmpOp::Like,
            other => return Err(QueryError::Parse(format!("expected operator, found {:?}", other))),
        };
        let operand = self.operand()?;
        Ok(Condition {
            column,
            op,
            operand,
        })
    }

    fn select(&mut self) -> QueryResult<Select> {
        self.expect_keyword("select")?;

        let mut columns = Vec::new();
        if matches!(self.peek(), Some(Token::Star)) {
            self.pos += 1;
            columns.extend_from_slice(&Column::ALL);
        } else {
            loop {
                columns.push(Column::parse(&self.word()?)?);
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        self.expect_keyword("from")?;
        let table = self.word()?;
        if !table.eq_ignore_ascii_case(TABLE) {
            return Err(QueryError::UnknownTable(table));
        }

        let mut conditions = Vec::new();
        if self.peek_keyword("where") {
            self.pos += 1;
            conditions.push(self.condition()?);
            while self.peek_keyword("and") {
                self.pos += 1;
                conditions.push(self.condition()?);
            }
        }

        let mut order_by = None;
        if self.peek_keyword("order") {
            self.pos += 1;
            self.expect_keyword("by")?;
            let column = Column::parse(&self.word()?)?;
            let descending = if self.peek_keyword("desc") {
                self.pos += 1;
                true
            } else {
                if self.peek_keyword("asc") {
                    self.pos += 1;
                }
                false
            };
            order_by = Some((column, descending));
        }

        let mut limit = None;
        if self.peek_keyword("limit") {
            self.pos += 1;
            let n = self.operand()?;
            let n = n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
                .ok_or_else(|| QueryError::Parse(format!("bad LIMIT {}", n)))?;
            limit = Some(n as usize);
        }

        if matches!(self.peek(), Some(Token::Semicolon)) {
            self.pos += 1;
        }
        if let Some(extra) = self.peek() {
            return Err(QueryError::Parse(format!("unexpected trailing {:?}", extra)));
        }
        if self.next_param != self.params.len() {
            return Err(QueryError::ParamCount {
                expected: self.next_param,
                got: self.params.len(),
            });
        }

        Ok(Select {
            columns,
            conditions,
            order_by,
            limit,
        })
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Parse `sql` and bind `params`. Rejects anything but a single SELECT
/// before looking any further.
pub fn parse(sql: &str, params: &[Value]) -> QueryResult<Select> {
    let tokens = tokenize(sql)?;

    let leading = match tokens.first() {
        Some(Token::Word(w)) => w.clone(),
        Some(other) => return Err(QueryError::Parse(format!("unexpected {:?}", other))),
        None => return Err(QueryError::Parse("empty statement".into())),
    };
    if !leading.eq_ignore_ascii_case("select") {
        return Err(QueryError::NotReadOnly(leading.to_ascii_uppercase()));
    }
    if let Some(pos) = tokens.iter().position(|t| *t == Token::Semicolon) {
        if pos + 1 < tokens.len() {
            return Err(QueryError::NotReadOnly("multiple statements".into()));
        }
    }

    Parser {
        tokens,
        pos: 0,
        params,
        next_param: 0,
    }
    .select()
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Text used for LIKE matching: strings as-is, everything else as JSON.
fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn like(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    // dp[j] = pattern[..j] matches text[..i]
    let mut dp = vec![false; p.len() + 1];
    dp[0] = true;
    for j in 1..=p.len() {
        dp[j] = dp[j - 1] && p[j - 1] == '%';
    }
    for tc in &t {
        let mut prev_diag = dp[0];
        dp[0] = false;
        for j in 1..=p.len() {
            let above = dp[j];
            dp[j] = match p[j - 1] {
                '%' => dp[j - 1] || above,
                '_' => prev_diag,
                pc => prev_diag && pc == *tc,
            };
            prev_diag = above;
        }
    }
    dp[p.len()]
}

impl Condition {
    fn matches(&self, row: &WorldStateEntry) -> bool {
        let actual = self.column.read(row);
        match self.op {
            CmpOp::Like => like(&as_text(&actual), &as_text(&self.operand)),
            CmpOp::Eq => actual == self.operand || compare(&actual, &self.operand) == Some(Ordering::Equal),
            CmpOp::Ne => !(actual == self.operand || compare(&actual, &self.operand) == Some(Ordering::Equal)),
            op => match compare(&actual, &self.operand) {
                Some(ord) => match op {
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                    _ => false,
                },
                None => false,
            },
        }
    }
}

impl Select {
    /// Evaluate against rows in key order.
    pub fn execute<I>(&self, rows: I) -> QueryResult<Vec<Map<String, Value>>>
    where
        I: Iterator<Item = Result<WorldStateEntry, StorageError>>,
    {
        let mut matched = Vec::new();
        for row in rows {
            let row = row?;
            if self.conditions.iter().all(|c| c.matches(&row)) {
                matched.push(row);
                // Rows already arrive in key order, so without a different
                // ORDER BY we can stop at the limit.
                if self.order_by.is_none() && self.limit == Some(matched.len()) {
                    break;
                }
            }
        }

        if let Some((column, descending)) = self.order_by {
            matched.sort_by(|a, b| {
                let ord = compare(&column.read(a), &column.read(b))
                    .unwrap_or_else(|| as_text(&column.read(a)).cmp(&as_text(&column.read(b))));
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }

        Ok(matched
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .map(|c| (c.name().to_string(), c.read(row)))
                    .collect()
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
