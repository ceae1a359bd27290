//! Predicates for conditional branches and loop exit conditions.
//!
//! A predicate is a small boolean expression over the run's shared state:
//!
//! ```text
//! review.approved
//! !draft && attempts < 3
//! status == "done" || (score >= 0.8 && errors[0] == null)
//! ```
//!
//! Evaluation never fails. A missing path or a comparison between
//! incompatible types is simply `false`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::run::SharedState;
use crate::template::{PathSegment, lookup, parse_path_segments};

/// Errors raised while parsing a predicate expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredicateError {
    #[error("Empty predicate")]
    Empty,

    #[error("Unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("Unterminated string starting at position {pos}")]
    UnterminatedString { pos: usize },

    #[error("Invalid number '{text}' at position {pos}")]
    InvalidNumber { text: String, pos: usize },

    #[error("Unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("Unexpected end of predicate")]
    UnexpectedEnd,
}

/// A parsed predicate. Serializes as its source string.
#[derive(Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Parse a predicate expression.
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(PredicateError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(PredicateError::UnexpectedToken {
                found: token.kind.describe(),
                pos: token.pos,
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluate against shared state.
    pub fn evaluate(&self, state: &SharedState) -> bool {
        self.expr.eval(state)
    }

    /// The original expression text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.source).finish()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Predicate {
    type Error = PredicateError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Predicate> for String {
    fn from(p: Predicate) -> Self {
        p.source
    }
}

impl Serialize for Predicate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Predicate::parse(&source).map_err(|e| {
            serde::de::Error::custom(format!("invalid predicate '{}': {}", source, e))
        })
    }
}

// ---------------------------------------------------------------------------
// Expression tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

#[derive(Debug, Clone)]
enum Operand {
    Path(Vec<PathSegment>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    fn eval(&self, state: &SharedState) -> bool {
        match self {
            Expr::Not(inner) => !inner.eval(state),
            Expr::And(a, b) => a.eval(state) && b.eval(state),
            Expr::Or(a, b) => a.eval(state) || b.eval(state),
            Expr::Truthy(operand) => operand.resolve(state).is_some_and(is_truthy),
            Expr::Compare(lhs, op, rhs) => {
                match (lhs.resolve(state), rhs.resolve(state)) {
                    (Some(l), Some(r)) => compare(l, *op, r),
                    _ => false,
                }
            }
        }
    }
}

impl Operand {
    fn resolve<'v>(&'v self, state: &'v SharedState) -> Option<&'v Value> {
        match self {
            Operand::Path(segments) => lookup(state, segments),
            Operand::Literal(value) => Some(value),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(lhs, rhs),
        CmpOp::Ne => !values_equal(lhs, rhs),
        _ => {
            let ordering = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => false,
            }
        }
    }
}

/// JSON equality, except numbers compare by value (`1 == 1.0`).
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Path(String),
    Literal(Value),
    Op(CmpOp),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Path(p) => format!("path '{}'", p),
            TokenKind::Literal(v) => format!("literal {}", v),
            TokenKind::Op(_) => "comparison operator".to_string(),
            TokenKind::Not => "'!'".to_string(),
            TokenKind::And => "'&&'".to_string(),
            TokenKind::Or => "'||'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']')
}

fn tokenize(source: &str) -> Result<Vec<Token>, PredicateError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);

    while let Some(&(pos, c)) = chars.get(i) {
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (kind, len) = match (c, peek(i + 1)) {
            ('&', Some('&')) => (TokenKind::And, 2),
            ('|', Some('|')) => (TokenKind::Or, 2),
            ('=', Some('=')) => (TokenKind::Op(CmpOp::Eq), 2),
            ('!', Some('=')) => (TokenKind::Op(CmpOp::Ne), 2),
            ('<', Some('=')) => (TokenKind::Op(CmpOp::Le), 2),
            ('>', Some('=')) => (TokenKind::Op(CmpOp::Ge), 2),
            ('<', _) => (TokenKind::Op(CmpOp::Lt), 1),
            ('>', _) => (TokenKind::Op(CmpOp::Gt), 1),
            ('!', _) => (TokenKind::Not, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('"' | '\'', _) => {
                let (text, consumed) = read_string(&chars, i)?;
                (TokenKind::Literal(Value::String(text)), consumed)
            }
            (c, next) if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut end = i + 1;
                while let Some(n) = peek(end)
                    && (n.is_ascii_digit() || matches!(n, '.' | 'e' | 'E' | '+' | '-'))
                {
                    end += 1;
                }
                let text: String = chars[i..end].iter().map(|(_, c)| c).collect();
                let value = serde_json::from_str::<serde_json::Number>(&text)
                    .map_err(|_| PredicateError::InvalidNumber {
                        text: text.clone(),
                        pos,
                    })?;
                (TokenKind::Literal(Value::Number(value)), end - i)
            }
            (c, _) if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i + 1;
                while let Some(n) = peek(end)
                    && is_path_char(n)
                {
                    end += 1;
                }
                let text: String = chars[i..end].iter().map(|(_, c)| c).collect();
                let kind = match text.as_str() {
                    "true" => TokenKind::Literal(Value::Bool(true)),
                    "false" => TokenKind::Literal(Value::Bool(false)),
                    "null" => TokenKind::Literal(Value::Null),
                    _ => TokenKind::Path(text),
                };
                (kind, end - i)
            }
            (c, _) => return Err(PredicateError::UnexpectedChar { ch: c, pos }),
        };

        tokens.push(Token { kind, pos });
        i += len;
    }

    Ok(tokens)
}

/// Read a quoted string starting at `start`. Returns the unescaped text and
/// the number of chars consumed including quotes.
fn read_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize), PredicateError> {
    let (pos, quote) = chars[start];
    let mut text = String::new();
    let mut i = start + 1;

    while let Some(&(_, c)) = chars.get(i) {
        match c {
            '\\' => {
                let Some(&(_, escaped)) = chars.get(i + 1) else {
                    break;
                };
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1 - start)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }

    Err(PredicateError::UnterminatedString { pos })
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------
//
// or      := and ("||" and)*
// and     := unary ("&&" unary)*
// unary   := "!" unary | primary
// primary := "(" or ")" | operand (cmp operand)?

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn next(&mut self) -> Result<Token, PredicateError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(PredicateError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn parse_or(&mut self) -> Result<Expr, PredicateError> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&TokenKind::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, PredicateError> {
        let mut expr = self.parse_unary()?;
        while self.peek() == Some(&TokenKind::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, PredicateError> {
        if self.peek() == Some(&TokenKind::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, PredicateError> {
        let token = self.next()?;
        let lhs = match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                let close = self.next()?;
                if close.kind != TokenKind::RParen {
                    return Err(PredicateError::UnexpectedToken {
                        found: close.kind.describe(),
                        pos: close.pos,
                    });
                }
                return Ok(inner);
            }
            TokenKind::Path(path) => Operand::Path(parse_path_segments(&path)),
            TokenKind::Literal(value) => Operand::Literal(value),
            other => {
                return Err(PredicateError::UnexpectedToken {
                    found: other.describe(),
                    pos: token.pos,
                });
            }
        };

        let Some(TokenKind::Op(op)) = self.peek().cloned() else {
            return Ok(Expr::Truthy(lhs));
        };
        self.pos += 1;

        let token = self.next()?;
        let rhs = match token.kind {
            TokenKind::Path(path) => Operand::Path(parse_path_segments(&path)),
            TokenKind::Literal(value) => Operand::Literal(value),
            other => {
                return Err(PredicateError::UnexpectedToken {
                    found: other.describe(),
                    pos: token.pos,
                });
            }
        };

        Ok(Expr::Compare(lhs, op, rhs))
    }
}
