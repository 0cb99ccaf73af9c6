//! Query expression trees and the where-clause parser.
//!
//! A [`QExpr`] is an owned tree: connectives box their children, so a node can never be
//! shared or form a cycle, and dropping the root frees everything below it.
//!
//! There is no "not equal" leaf. `a != 5` is represented as `NOT (a == 5)`, both when
//! built with [`QExpr::compare`] and when parsed.
//!
//! # Grammar
//! ```text
//! expr       := xor_expr (OR xor_expr)*
//! xor_expr   := and_expr (XOR and_expr)*
//! and_expr   := unary (AND unary)*
//! unary      := NOT unary | '(' expr ')' | comparison
//! comparison := name op literal
//!             | number op name [op number]        e.g. 2 < a <= 7
//!             | name [NOT] BETWEEN number AND number
//!             | name [NOT] IN '(' literal (',' literal)* ')'
//! op         := < | <= | > | >= | = | == | != | <>
//! ```
//! String literals are quoted with `'` or `"` and only allowed with equality.
//!
//! # Example
//! ```rust
//! use binquery::qexpr::QExpr;
//! let e: QExpr = "a > 2 AND NOT b IN (1, 2)".parse().unwrap();
//! assert_eq!(e.columns(), vec!["a", "b"]);
//! assert_eq!(e.to_string(), "(a > 2 AND NOT (b IN (1, 2)))");
//! ```
use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Bound, Not};
use std::str::FromStr;

use itertools::Itertools;

use crate::column::Numeric;
use crate::error::{Error, Result};

/// Comparison operators accepted by [`QExpr::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// <
    Lt,
    /// <=
    Le,
    /// >
    Gt,
    /// >=
    Ge,
    /// ==
    Eq,
    /// != (becomes NOT ==)
    Ne,
}

impl CompareOp {
    /// the operator seen from the other side: `5 < a` is `a > 5`
    fn mirrored(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }
}

/// `2^53`: from here on not every integer has its own `f64`.
const EXACT_INTEGER_LIMIT: f64 = 9_007_199_254_740_992.0;

/// `v` is finite and large enough that neighbouring integers may share it.
pub(crate) fn beyond_exact_integers(v: f64) -> bool {
    v.is_finite() && v.abs() >= EXACT_INTEGER_LIMIT
}

/// `column` within an interval; the bounds may be open, closed or missing.
///
/// Bounds are `f64`. Scans compare them against the column's own element type
/// ([`ContinuousRange::contains_value`]), so 64-bit integer columns are matched
/// exactly even past 2^53; an index treats bins at such a bound as candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousRange {
    /// column name
    pub column: String,
    /// lower end
    pub lower: Bound<f64>,
    /// upper end
    pub upper: Bound<f64>,
}

impl ContinuousRange {
    /// A range from explicit bounds.
    /// `>= -inf` and `<= inf` are stored as missing ends.
    pub fn new(column: &str, lower: Bound<f64>, upper: Bound<f64>) -> Self {
        let lower = match lower {
            Bound::Included(lo) if lo == f64::NEG_INFINITY => Bound::Unbounded,
            b => b,
        };
        let upper = match upper {
            Bound::Included(hi) if hi == f64::INFINITY => Bound::Unbounded,
            b => b,
        };
        ContinuousRange { column: column.to_string(), lower, upper }
    }

    /// `column op value` for any operator but [`CompareOp::Ne`], which has no range form.
    pub fn compare(column: &str, op: CompareOp, value: f64) -> Option<Self> {
        use Bound::*;
        let (lower, upper) = match op {
            CompareOp::Lt => (Unbounded, Excluded(value)),
            CompareOp::Le => (Unbounded, Included(value)),
            CompareOp::Gt => (Excluded(value), Unbounded),
            CompareOp::Ge => (Included(value), Unbounded),
            CompareOp::Eq => (Included(value), Included(value)),
            CompareOp::Ne => return None,
        };
        Some(ContinuousRange::new(column, lower, upper))
    }

    /// `x` satisfies the lower end.
    #[inline]
    pub fn above_lower(&self, x: f64) -> bool {
        match self.lower {
            Bound::Unbounded => !x.is_nan(),
            Bound::Included(lo) => x >= lo,
            Bound::Excluded(lo) => x > lo,
        }
    }

    /// `x` satisfies the upper end.
    #[inline]
    pub fn below_upper(&self, x: f64) -> bool {
        match self.upper {
            Bound::Unbounded => !x.is_nan(),
            Bound::Included(hi) => x <= hi,
            Bound::Excluded(hi) => x < hi,
        }
    }

    /// `x` is in the range.
    #[inline]
    pub fn contains(&self, x: f64) -> bool {
        self.above_lower(x) && self.below_upper(x)
    }

    /// [`ContinuousRange::contains`] compared in the element type, so 64-bit integers
    /// beyond 2^53 are not confused with their neighbours.
    #[inline]
    pub fn contains_value<T: Numeric>(&self, x: T) -> bool {
        let lower = match self.lower {
            Bound::Unbounded => x.cmp_f64(0.0).is_some(),
            Bound::Included(lo) => matches!(x.cmp_f64(lo), Some(Ordering::Greater | Ordering::Equal)),
            Bound::Excluded(lo) => x.cmp_f64(lo) == Some(Ordering::Greater),
        };
        lower
            && match self.upper {
                Bound::Unbounded => true,
                Bound::Included(hi) => matches!(x.cmp_f64(hi), Some(Ordering::Less | Ordering::Equal)),
                Bound::Excluded(hi) => x.cmp_f64(hi) == Some(Ordering::Less),
            }
    }

    /// The range with every finite end at or beyond 2^53 made `inclusive` (or
    /// exclusive). Integers that large round to a shared `f64`, so an index can only
    /// bracket them between the two forms.
    pub(crate) fn with_coarse_ends(&self, inclusive: bool) -> ContinuousRange {
        let adjust = |b: Bound<f64>| match b {
            Bound::Included(v) | Bound::Excluded(v) if beyond_exact_integers(v) => {
                if inclusive {
                    Bound::Included(v)
                } else {
                    Bound::Excluded(v)
                }
            }
            b => b,
        };
        ContinuousRange { column: self.column.clone(), lower: adjust(self.lower), upper: adjust(self.upper) }
    }

    /// Some end is a finite value at or beyond 2^53.
    pub(crate) fn has_coarse_end(&self) -> bool {
        [self.lower, self.upper].iter().any(|b| match b {
            Bound::Included(v) | Bound::Excluded(v) => beyond_exact_integers(*v),
            Bound::Unbounded => false,
        })
    }

    /// No value can satisfy the range.
    pub fn is_empty(&self) -> bool {
        let bound_value = |b: &Bound<f64>| match b {
            Bound::Included(v) | Bound::Excluded(v) => Some(*v),
            Bound::Unbounded => None,
        };
        if bound_value(&self.lower).is_some_and(f64::is_nan) || bound_value(&self.upper).is_some_and(f64::is_nan) {
            return true;
        }
        match (self.lower, self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }
}

/// A bound as the where-clause parser reads it back; infinities overflow to `±1e999`.
struct Literal(f64);

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            v if v == f64::INFINITY => f.write_str("1e999"),
            v if v == f64::NEG_INFINITY => f.write_str("-1e999"),
            v => write!(f, "{v}"),
        }
    }
}

impl fmt::Display for ContinuousRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.column;
        let lower = match self.lower {
            Bound::Included(lo) => Some((Literal(lo), "<=")),
            Bound::Excluded(lo) => Some((Literal(lo), "<")),
            Bound::Unbounded => None,
        };
        let upper = match self.upper {
            Bound::Included(hi) => Some((Literal(hi), "<=")),
            Bound::Excluded(hi) => Some((Literal(hi), "<")),
            Bound::Unbounded => None,
        };
        match (lower, upper) {
            (Some((lo, "<=")), Some((hi, "<="))) if lo.0 == hi.0 => write!(f, "{c} == {lo}"),
            (Some((lo, lop)), Some((hi, hop))) => write!(f, "{lo} {lop} {c} {hop} {hi}"),
            (Some((lo, "<=")), None) => write!(f, "{c} >= {lo}"),
            (Some((lo, _)), None) => write!(f, "{c} > {lo}"),
            (None, Some((hi, hop))) => write!(f, "{c} {hop} {hi}"),
            // every value but NaN
            (None, None) => write!(f, "{c} >= -1e999"),
        }
    }
}

/// `column` is one of a set of values.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteRange {
    /// column name
    pub column: String,
    /// sorted, without duplicates or NaN
    pub values: Vec<f64>,
}

impl DiscreteRange {
    /// Sorts and deduplicates `values`.
    pub fn new(column: &str, values: impl IntoIterator<Item = f64>) -> Self {
        let values = values
            .into_iter()
            .filter(|v| !v.is_nan())
            .sorted_by(f64::total_cmp)
            .dedup()
            .collect();
        DiscreteRange { column: column.to_string(), values }
    }

    /// `x` is one of the values.
    pub fn contains(&self, x: f64) -> bool {
        self.values
            .binary_search_by(|v| v.partial_cmp(&x).unwrap_or(Ordering::Less))
            .is_ok()
    }

    /// [`DiscreteRange::contains`] compared in the element type.
    pub fn contains_value<T: Numeric>(&self, x: T) -> bool {
        self.values
            .binary_search_by(|&v| x.cmp_f64(v).map_or(Ordering::Less, Ordering::reverse))
            .is_ok()
    }
}

/// `column == value` for string columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringEq {
    /// column name
    pub column: String,
    /// the string to match
    pub value: String,
}

/// A node of a query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum QExpr {
    /// both sides
    And(Box<QExpr>, Box<QExpr>),
    /// either side
    Or(Box<QExpr>, Box<QExpr>),
    /// exactly one side
    Xor(Box<QExpr>, Box<QExpr>),
    /// complement within the valid rows
    Not(Box<QExpr>),
    /// interval condition on a numeric column
    Range(ContinuousRange),
    /// set membership on a numeric column
    Discrete(DiscreteRange),
    /// string equality
    StringEq(StringEq),
}

impl QExpr {
    /// `column op value`; `Ne` is rewritten to `NOT (column == value)`.
    pub fn compare(column: &str, op: CompareOp, value: f64) -> QExpr {
        match ContinuousRange::compare(column, op, value) {
            Some(r) => QExpr::Range(r),
            None => !QExpr::compare(column, CompareOp::Eq, value),
        }
    }

    /// `lo <= column <= hi`
    pub fn between(column: &str, lo: f64, hi: f64) -> QExpr {
        QExpr::Range(ContinuousRange::new(column, Bound::Included(lo), Bound::Included(hi)))
    }

    /// `column IN (values)`
    pub fn one_of(column: &str, values: impl IntoIterator<Item = f64>) -> QExpr {
        QExpr::Discrete(DiscreteRange::new(column, values))
    }

    /// `column == "value"`
    pub fn string_eq(column: &str, value: &str) -> QExpr {
        QExpr::StringEq(StringEq { column: column.to_string(), value: value.to_string() })
    }

    /// `NOT (self AND other)`
    pub fn nand(self, other: QExpr) -> QExpr {
        !(self & other)
    }

    /// `NOT (self OR other)`
    pub fn nor(self, other: QExpr) -> QExpr {
        !(self | other)
    }

    /// Names of the referenced columns, in order of first appearance.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.into_iter().unique_by(|c| c.to_ascii_lowercase()).collect()
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            QExpr::And(l, r) | QExpr::Or(l, r) | QExpr::Xor(l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
            QExpr::Not(e) => e.collect_columns(out),
            QExpr::Range(r) => out.push(&r.column),
            QExpr::Discrete(d) => out.push(&d.column),
            QExpr::StringEq(s) => out.push(&s.column),
        }
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        match self {
            QExpr::And(l, r) | QExpr::Or(l, r) | QExpr::Xor(l, r) => 1 + l.node_count() + r.node_count(),
            QExpr::Not(e) => 1 + e.node_count(),
            _ => 1,
        }
    }
}

impl BitAnd for QExpr {
    type Output = QExpr;
    fn bitand(self, rhs: QExpr) -> QExpr {
        QExpr::And(Box::new(self), Box::new(rhs))
    }
}

impl BitOr for QExpr {
    type Output = QExpr;
    fn bitor(self, rhs: QExpr) -> QExpr {
        QExpr::Or(Box::new(self), Box::new(rhs))
    }
}

impl BitXor for QExpr {
    type Output = QExpr;
    fn bitxor(self, rhs: QExpr) -> QExpr {
        QExpr::Xor(Box::new(self), Box::new(rhs))
    }
}

impl Not for QExpr {
    type Output = QExpr;
    fn not(self) -> QExpr {
        QExpr::Not(Box::new(self))
    }
}

fn quote(s: &str) -> String {
    if s.contains('"') {
        format!("'{s}'")
    } else {
        format!("\"{s}\"")
    }
}

impl fmt::Display for QExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QExpr::And(l, r) => write!(f, "({l} AND {r})"),
            QExpr::Or(l, r) => write!(f, "({l} OR {r})"),
            QExpr::Xor(l, r) => write!(f, "({l} XOR {r})"),
            QExpr::Not(e) => write!(f, "NOT ({e})"),
            QExpr::Range(r) => write!(f, "{r}"),
            QExpr::Discrete(d) => write!(f, "{} IN ({})", d.column, d.values.iter().map(|&v| Literal(v)).join(", ")),
            QExpr::StringEq(s) => write!(f, "{} == {}", s.column, quote(&s.value)),
        }
    }
}

impl FromStr for QExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<QExpr> {
        parse_where_clause(s)
    }
}

// ---------------------------------------------------------------
// tokenizer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Number(f64),
    Str(String),
    Op(CompareOp),
    And,
    Or,
    Xor,
    Not,
    Between,
    In,
    LParen,
    RParen,
    Comma,
}

fn is_name_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic()
}

fn is_name_char(c: char) -> bool {
    c == '_' || c == '.' || c == ':' || c.is_ascii_alphanumeric()
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>> {
    let err = |pos: usize, msg: &str| Error::Parse { pos, msg: msg.to_string() };
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let token = match c {
            '(' => {
                chars.next();
                Token::LParen
            }
            ')' => {
                chars.next();
                Token::RParen
            }
            ',' => {
                chars.next();
                Token::Comma
            }
            '<' | '>' | '=' | '!' => {
                chars.next();
                let next = chars.peek().map(|&(_, c)| c);
                let (op, two) = match (c, next) {
                    ('<', Some('=')) => (CompareOp::Le, true),
                    ('<', Some('>')) => (CompareOp::Ne, true),
                    ('<', _) => (CompareOp::Lt, false),
                    ('>', Some('=')) => (CompareOp::Ge, true),
                    ('>', _) => (CompareOp::Gt, false),
                    ('=', Some('=')) => (CompareOp::Eq, true),
                    ('=', _) => (CompareOp::Eq, false),
                    ('!', Some('=')) => (CompareOp::Ne, true),
                    _ => return Err(err(pos, "expected '=' after '!'")),
                };
                if two {
                    chars.next();
                }
                Token::Op(op)
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, ch)) => text.push(ch),
                        None => return Err(err(pos, "unterminated string literal")),
                    }
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' => {
                let mut end = pos;
                let mut prev = ' ';
                while let Some(&(i, ch)) = chars.peek() {
                    let sign_ok = (ch == '-' || ch == '+') && (i == pos || prev == 'e' || prev == 'E');
                    if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || sign_ok {
                        prev = ch;
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &src[pos..end];
                let value: f64 = text
                    .parse()
                    .map_err(|_| err(pos, &format!("malformed number {text:?}")))?;
                Token::Number(value)
            }
            c if is_name_start(c) => {
                let mut end = pos;
                while let Some(&(i, ch)) = chars.peek() {
                    if is_name_char(ch) {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &src[pos..end];
                match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "XOR" => Token::Xor,
                    "NOT" => Token::Not,
                    "BETWEEN" => Token::Between,
                    "IN" => Token::In,
                    _ => Token::Name(word.to_string()),
                }
            }
            _ => return Err(err(pos, &format!("unexpected character {c:?}"))),
        };
        tokens.push((pos, token));
    }
    Ok(tokens)
}

// ---------------------------------------------------------------
// recursive descent

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, t)| t)
    }

    fn pos(&self) -> usize {
        self.tokens.get(self.cursor).map_or(self.end, |(p, _)| *p)
    }

    fn error(&self, msg: impl Into<String>) -> Error {
        Error::Parse { pos: self.pos(), msg: msg.into() }
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.cursor).map(|(_, t)| t.clone());
        self.cursor += 1;
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn number(&mut self) -> Result<f64> {
        match self.peek() {
            Some(Token::Number(v)) => {
                let v = *v;
                self.cursor += 1;
                Ok(v)
            }
            _ => Err(self.error("expected a number")),
        }
    }

    fn expr(&mut self) -> Result<QExpr> {
        let mut e = self.xor_expr()?;
        while self.eat(&Token::Or) {
            e = e | self.xor_expr()?;
        }
        Ok(e)
    }

    fn xor_expr(&mut self) -> Result<QExpr> {
        let mut e = self.and_expr()?;
        while self.eat(&Token::Xor) {
            e = e ^ self.and_expr()?;
        }
        Ok(e)
    }

    fn and_expr(&mut self) -> Result<QExpr> {
        let mut e = self.unary()?;
        while self.eat(&Token::And) {
            e = e & self.unary()?;
        }
        Ok(e)
    }

    fn unary(&mut self) -> Result<QExpr> {
        if self.eat(&Token::Not) {
            return Ok(!self.unary()?);
        }
        if self.eat(&Token::LParen) {
            let e = self.expr()?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(e);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<QExpr> {
        match self.next() {
            Some(Token::Name(column)) => self.name_first(&column),
            Some(Token::Number(v)) => self.number_first(v),
            Some(t) => {
                self.cursor -= 1;
                Err(self.error(format!("unexpected {t:?}")))
            }
            None => Err(self.error("unexpected end of clause")),
        }
    }

    fn name_first(&mut self, column: &str) -> Result<QExpr> {
        let negated = self.eat(&Token::Not);
        match self.next() {
            Some(Token::Between) => {
                let lo = self.number()?;
                self.expect(&Token::And, "AND in BETWEEN")?;
                let hi = self.number()?;
                let e = QExpr::between(column, lo, hi);
                Ok(if negated { !e } else { e })
            }
            Some(Token::In) => {
                let e = self.in_list(column)?;
                Ok(if negated { !e } else { e })
            }
            Some(Token::Op(op)) if !negated => match self.next() {
                Some(Token::Number(v)) => Ok(QExpr::compare(column, op, v)),
                Some(Token::Str(s)) => match op {
                    CompareOp::Eq => Ok(QExpr::string_eq(column, &s)),
                    CompareOp::Ne => Ok(!QExpr::string_eq(column, &s)),
                    _ => {
                        self.cursor -= 1;
                        Err(self.error("strings only support equality"))
                    }
                },
                _ => {
                    self.cursor -= 1;
                    Err(self.error("expected a literal"))
                }
            },
            _ => {
                self.cursor -= 1;
                Err(self.error(format!("expected an operator after {column}")))
            }
        }
    }

    fn in_list(&mut self, column: &str) -> Result<QExpr> {
        self.expect(&Token::LParen, "'(' after IN")?;
        let mut numbers = Vec::new();
        let mut strings = Vec::new();
        loop {
            match self.next() {
                Some(Token::Number(v)) => numbers.push(v),
                Some(Token::Str(s)) => strings.push(s),
                _ => {
                    self.cursor -= 1;
                    return Err(self.error("expected a literal in IN list"));
                }
            }
            if self.eat(&Token::RParen) {
                break;
            }
            self.expect(&Token::Comma, "',' or ')'")?;
        }
        if !numbers.is_empty() && !strings.is_empty() {
            return Err(self.error("IN list mixes numbers and strings"));
        }
        if numbers.is_empty() {
            strings
                .iter()
                .map(|s| QExpr::string_eq(column, s))
                .reduce(|a, b| a | b)
                .ok_or_else(|| self.error("empty IN list"))
        } else {
            Ok(QExpr::one_of(column, numbers))
        }
    }

    /// `5 < a` or `2 < a <= 7`
    fn number_first(&mut self, first: f64) -> Result<QExpr> {
        let Some(Token::Op(op1)) = self.next() else {
            self.cursor -= 1;
            return Err(self.error("expected an operator"));
        };
        let Some(Token::Name(column)) = self.next() else {
            self.cursor -= 1;
            return Err(self.error("expected a column name"));
        };
        let Some(Token::Op(op2)) = self.peek().cloned() else {
            return Ok(QExpr::compare(&column, op1.mirrored(), first));
        };
        self.cursor += 1;
        let second = self.number()?;
        let bound = |op: CompareOp, v: f64| match op {
            CompareOp::Lt | CompareOp::Gt => Some(Bound::Excluded(v)),
            CompareOp::Le | CompareOp::Ge => Some(Bound::Included(v)),
            _ => None,
        };
        let ascending = matches!(op1, CompareOp::Lt | CompareOp::Le) && matches!(op2, CompareOp::Lt | CompareOp::Le);
        let descending = matches!(op1, CompareOp::Gt | CompareOp::Ge) && matches!(op2, CompareOp::Gt | CompareOp::Ge);
        let range = match (ascending, descending, bound(op1, first), bound(op2, second)) {
            (true, _, Some(lo), Some(hi)) => ContinuousRange::new(&column, lo, hi),
            (_, true, Some(hi), Some(lo)) => ContinuousRange::new(&column, lo, hi),
            _ => return Err(self.error("both operators of a compound range must point the same way")),
        };
        Ok(QExpr::Range(range))
    }
}

/// Parses a where-clause into an expression tree.
pub fn parse_where_clause(clause: &str) -> Result<QExpr> {
    let tokens = tokenize(clause)?;
    if tokens.is_empty() {
        return Err(Error::Parse { pos: 0, msg: "empty clause".to_string() });
    }
    let mut parser = Parser { tokens, cursor: 0, end: clause.len() };
    let e = parser.expr()?;
    if parser.cursor < parser.tokens.len() {
        return Err(parser.error("trailing input"));
    }
    Ok(e)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn range(e: &QExpr) -> &ContinuousRange {
        match e {
            QExpr::Range(r) => r,
            other => panic!("not a range: {other:?}"),
        }
    }

    mod build {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_ne_becomes_not_eq() {
            let e = QExpr::compare("a", CompareOp::Ne, 5.0);
            assert_eq!(e, !QExpr::compare("a", CompareOp::Eq, 5.0));
        }

        #[test]
        fn test_nand_nor() {
            let a = QExpr::compare("a", CompareOp::Lt, 1.0);
            let b = QExpr::compare("b", CompareOp::Gt, 2.0);
            assert_eq!(a.clone().nand(b.clone()), !(a.clone() & b.clone()));
            assert_eq!(a.clone().nor(b.clone()), !(a | b));
        }

        #[test]
        fn test_range_membership() {
            let r = ContinuousRange::compare("a", CompareOp::Le, 3.0).unwrap();
            assert!(r.contains(3.0));
            assert!(!r.contains(3.5));
            assert!(!r.contains(f64::NAN));
            assert!(ContinuousRange::new("a", Bound::Excluded(1.0), Bound::Excluded(1.0)).is_empty());
            assert!(!ContinuousRange::new("a", Bound::Included(1.0), Bound::Included(1.0)).is_empty());
        }

        #[test]
        fn test_discrete_sorted() {
            let d = DiscreteRange::new("a", vec![3.0, 1.0, 3.0, f64::NAN]);
            assert_eq!(d.values, vec![1.0, 3.0]);
            assert!(d.contains(3.0));
            assert!(!d.contains(2.0));
        }
    }

    mod parse {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_simple() {
            let e: QExpr = "a == 5".parse().unwrap();
            assert_eq!(e, QExpr::compare("a", CompareOp::Eq, 5.0));
            let e: QExpr = "a != 5".parse().unwrap();
            assert_eq!(e, QExpr::compare("a", CompareOp::Ne, 5.0));
            let e: QExpr = "a <> -2.5e1".parse().unwrap();
            assert_eq!(e, QExpr::compare("a", CompareOp::Ne, -25.0));
        }

        #[test]
        fn test_mirrored_and_compound() {
            let e: QExpr = "5 < temp".parse().unwrap();
            assert_eq!(range(&e).lower, Bound::Excluded(5.0));
            assert_eq!(range(&e).upper, Bound::Unbounded);

            let e: QExpr = "2 < temp <= 7".parse().unwrap();
            assert_eq!(range(&e).lower, Bound::Excluded(2.0));
            assert_eq!(range(&e).upper, Bound::Included(7.0));

            let e: QExpr = "7 >= temp > 2".parse().unwrap();
            assert_eq!(range(&e).lower, Bound::Excluded(2.0));
            assert_eq!(range(&e).upper, Bound::Included(7.0));

            assert!("2 < temp > 7".parse::<QExpr>().is_err());
        }

        #[test]
        fn test_precedence() {
            let e: QExpr = "a < 1 OR b < 2 AND c < 3".parse().unwrap();
            match e {
                QExpr::Or(_, r) => assert!(matches!(*r, QExpr::And(..))),
                other => panic!("{other:?}"),
            }
            let e: QExpr = "(a < 1 OR b < 2) AND c < 3".parse().unwrap();
            assert!(matches!(e, QExpr::And(..)));
        }

        #[test]
        fn test_between_in_strings() {
            let e: QExpr = "x BETWEEN 1 AND 4 AND y NOT IN (3, 1)".parse().unwrap();
            let QExpr::And(l, r) = e else { panic!() };
            assert_eq!(*l, QExpr::between("x", 1.0, 4.0));
            assert_eq!(*r, !QExpr::one_of("y", [1.0, 3.0]));

            let e: QExpr = "name = 'abc'".parse().unwrap();
            assert_eq!(e, QExpr::string_eq("name", "abc"));
            let e: QExpr = "name IN ('a', \"b\")".parse().unwrap();
            assert_eq!(e, QExpr::string_eq("name", "a") | QExpr::string_eq("name", "b"));
        }

        #[test]
        fn test_keywords_case_insensitive() {
            let e: QExpr = "a < 1 and not b > 2 xor c == 3".parse().unwrap();
            assert!(matches!(e, QExpr::Xor(..)));
            assert_eq!(e.columns(), vec!["a", "b", "c"]);
        }

        #[test]
        fn test_display_reparses() {
            for clause in [
                "a < 1 OR 2 < b <= 7.5",
                "NOT (x IN (1, 2, 3)) AND s == 'q'",
                "p.q:r >= -4 XOR p.q:r != 0",
            ] {
                let e: QExpr = clause.parse().unwrap();
                let again: QExpr = e.to_string().parse().unwrap();
                assert_eq!(e, again, "{clause}");
            }
        }

        #[test]
        fn test_display_reparses_infinite_bounds() {
            let everything = QExpr::Range(ContinuousRange::new("a", Bound::Unbounded, Bound::Unbounded));
            let open = QExpr::Range(ContinuousRange::new(
                "a",
                Bound::Excluded(f64::NEG_INFINITY),
                Bound::Excluded(f64::INFINITY),
            ));
            let set = QExpr::one_of("a", [f64::INFINITY, 1.0]);
            for e in [everything.clone(), open, set] {
                let again: QExpr = e.to_string().parse().unwrap();
                assert_eq!(e, again, "{e}");
            }
            assert_eq!(everything.to_string(), "a >= -1e999");

            // closed infinite ends are the same as missing ones
            let e: QExpr = "a <= 1e999".parse().unwrap();
            assert_eq!(e, everything);
        }

        #[test]
        fn test_errors_carry_position() {
            for (clause, pos) in [("a < ", 4), ("a ? 3", 2), ("a < 3 AND", 9), ("(a < 3", 6), ("a < 'x'", 4), ("", 0)] {
                match clause.parse::<QExpr>() {
                    Err(Error::Parse { pos: p, .. }) => assert_eq!(p, pos, "{clause}"),
                    other => panic!("{clause}: {other:?}"),
                }
            }
        }
    }
}
