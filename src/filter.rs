//! # Filter expressions
//!
//! Boolean expressions over named fields. The grammar lives in
//! `filter.pest`: terms are `field op value` with op one of `inlist`, `is`,
//! `==`, `!=`, `contains`, `regexp`, combined with `and`, `or`, `not` and
//! parentheses.
//!
//! Evaluation is three-valued: a term on a field the caller cannot answer
//! evaluates to [`Truth::Unknown`], which never excludes on its own.

use std::fmt;

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter expression: {0}")]
    Syntax(String),
    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Answers field lookups for one subject (a plugin, an event).
pub trait FieldSource {
    /// Values of `field`, or `None` when the field is unknown for this subject.
    fn field_values(&self, field: &str) -> Option<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    fn from_bool(value: bool) -> Truth {
        if value { Truth::True } else { Truth::False }
    }
}

#[derive(Debug, Clone)]
enum Op {
    InList(Vec<String>),
    Is(String),
    Equals(String),
    NotEquals(String),
    Contains(String),
    Regexp(Regex),
}

impl Op {
    fn test(&self, values: &[String]) -> bool {
        match self {
            Op::InList(list) => values
                .iter()
                .any(|v| list.iter().any(|item| item.eq_ignore_ascii_case(v))),
            Op::Is(expected) => values.iter().any(|v| v.eq_ignore_ascii_case(expected)),
            Op::Equals(expected) => values.iter().any(|v| v == expected),
            Op::NotEquals(expected) => values.iter().all(|v| v != expected),
            Op::Contains(needle) => {
                let needle = needle.to_lowercase();
                values.iter().any(|v| v.to_lowercase().contains(&needle))
            }
            Op::Regexp(regex) => values.iter().any(|v| regex.is_match(v)),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Term { field: String, op: Op },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    fn evaluate(&self, source: &dyn FieldSource) -> Truth {
        match self {
            Expr::Term { field, op } => match source.field_values(field) {
                Some(values) => Truth::from_bool(op.test(&values)),
                None => Truth::Unknown,
            },
            Expr::And(lhs, rhs) => lhs.evaluate(source).and(rhs.evaluate(source)),
            Expr::Or(lhs, rhs) => lhs.evaluate(source).or(rhs.evaluate(source)),
            Expr::Not(inner) => inner.evaluate(source).not(),
        }
    }

    fn mentions(&self, name: &str) -> bool {
        match self {
            Expr::Term { field, .. } => field.eq_ignore_ascii_case(name),
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => lhs.mentions(name) || rhs.mentions(name),
            Expr::Not(inner) => inner.mentions(name),
        }
    }
}

/// A parsed filter expression. The empty expression matches everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    source: String,
    expr: Option<Expr>,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let root = FilterParser::parse(Rule::filter, trimmed)
            .map_err(|e| FilterError::Syntax(e.to_string()))?
            .next()
            .ok_or_else(|| FilterError::Syntax("empty parse".to_string()))?;
        let or_expr = root
            .into_inner()
            .find(|p| p.as_rule() == Rule::or_expr)
            .ok_or_else(|| FilterError::Syntax("missing expression".to_string()))?;
        let expr = build_or(or_expr)?;
        Ok(Self {
            source: trimmed.to_string(),
            expr: Some(expr),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn mentions_field(&self, field: &str) -> bool {
        self.expr.as_ref().is_some_and(|expr| expr.mentions(field))
    }

    pub fn evaluate(&self, source: &dyn FieldSource) -> Truth {
        match &self.expr {
            Some(expr) => expr.evaluate(source),
            None => Truth::True,
        }
    }

    /// True unless the expression is definitely false for `source`.
    pub fn admits(&self, source: &dyn FieldSource) -> bool {
        self.evaluate(source) != Truth::False
    }

    /// Restrict to plugins carrying `preset`, keeping the current expression
    /// as a further condition.
    pub fn with_parser_preset(&self, preset: &str) -> Result<Self, FilterError> {
        if self.is_empty() {
            Self::parse(&format!("parser inlist \"{preset}\""))
        } else {
            Self::parse(&format!("parser inlist \"{preset}\" and ({})", self.source))
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Parser)]
#[grammar = "filter.pest"]
struct FilterParser;

fn syntax(pair: &Pair<'_, Rule>, message: &str) -> FilterError {
    FilterError::Syntax(format!("{message} at {:?}", pair.as_str()))
}

fn build_or(pair: Pair<'_, Rule>) -> Result<Expr, FilterError> {
    let mut operands = pair.into_inner().filter(|p| p.as_rule() != Rule::or_op);
    let first = operands
        .next()
        .ok_or_else(|| FilterError::Syntax("empty expression".to_string()))?;
    operands.try_fold(build_and(first)?, |lhs, rhs| {
        Ok(Expr::Or(Box::new(lhs), Box::new(build_and(rhs)?)))
    })
}

fn build_and(pair: Pair<'_, Rule>) -> Result<Expr, FilterError> {
    let mut operands = pair.into_inner().filter(|p| p.as_rule() != Rule::and_op);
    let first = operands
        .next()
        .ok_or_else(|| FilterError::Syntax("empty conjunction".to_string()))?;
    operands.try_fold(build_not(first)?, |lhs, rhs| {
        Ok(Expr::And(Box::new(lhs), Box::new(build_not(rhs)?)))
    })
}

fn build_not(pair: Pair<'_, Rule>) -> Result<Expr, FilterError> {
    let mut negations = 0usize;
    for inner in pair.clone().into_inner() {
        match inner.as_rule() {
            Rule::not_op => negations += 1,
            Rule::or_expr => return Ok(negate(build_or(inner)?, negations)),
            Rule::term => return Ok(negate(build_term(inner)?, negations)),
            _ => return Err(syntax(&inner, "unexpected operand")),
        }
    }
    Err(syntax(&pair, "missing operand"))
}

fn negate(expr: Expr, times: usize) -> Expr {
    (0..times).fold(expr, |expr, _| Expr::Not(Box::new(expr)))
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

fn build_term(pair: Pair<'_, Rule>) -> Result<Expr, FilterError> {
    let mut inner = pair.clone().into_inner();
    let (Some(field), Some(op), Some(value)) = (inner.next(), inner.next(), inner.next()) else {
        return Err(syntax(&pair, "incomplete term"));
    };
    let value = match value.as_rule() {
        Rule::quoted => value
            .into_inner()
            .next()
            .map(|text| unescape(text.as_str()))
            .unwrap_or_default(),
        _ => value.as_str().to_string(),
    };
    let op = match op.as_str().to_ascii_lowercase().as_str() {
        "inlist" => Op::InList(
            value
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect(),
        ),
        "is" => Op::Is(value),
        "==" => Op::Equals(value),
        "!=" => Op::NotEquals(value),
        "contains" => Op::Contains(value),
        "regexp" => Op::Regexp(Regex::new(&value).map_err(|source| {
            FilterError::InvalidRegex {
                pattern: value.clone(),
                source,
            }
        })?),
        _ => return Err(syntax(&op, "unknown operator")),
    };
    Ok(Expr::Term {
        field: field.as_str().to_string(),
        op,
    })
}
