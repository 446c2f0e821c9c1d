//! # Comparer Engine
//!
//! Pure relational predicates between a value taken from a response and the
//! value a test case expects.
//!
//! Response bodies are schema-less JSON, so every predicate dispatches on the
//! runtime shape of the *actual* value:
//!
//! | actual vs expected      | rule                                        |
//! |-------------------------|---------------------------------------------|
//! | string vs string        | lexicographic                               |
//! | number vs number        | IEEE-754 double ordering                    |
//! | timestamp vs timestamp  | chronological                               |
//! | array vs anything       | holds if it holds for *any* element         |
//! | anything else           | `false`                                     |
//!
//! The array rule recurses, so `[[1, 2], [3]] gt 2` holds. There is no
//! implicit coercion: `"5" lt 6` is `false`.
//!
//! ```text
//! compare(Operator::Gt, [1, 7, 3], 5)   == true   // 7 > 5
//! compare(Operator::Lt, "abc", "abd")   == true
//! compare(Operator::Lt, "1", 2)         == false  // type mismatch
//! ```

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// OPERATORS
// ============================================================================

/// Closed set of comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = "<=", alias = "lte")]
    Le,
    #[serde(alias = ">=", alias = "gte")]
    Ge,
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=", alias = "neq")]
    Ne,
    Contains,
    Matches,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Ge => "ge",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Contains => "contains",
            Self::Matches => "matches",
        };
        f.write_str(s)
    }
}

/// How string values should be interpreted before comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    Auto,
    /// RFC3339 strings become timestamps.
    Timestamp,
}

// ============================================================================
// DYNAMIC VALUES
// ============================================================================

/// Runtime shape of a value taking part in a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Datum>),
    Object(Value),
}

impl Datum {
    /// Converts a JSON value, applying `kind` to strings at any depth.
    ///
    /// Strings that do not parse as timestamps stay strings and therefore
    /// fail closed against a timestamp expectation.
    pub fn from_json(value: &Value, kind: ValueKind) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Null),
            Value::String(s) => match kind {
                ValueKind::Timestamp => parse_timestamp(s)
                    .map(Self::Timestamp)
                    .unwrap_or_else(|| Self::String(s.clone())),
                ValueKind::Auto => Self::String(s.clone()),
            },
            Value::Array(items) => {
                Self::Array(items.iter().map(|i| Self::from_json(i, kind)).collect())
            }
            Value::Object(_) => Self::Object(value.clone()),
        }
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Evaluates `actual <op> expected`. Never panics; incomparable values yield `false`.
pub fn compare(op: Operator, actual: &Datum, expected: &Datum) -> bool {
    // Existential descent: one matching element is enough.
    if let Datum::Array(items) = actual {
        return items.iter().any(|item| compare(op, item, expected));
    }

    match op {
        Operator::Lt => lt(actual, expected),
        Operator::Gt => gt(actual, expected),
        Operator::Le => le(actual, expected),
        Operator::Ge => ge(actual, expected),
        Operator::Eq => eq(actual, expected),
        Operator::Ne => ne(actual, expected),
        Operator::Contains => contains(actual, expected),
        Operator::Matches => matches(actual, expected),
    }
}

/// Convenience wrapper over raw JSON values.
pub fn compare_json(op: Operator, actual: &Value, expected: &Value, kind: ValueKind) -> bool {
    compare(
        op,
        &Datum::from_json(actual, kind),
        &Datum::from_json(expected, kind),
    )
}

// ============================================================================
// PREDICATES
// ============================================================================

/// Ordering between two scalars of the same runtime type.
fn order(actual: &Datum, expected: &Datum) -> Option<Ordering> {
    match (actual, expected) {
        (Datum::String(a), Datum::String(b)) => Some(a.cmp(b)),
        (Datum::Number(a), Datum::Number(b)) => a.partial_cmp(b),
        (Datum::Timestamp(a), Datum::Timestamp(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality between two values of the same runtime type.
fn same_type_eq(actual: &Datum, expected: &Datum) -> Option<bool> {
    match (actual, expected) {
        (Datum::Null, Datum::Null) => Some(true),
        (Datum::Bool(a), Datum::Bool(b)) => Some(a == b),
        (Datum::Object(a), Datum::Object(b)) => Some(a == b),
        _ => order(actual, expected).map(|o| o == Ordering::Equal),
    }
}

fn lt(actual: &Datum, expected: &Datum) -> bool {
    matches!(order(actual, expected), Some(Ordering::Less))
}

fn gt(actual: &Datum, expected: &Datum) -> bool {
    matches!(order(actual, expected), Some(Ordering::Greater))
}

fn le(actual: &Datum, expected: &Datum) -> bool {
    matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal))
}

fn ge(actual: &Datum, expected: &Datum) -> bool {
    matches!(order(actual, expected), Some(Ordering::Greater | Ordering::Equal))
}

fn eq(actual: &Datum, expected: &Datum) -> bool {
    same_type_eq(actual, expected) == Some(true)
}

fn ne(actual: &Datum, expected: &Datum) -> bool {
    same_type_eq(actual, expected) == Some(false)
}

fn contains(actual: &Datum, expected: &Datum) -> bool {
    match (actual, expected) {
        (Datum::String(haystack), Datum::String(needle)) => haystack.contains(needle.as_str()),
        _ => false,
    }
}

fn matches(actual: &Datum, expected: &Datum) -> bool {
    match (actual, expected) {
        (Datum::String(text), Datum::String(pattern)) => Regex::new(pattern)
            .map(|re| re.is_match(text))
            .unwrap_or(false),
        _ => false,
    }
}
