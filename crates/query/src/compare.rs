// Value comparison helpers shared by the filter evaluator and in-memory sorting.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

fn as_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// Loose equality: numbers compare numerically, timestamps by instant.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(a), Value::String(b)) => {
            a == b
                || matches!((as_timestamp(a), as_timestamp(b)), (Some(x), Some(y)) if x == y)
        }
        // Numeric ids are sometimes passed as strings.
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        (a, b) => a == b,
    }
}

/// Partial ordering between two values of compatible types.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => match (as_timestamp(a), as_timestamp(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => Some(a.cmp(b)),
        },
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(n), Value::String(s)) => n.as_f64()?.partial_cmp(&s.parse::<f64>().ok()?),
        (Value::String(s), Value::Number(n)) => s.parse::<f64>().ok()?.partial_cmp(&n.as_f64()?),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total ordering used for sorting. Nulls sort first.
pub fn sort_ordering(left: &Value, right: &Value) -> Ordering {
    compare_values(left, right).unwrap_or_else(|| {
        type_rank(left)
            .cmp(&type_rank(right))
            .then_with(|| left.to_string().cmp(&right.to_string()))
    })
}

/// String view of a value for text operators; `None` for null/structured values.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
