// In-memory filter evaluator, used by the memory entity store and by populate
// filtering.

use serde_json::{Map, Value};

use crate::ast::{Comparison, FilterNode};
use crate::compare::{as_text, compare_values, values_equal};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("type error: {0}")]
    TypeError(String),
    #[error("unsupported expression: {0}")]
    Unsupported(String),
    #[error("cannot resolve `{attribute}`: {reason}")]
    Resolve { attribute: String, reason: String },
}

/// Rows reached through a nested attribute, together with the scope to evaluate
/// them in.
pub struct NestedRows<'a> {
    pub rows: Vec<Map<String, Value>>,
    pub scope: Box<dyn Scope + 'a>,
}

/// Knows how to follow an attribute of a row to other rows (relations, components).
pub trait Scope {
    /// Returns `None` when `attribute` is not a link, in which case the raw JSON value
    /// of the attribute is used.
    fn nested(&self, attribute: &str, row: &Map<String, Value>)
        -> Result<Option<NestedRows<'_>>, EvalError>;
}

/// Scope for plain JSON: nothing is a link.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonScope;

impl Scope for JsonScope {
    fn nested(&self, _: &str, _: &Map<String, Value>) -> Result<Option<NestedRows<'_>>, EvalError> {
        Ok(None)
    }
}

fn json_rows(value: Option<&Value>) -> Vec<Map<String, Value>> {
    match value {
        Some(Value::Object(map)) => vec![map.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_object().cloned()).collect(),
        _ => Vec::new(),
    }
}

fn follow<'s>(
    scope: &'s dyn Scope,
    attribute: &str,
    row: &Map<String, Value>,
) -> Result<NestedRows<'s>, EvalError> {
    match scope.nested(attribute, row)? {
        Some(nested) => Ok(nested),
        None => Ok(NestedRows {
            rows: json_rows(row.get(attribute)),
            scope: Box::new(JsonScope),
        }),
    }
}

pub fn eval_filter(
    node: &FilterNode,
    row: &Map<String, Value>,
    scope: &dyn Scope,
) -> Result<bool, EvalError> {
    match node {
        FilterNode::And(nodes) => {
            for node in nodes {
                if !eval_filter(node, row, scope)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterNode::Or(nodes) => {
            for node in nodes {
                if eval_filter(node, row, scope)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterNode::Not(inner) => Ok(!eval_filter(inner, row, scope)?),
        FilterNode::Field { field, op } => {
            let value = row.get(field).unwrap_or(&Value::Null);
            eval_comparison(op, value)
        }
        FilterNode::Nested { attribute, node } => {
            let nested = follow(scope, attribute, row)?;
            for nested_row in &nested.rows {
                if eval_filter(node, nested_row, nested.scope.as_ref())? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn eval_comparison(op: &Comparison, value: &Value) -> Result<bool, EvalError> {
    // Arrays of scalars match when any element matches.
    if let Value::Array(items) = value {
        if !matches!(op, Comparison::Null | Comparison::NotNull) {
            for item in items {
                if eval_comparison(op, item)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
    }

    let text_op = |pattern: &str, test: fn(&str, &str) -> bool, insensitive: bool| {
        as_text(value).is_some_and(|text| {
            if insensitive {
                test(&text.to_lowercase(), &pattern.to_lowercase())
            } else {
                test(&text, pattern)
            }
        })
    };

    Ok(match op {
        Comparison::Eq(expected) => values_equal(value, expected),
        Comparison::Ne(expected) => !values_equal(value, expected),
        Comparison::In(options) => options.iter().any(|o| values_equal(value, o)),
        Comparison::NotIn(options) => !options.iter().any(|o| values_equal(value, o)),
        Comparison::Lt(bound) => compare_values(value, bound).is_some_and(|o| o.is_lt()),
        Comparison::Lte(bound) => compare_values(value, bound).is_some_and(|o| o.is_le()),
        Comparison::Gt(bound) => compare_values(value, bound).is_some_and(|o| o.is_gt()),
        Comparison::Gte(bound) => compare_values(value, bound).is_some_and(|o| o.is_ge()),
        Comparison::Null => is_null(value),
        Comparison::NotNull => !is_null(value),
        Comparison::Contains(p) => text_op(p, |t, p| t.contains(p), false),
        Comparison::ContainsInsensitive(p) => text_op(p, |t, p| t.contains(p), true),
        Comparison::NotContains(p) => !text_op(p, |t, p| t.contains(p), false),
        Comparison::StartsWith(p) => text_op(p, |t, p| t.starts_with(p), false),
        Comparison::EndsWith(p) => text_op(p, |t, p| t.ends_with(p), false),
    })
}

fn is_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Value at a dotted path, following links through `scope`. Multi-valued links use
/// their first row.
pub fn value_at_path(
    path: &[String],
    row: &Map<String, Value>,
    scope: &dyn Scope,
) -> Result<Value, EvalError> {
    match path {
        [] => Err(EvalError::TypeError("empty attribute path".into())),
        [field] => Ok(row.get(field).cloned().unwrap_or(Value::Null)),
        [attribute, rest @ ..] => {
            let nested = follow(scope, attribute, row)?;
            match nested.rows.first() {
                Some(first) => value_at_path(rest, first, nested.scope.as_ref()),
                None => {
                    tracing::trace!(attribute = %attribute, "sort path resolved to no rows");
                    Ok(Value::Null)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn eval_simple_eq() {
        let node = FilterNode::eq("title", "post");
        assert!(eval_filter(&node, &row(json!({"title": "post"})), &JsonScope).unwrap());
        assert!(!eval_filter(&node, &row(json!({"title": "page"})), &JsonScope).unwrap());
    }

    #[test]
    fn eval_and_or_not() {
        let doc = row(json!({"title": "post", "views": 10}));
        let node = FilterNode::And(vec![
            FilterNode::eq("title", "post"),
            FilterNode::Or(vec![
                FilterNode::field("views", Comparison::Gt(json!(50))),
                FilterNode::Not(Box::new(FilterNode::field("views", Comparison::Lt(json!(5))))),
            ]),
        ]);
        assert!(eval_filter(&node, &doc, &JsonScope).unwrap());
    }

    #[test]
    fn eval_null_checks() {
        let draft = row(json!({"publishedAt": null}));
        let missing = row(json!({}));
        let published = row(json!({"publishedAt": "2024-02-16T00:00:00Z"}));
        let node = FilterNode::is_null("publishedAt");
        assert!(eval_filter(&node, &draft, &JsonScope).unwrap());
        assert!(eval_filter(&node, &missing, &JsonScope).unwrap());
        assert!(!eval_filter(&node, &published, &JsonScope).unwrap());
    }

    #[test]
    fn eval_nested_json_object() {
        let doc = row(json!({"seo": {"meta": {"title": "Hi"}}}));
        let title = FilterNode::eq("title", "Hi");
        let node = FilterNode::nested("seo", FilterNode::nested("meta", title));
        assert!(eval_filter(&node, &doc, &JsonScope).unwrap());
    }

    #[test]
    fn eval_text_operators() {
        let doc = row(json!({"name": "Skate-En"}));
        let contains = FilterNode::field("name", Comparison::ContainsInsensitive("skate".into()));
        let starts = FilterNode::field("name", Comparison::StartsWith("Sk".into()));
        let ends = FilterNode::field("name", Comparison::EndsWith("-Es".into()));
        assert!(eval_filter(&contains, &doc, &JsonScope).unwrap());
        assert!(eval_filter(&starts, &doc, &JsonScope).unwrap());
        assert!(!eval_filter(&ends, &doc, &JsonScope).unwrap());
    }

    #[test]
    fn eval_in_against_array_value() {
        let doc = row(json!({"tags": ["a", "b"]}));
        let node = FilterNode::is_in("tags", vec![json!("b")]);
        assert!(eval_filter(&node, &doc, &JsonScope).unwrap());
    }

    #[test]
    fn path_lookup_through_json() {
        let doc = row(json!({"author": {"name": "Ada"}}));
        let value = value_at_path(&["author".into(), "name".into()], &doc, &JsonScope).unwrap();
        assert_eq!(value, json!("Ada"));
    }
}
