use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::ast::{Comparison, FilterNode, Populate, PopulateEntry, SortField, SortOrder};

/// Parser error types.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("invalid value for {operator}: expected {expected}")]
    InvalidValue {
        operator: String,
        expected: &'static str,
    },
    #[error("expected an object for {0}")]
    ExpectedObject(String),
    #[error("invalid sort order: {0}")]
    InvalidSortOrder(String),
    #[error("invalid fields parameter: {0}")]
    InvalidFields(String),
    #[error("invalid populate parameter: {0}")]
    InvalidPopulate(String),
}

fn is_operator(key: &str) -> bool {
    key.starts_with('$')
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| is_operator(k))
}

/// Parse a `filters` object (`{title: 'x', category: {name: {$eq: 'y'}}, $or: [...]}`).
pub fn parse_filters(input: &Value) -> Result<FilterNode, ParseError> {
    let map = input
        .as_object()
        .ok_or_else(|| ParseError::ExpectedObject("filters".into()))?;

    let mut nodes = Vec::with_capacity(map.len());
    for (key, value) in map {
        let node = match key.as_str() {
            "$and" => FilterNode::And(parse_filter_list(key, value)?),
            "$or" => FilterNode::Or(parse_filter_list(key, value)?),
            "$not" => FilterNode::Not(Box::new(parse_filters(value)?)),
            other if is_operator(other) => {
                return Err(ParseError::UnknownOperator(other.to_string()))
            }
            attribute => parse_attribute(attribute, value)?,
        };
        nodes.push(node);
    }

    Ok(match nodes.len() {
        1 => nodes.remove(0),
        _ => FilterNode::And(nodes),
    })
}

fn parse_filter_list(operator: &str, value: &Value) -> Result<Vec<FilterNode>, ParseError> {
    let items = value.as_array().ok_or_else(|| ParseError::InvalidValue {
        operator: operator.to_string(),
        expected: "an array of filters",
    })?;
    items.iter().map(parse_filters).collect()
}

fn parse_attribute(attribute: &str, value: &Value) -> Result<FilterNode, ParseError> {
    match value {
        Value::Null => Ok(FilterNode::is_null(attribute)),
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            // Several nested shapes, any of which may match.
            let nodes = items
                .iter()
                .map(parse_filters)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FilterNode::nested(attribute, FilterNode::Or(nodes)))
        }
        Value::Array(items) => Ok(FilterNode::is_in(attribute, items.clone())),
        Value::Object(map) if is_operator_object(map) => parse_operators(attribute, map),
        Value::Object(_) => Ok(FilterNode::nested(attribute, parse_filters(value)?)),
        scalar => Ok(FilterNode::eq(attribute, scalar.clone())),
    }
}

fn parse_operators(attribute: &str, map: &Map<String, Value>) -> Result<FilterNode, ParseError> {
    let mut nodes = Vec::with_capacity(map.len());
    for (operator, value) in map {
        let node = match operator.as_str() {
            "$and" | "$or" => {
                let items = value.as_array().ok_or_else(|| ParseError::InvalidValue {
                    operator: operator.clone(),
                    expected: "an array",
                })?;
                let field_level = items
                    .iter()
                    .all(|item| item.as_object().is_some_and(is_operator_object));
                let children = items
                    .iter()
                    .map(|item| {
                        if field_level {
                            parse_attribute(attribute, item)
                        } else {
                            parse_filters(item)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let combined = if operator == "$and" {
                    FilterNode::And(children)
                } else {
                    FilterNode::Or(children)
                };
                if field_level {
                    combined
                } else {
                    FilterNode::nested(attribute, combined)
                }
            }
            "$not" => match value.as_object() {
                Some(inner) if is_operator_object(inner) => {
                    FilterNode::Not(Box::new(parse_operators(attribute, inner)?))
                }
                Some(_) => FilterNode::nested(
                    attribute,
                    FilterNode::Not(Box::new(parse_filters(value)?)),
                ),
                None => FilterNode::Not(Box::new(parse_attribute(attribute, value)?)),
            },
            _ => FilterNode::field(attribute, parse_comparison(operator, value)?),
        };
        nodes.push(node);
    }

    Ok(match nodes.len() {
        1 => nodes.remove(0),
        _ => FilterNode::And(nodes),
    })
}

fn parse_comparison(operator: &str, value: &Value) -> Result<Comparison, ParseError> {
    let string_arg = || {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ParseError::InvalidValue {
                operator: operator.to_string(),
                expected: "a string",
            })
    };
    let list_arg = || match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let bool_arg = || {
        value.as_bool().ok_or_else(|| ParseError::InvalidValue {
            operator: operator.to_string(),
            expected: "a boolean",
        })
    };

    Ok(match operator {
        "$eq" => Comparison::Eq(value.clone()),
        "$ne" => Comparison::Ne(value.clone()),
        "$in" => Comparison::In(list_arg()),
        "$notIn" => Comparison::NotIn(list_arg()),
        "$lt" => Comparison::Lt(value.clone()),
        "$lte" => Comparison::Lte(value.clone()),
        "$gt" => Comparison::Gt(value.clone()),
        "$gte" => Comparison::Gte(value.clone()),
        "$null" => {
            if bool_arg()? {
                Comparison::Null
            } else {
                Comparison::NotNull
            }
        }
        "$notNull" => {
            if bool_arg()? {
                Comparison::NotNull
            } else {
                Comparison::Null
            }
        }
        "$contains" => Comparison::Contains(string_arg()?),
        "$containsi" => Comparison::ContainsInsensitive(string_arg()?),
        "$notContains" => Comparison::NotContains(string_arg()?),
        "$startsWith" => Comparison::StartsWith(string_arg()?),
        "$endsWith" => Comparison::EndsWith(string_arg()?),
        other => return Err(ParseError::UnknownOperator(other.to_string())),
    })
}

/// Parse `sort`: `"title"`, `"title:desc,name"`, `["a", "b:desc"]`,
/// `{title: "asc"}` or `{category: {name: "desc"}}`.
pub fn parse_sort(input: &Value) -> Result<Vec<SortField>, ParseError> {
    let mut out = Vec::new();
    collect_sort(input, &[], &mut out)?;
    Ok(out)
}

fn collect_sort(
    input: &Value,
    prefix: &[String],
    out: &mut Vec<SortField>,
) -> Result<(), ParseError> {
    match input {
        Value::String(s) => {
            for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (path, order) = match part.split_once(':') {
                    Some((path, order)) => (path, parse_order(order)?),
                    None => (part, SortOrder::Asc),
                };
                let mut full = prefix.to_vec();
                full.extend(path.split('.').map(str::to_string));
                out.push(SortField { path: full, order });
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                collect_sort(item, prefix, out)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, value) in map {
                let mut path = prefix.to_vec();
                path.push(key.clone());
                match value {
                    Value::String(order) => out.push(SortField {
                        path,
                        order: parse_order(order)?,
                    }),
                    Value::Object(_) => collect_sort(value, &path, out)?,
                    other => return Err(ParseError::InvalidSortOrder(other.to_string())),
                }
            }
            Ok(())
        }
        other => Err(ParseError::InvalidSortOrder(other.to_string())),
    }
}

fn parse_order(order: &str) -> Result<SortOrder, ParseError> {
    match order.trim().to_ascii_lowercase().as_str() {
        "asc" => Ok(SortOrder::Asc),
        "desc" => Ok(SortOrder::Desc),
        other => Err(ParseError::InvalidSortOrder(other.to_string())),
    }
}

/// Parse `fields`: `"title,name"` or `["title", "name"]`.
pub fn parse_fields(input: &Value) -> Result<Vec<String>, ParseError> {
    match input {
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ParseError::InvalidFields(item.to_string()))
            })
            .collect(),
        other => Err(ParseError::InvalidFields(other.to_string())),
    }
}

/// Parse `populate`: `"*"`, `true`, `"a,b"`, `["a", "a.b"]`, or
/// `{a: true, b: {fields, filters, sort, populate}}`.
pub fn parse_populate(input: &Value) -> Result<Populate, ParseError> {
    match input {
        Value::Bool(true) => Ok(Populate::All),
        Value::Bool(false) | Value::Null => Ok(Populate::None),
        Value::String(s) if s.trim() == "*" => Ok(Populate::All),
        Value::String(s) => {
            let mut map = BTreeMap::new();
            for path in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                insert_dotted(&mut map, path);
            }
            Ok(Populate::Attributes(map))
        }
        Value::Array(items) => {
            let mut map = BTreeMap::new();
            for item in items {
                let path = item
                    .as_str()
                    .ok_or_else(|| ParseError::InvalidPopulate(item.to_string()))?;
                insert_dotted(&mut map, path);
            }
            Ok(Populate::Attributes(map))
        }
        Value::Object(obj) => {
            let mut map = BTreeMap::new();
            for (attribute, value) in obj {
                match value {
                    Value::Bool(false) => {}
                    Value::Bool(true) => {
                        map.insert(attribute.clone(), PopulateEntry::default());
                    }
                    Value::String(s) if s == "*" => {
                        map.insert(
                            attribute.clone(),
                            PopulateEntry {
                                populate: Populate::All,
                                ..PopulateEntry::default()
                            },
                        );
                    }
                    Value::Object(options) => {
                        map.insert(attribute.clone(), parse_populate_entry(options)?);
                    }
                    other => return Err(ParseError::InvalidPopulate(other.to_string())),
                }
            }
            Ok(Populate::Attributes(map))
        }
        other => Err(ParseError::InvalidPopulate(other.to_string())),
    }
}

fn parse_populate_entry(options: &Map<String, Value>) -> Result<PopulateEntry, ParseError> {
    let mut entry = PopulateEntry::default();
    for (key, value) in options {
        match key.as_str() {
            "fields" => entry.fields = Some(parse_fields(value)?),
            "filters" => entry.filters = Some(parse_filters(value)?),
            "sort" => entry.sort = parse_sort(value)?,
            "populate" => entry.populate = parse_populate(value)?,
            other => return Err(ParseError::InvalidPopulate(format!("unknown option `{other}`"))),
        }
    }
    Ok(entry)
}

fn insert_dotted(map: &mut BTreeMap<String, PopulateEntry>, path: &str) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let entry = map.entry(head.to_string()).or_default();
    if let Some(rest) = rest {
        if !matches!(entry.populate, Populate::Attributes(_)) {
            entry.populate = Populate::Attributes(BTreeMap::new());
        }
        if let Populate::Attributes(nested) = &mut entry.populate {
            insert_dotted(nested, rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn parse_scalar_equality() {
        let node = parse_filters(&json!({"title": "Hello"})).unwrap();
        assert_eq!(node, FilterNode::eq("title", "Hello"));
    }

    #[test]
    fn parse_operators_on_field() {
        let node = parse_filters(&json!({"id": {"$in": ["a", "b"]}})).unwrap();
        assert_eq!(node, FilterNode::is_in("id", vec![json!("a"), json!("b")]));

        let node = parse_filters(&json!({"publishedAt": {"$null": true}})).unwrap();
        assert_eq!(node, FilterNode::is_null("publishedAt"));

        let node = parse_filters(&json!({"publishedAt": {"$notNull": true}})).unwrap();
        assert_eq!(node, FilterNode::not_null("publishedAt"));
    }

    #[test]
    fn parse_nested_object_and_logic() {
        let node = parse_filters(&json!({
            "$or": [{"title": "a"}, {"category": {"name": {"$startsWith": "C"}}}]
        }))
        .unwrap();
        assert_eq!(
            node,
            FilterNode::Or(vec![
                FilterNode::eq("title", "a"),
                FilterNode::nested(
                    "category",
                    FilterNode::field("name", Comparison::StartsWith("C".into()))
                ),
            ])
        );
    }

    #[test]
    fn parse_array_of_objects_as_any_nested() {
        let node = parse_filters(&json!({"categories": [{"id": "a"}, {"id": "b"}]})).unwrap();
        assert_eq!(
            node,
            FilterNode::nested(
                "categories",
                FilterNode::Or(vec![FilterNode::eq("id", "a"), FilterNode::eq("id", "b")])
            )
        );
    }

    #[test]
    fn parse_field_level_or() {
        let node = parse_filters(&json!({"title": {"$or": [{"$eq": "a"}, {"$eq": "b"}]}})).unwrap();
        assert_eq!(
            node,
            FilterNode::Or(vec![FilterNode::eq("title", "a"), FilterNode::eq("title", "b")])
        );
    }

    #[test]
    fn rejects_unknown_operator() {
        assert_err!(parse_filters(&json!({"title": {"$like": "a"}})));
        assert_err!(parse_filters(&json!({"$xor": []})));
        assert_err!(parse_filters(&json!(["title"])));
    }

    #[test]
    fn parse_sort_forms() {
        assert_eq!(parse_sort(&json!("id")).unwrap(), vec![SortField::asc("id")]);
        assert_eq!(
            parse_sort(&json!("title:desc, name")).unwrap(),
            vec![SortField::desc("title"), SortField::asc("name")]
        );
        assert_eq!(
            parse_sort(&json!([{"category": {"name": "desc"}}])).unwrap(),
            vec![SortField {
                path: vec!["category".into(), "name".into()],
                order: SortOrder::Desc,
            }]
        );
        assert_eq!(parse_sort(&json!([])).unwrap(), vec![]);
        assert_err!(parse_sort(&json!("title:sideways")));
    }

    #[test]
    fn parse_fields_forms() {
        assert_eq!(parse_fields(&json!("id,name")).unwrap(), vec!["id", "name"]);
        assert_eq!(parse_fields(&json!(["title"])).unwrap(), vec!["title"]);
        assert_err!(parse_fields(&json!([1])));
    }

    #[test]
    fn parse_populate_forms() {
        assert_eq!(parse_populate(&json!("*")).unwrap(), Populate::All);

        let populate = assert_ok!(parse_populate(&json!(["categories", "author.avatar"])));
        let Populate::Attributes(map) = populate else {
            panic!("expected attributes");
        };
        assert!(map.contains_key("categories"));
        let Populate::Attributes(nested) = &map["author"].populate else {
            panic!("expected nested populate");
        };
        assert!(nested.contains_key("avatar"));

        let populate = parse_populate(&json!({
            "category": {"fields": ["id"], "filters": {"id": "doc"}}
        }))
        .unwrap();
        let Populate::Attributes(map) = populate else {
            panic!("expected attributes");
        };
        assert_eq!(map["category"].fields, Some(vec!["id".to_string()]));
        assert_eq!(map["category"].filters, Some(FilterNode::eq("id", "doc")));

        assert_err!(parse_populate(&json!({"category": {"on": {}}})));
    }
}
