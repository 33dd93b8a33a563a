//! Query AST shared by the document service and the entity stores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A filter tree. Parsed once from the loosely-shaped JSON `filters` parameter so
/// every consumer can match on it exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),

    /// Comparison on an attribute of the current row.
    Field { field: String, op: Comparison },

    /// Filter evaluated against whatever `attribute` points at: a related entity,
    /// a component, or a nested JSON object. Matches when any nested value matches.
    Nested {
        attribute: String,
        node: Box<FilterNode>,
    },
}

impl FilterNode {
    pub fn field(field: impl Into<String>, op: Comparison) -> Self {
        FilterNode::Field {
            field: field.into(),
            op,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, Comparison::Eq(value.into()))
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(field, Comparison::In(values))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::field(field, Comparison::Null)
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Self::field(field, Comparison::NotNull)
    }

    pub fn nested(attribute: impl Into<String>, node: FilterNode) -> Self {
        FilterNode::Nested {
            attribute: attribute.into(),
            node: Box::new(node),
        }
    }

    /// Combine two optional filters with `And`, flattening nested conjunctions.
    pub fn and_opt(left: Option<FilterNode>, right: Option<FilterNode>) -> Option<FilterNode> {
        match (left, right) {
            (None, None) => None,
            (Some(node), None) | (None, Some(node)) => Some(node),
            (Some(l), Some(r)) => {
                let mut nodes = Vec::new();
                for node in [l, r] {
                    match node {
                        FilterNode::And(inner) => nodes.extend(inner),
                        other => nodes.push(other),
                    }
                }
                Some(FilterNode::And(nodes))
            }
        }
    }

    /// Conjunction of every node; `None` when the list is empty.
    pub fn all(nodes: Vec<FilterNode>) -> Option<FilterNode> {
        nodes
            .into_iter()
            .fold(None, |acc, node| FilterNode::and_opt(acc, Some(node)))
    }
}

/// Comparison operators (`$eq`, `$in`, `$null`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Comparison {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Null,
    NotNull,
    Contains(String),
    ContainsInsensitive(String),
    NotContains(String),
    StartsWith(String),
    EndsWith(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One sort key. `path` is a dotted attribute path (`title`, `category.name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub path: Vec<String>,
    pub order: SortOrder,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            path: vec![field.into()],
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            path: vec![field.into()],
            order: SortOrder::Desc,
        }
    }

    /// Dotted representation, e.g. `category.name`.
    pub fn dotted(&self) -> String {
        self.path.join(".")
    }
}

/// Which relations/components to load alongside the root rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Populate {
    #[default]
    None,
    /// `*`: every relation and component attribute, one level deep.
    All,
    Attributes(BTreeMap<String, PopulateEntry>),
}

impl Populate {
    pub fn is_none(&self) -> bool {
        match self {
            Populate::None => true,
            Populate::All => false,
            Populate::Attributes(map) => map.is_empty(),
        }
    }
}

/// Per-attribute populate options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulateEntry {
    pub fields: Option<Vec<String>>,
    pub filters: Option<FilterNode>,
    pub sort: Vec<SortField>,
    pub populate: Populate,
}
