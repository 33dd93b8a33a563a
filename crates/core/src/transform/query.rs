//! Rewrite caller-facing query parameters into store queries.
//!
//! Callers address documents by `documentId` and call it `id`; stores know `id` as the
//! physical row key. Every `id` reachable through relations is renamed to `documentId`.
//! Component attributes keep their physical ids.

use std::collections::BTreeMap;

use document_service_query::{FilterNode, Populate, PopulateEntry, SortField};

use crate::document::model::{DOCUMENT_ID, ID, PUBLISHED_AT};
use crate::document::{Status, ValidationError};
use crate::schema::{Attribute, SchemaRegistry};

/// `publishedAt` condition selecting `status` rows; `None` for models without drafts.
pub fn status_filter(schema: &SchemaRegistry, uid: &str, status: Status) -> Option<FilterNode> {
    if !schema.has_draft_and_publish(uid) {
        return None;
    }
    Some(match status {
        Status::Draft => FilterNode::is_null(PUBLISHED_AT),
        Status::Published => FilterNode::not_null(PUBLISHED_AT),
    })
}

fn rename_id(field: String) -> String {
    if field == ID {
        DOCUMENT_ID.to_string()
    } else {
        field
    }
}

pub fn transform_filters(schema: &SchemaRegistry, uid: &str, node: FilterNode) -> FilterNode {
    match node {
        FilterNode::And(nodes) => FilterNode::And(
            nodes
                .into_iter()
                .map(|n| transform_filters(schema, uid, n))
                .collect(),
        ),
        FilterNode::Or(nodes) => FilterNode::Or(
            nodes
                .into_iter()
                .map(|n| transform_filters(schema, uid, n))
                .collect(),
        ),
        FilterNode::Not(inner) => FilterNode::Not(Box::new(transform_filters(schema, uid, *inner))),
        FilterNode::Field { field, op } => FilterNode::Field {
            field: rename_id(field),
            op,
        },
        FilterNode::Nested { attribute, node } => match schema.relation(uid, &attribute) {
            Some(relation) => {
                let node = transform_filters(schema, &relation.target, *node);
                FilterNode::Nested {
                    attribute,
                    node: Box::new(node),
                }
            }
            None => FilterNode::Nested { attribute, node },
        },
    }
}

pub fn transform_sort(schema: &SchemaRegistry, uid: &str, sort: Vec<SortField>) -> Vec<SortField> {
    sort.into_iter()
        .map(|mut field| {
            let Some((last, parents)) = field.path.split_last() else {
                return field;
            };
            if last != ID {
                return field;
            }
            let mut current = uid.to_string();
            for parent in parents {
                match schema.relation(&current, parent) {
                    Some(relation) => current = relation.target.clone(),
                    None => return field,
                }
            }
            if let Some(last) = field.path.last_mut() {
                *last = DOCUMENT_ID.to_string();
            }
            field
        })
        .collect()
}

/// `id` in a field list means the document id.
pub fn transform_fields(fields: Option<Vec<String>>) -> Option<Vec<String>> {
    fields.map(|fields| {
        let mut renamed: Vec<String> = Vec::with_capacity(fields.len());
        for field in fields.into_iter().map(rename_id) {
            if !renamed.contains(&field) {
                renamed.push(field);
            }
        }
        renamed
    })
}

/// Expand `*`, rewrite nested parameters, and restrict populated draft-and-publish
/// relations to `status` rows.
pub fn transform_populate(
    schema: &SchemaRegistry,
    uid: &str,
    populate: &Populate,
    status: Status,
) -> Result<Populate, ValidationError> {
    let model = schema.get_model(uid)?;
    let entries: BTreeMap<String, PopulateEntry> = match populate {
        Populate::None => return Ok(Populate::None),
        Populate::All => model
            .attributes()
            .iter()
            .filter(|(_, attribute)| attribute.is_link())
            .map(|(name, _)| (name.clone(), PopulateEntry::default()))
            .collect(),
        Populate::Attributes(entries) => entries.clone(),
    };

    let mut transformed = BTreeMap::new();
    for (name, entry) in entries {
        let entry = match model.attributes().get(&name) {
            Some(Attribute::Relation(relation)) => {
                let target = relation.target.as_str();
                let filters = entry.filters.map(|f| transform_filters(schema, target, f));
                PopulateEntry {
                    fields: transform_fields(entry.fields),
                    filters: FilterNode::and_opt(filters, status_filter(schema, target, status)),
                    sort: transform_sort(schema, target, entry.sort),
                    populate: transform_populate(schema, target, &entry.populate, status)?,
                }
            }
            Some(Attribute::Component(component)) => {
                let target = component.component.as_str();
                PopulateEntry {
                    populate: transform_populate(schema, target, &entry.populate, status)?,
                    ..entry
                }
            }
            Some(Attribute::Scalar { .. }) => {
                return Err(ValidationError::InvalidParams(format!(
                    "`{name}` on {uid} is not a relation or component"
                )))
            }
            None => {
                return Err(ValidationError::UnknownAttribute {
                    uid: uid.to_string(),
                    attribute: name,
                })
            }
        };
        transformed.insert(name, entry);
    }
    Ok(Populate::Attributes(transformed))
}
