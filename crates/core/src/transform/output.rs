//! Shape stored rows into caller-facing documents.
//!
//! Document rows expose their `documentId` as `id`; component rows keep their physical
//! `id` and lose the version columns. Link attributes are only returned when populated.

use document_service_query::{Populate, PopulateEntry};
use serde_json::{Map, Value};

use crate::document::model::{is_identity_field, DOCUMENT_ID, ID};
use crate::schema::{Attribute, SchemaRegistry};
use crate::store::populate::project_row;

/// Fields and populate tree an output row was loaded with.
#[derive(Debug, Clone, Copy)]
pub struct OutputShape<'a> {
    pub fields: Option<&'a [String]>,
    pub populate: &'a Populate,
}

impl<'a> OutputShape<'a> {
    pub fn new(fields: Option<&'a [String]>, populate: &'a Populate) -> Self {
        Self { fields, populate }
    }

    fn of_entry(entry: &'a PopulateEntry) -> Self {
        Self {
            fields: entry.fields.as_deref(),
            populate: &entry.populate,
        }
    }

    fn entry(&self, name: &str) -> Option<OutputShape<'a>> {
        static EMPTY: Populate = Populate::None;
        match self.populate {
            Populate::None => None,
            Populate::All => Some(OutputShape::new(None, &EMPTY)),
            Populate::Attributes(entries) => entries.get(name).map(OutputShape::of_entry),
        }
    }
}

/// Rewrite a document row, or an array of them, of model `uid`.
pub fn transform_output_document_id(
    schema: &SchemaRegistry,
    uid: &str,
    value: Value,
    shape: OutputShape<'_>,
) -> Value {
    map_rows(value, &mut |row| output_document(schema, uid, row, shape))
}

fn map_rows(value: Value, f: &mut dyn FnMut(Map<String, Value>) -> Map<String, Value>) -> Value {
    match value {
        Value::Object(row) => Value::Object(f(row)),
        Value::Array(rows) => Value::Array(rows.into_iter().map(|row| map_rows(row, f)).collect()),
        other => other,
    }
}

fn output_document(
    schema: &SchemaRegistry,
    uid: &str,
    mut row: Map<String, Value>,
    shape: OutputShape<'_>,
) -> Map<String, Value> {
    if let Some(document_id) = row.get(DOCUMENT_ID).cloned() {
        row.insert(ID.to_string(), document_id);
    }
    output_links(schema, uid, &mut row, shape);
    if let Some(fields) = shape.fields {
        project_row(&mut row, fields);
    }
    row
}

fn output_component(
    schema: &SchemaRegistry,
    uid: &str,
    mut row: Map<String, Value>,
    shape: OutputShape<'_>,
) -> Map<String, Value> {
    row.retain(|key, _| key == ID || !is_identity_field(key));
    output_links(schema, uid, &mut row, shape);
    if let Some(fields) = shape.fields {
        row.retain(|key, _| {
            key == ID
                || fields.contains(key)
                || schema.attribute(uid, key).is_some_and(Attribute::is_link)
        });
    }
    row
}

fn output_links(
    schema: &SchemaRegistry,
    uid: &str,
    row: &mut Map<String, Value>,
    shape: OutputShape<'_>,
) {
    let Ok(model) = schema.get_model(uid) else {
        return;
    };
    for (name, attribute) in model.attributes() {
        if !attribute.is_link() {
            continue;
        }
        let Some(value) = row.remove(name) else {
            continue;
        };
        let Some(nested) = shape.entry(name) else {
            continue;
        };
        let value = match attribute {
            Attribute::Relation(relation) => {
                map_rows(value, &mut |r| output_document(schema, &relation.target, r, nested))
            }
            Attribute::Component(component) => {
                map_rows(value, &mut |r| output_component(schema, &component.component, r, nested))
            }
            Attribute::Scalar { .. } => value,
        };
        row.insert(name.clone(), value);
    }
}
