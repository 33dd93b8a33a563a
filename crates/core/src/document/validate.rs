//! Input validation for document-service parameters.

use document_service_query::ParseError;
use serde_json::{Map, Value};
use thiserror::Error;

use super::model::{is_identity_field, ID};
use crate::schema::{Attribute, SchemaError, SchemaRegistry};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("documentId cannot be empty")]
    EmptyDocumentId,
    #[error("invalid status `{0}`: expected `draft` or `published`")]
    InvalidStatus(String),
    #[error("invalid locale `{0}`")]
    InvalidLocale(String),
    #[error("`data` is required")]
    MissingData,
    #[error("published versions cannot be updated directly; update the draft and publish it")]
    PublishedUpdate,
    #[error("`{0}` is managed by the document service and cannot be written")]
    ReservedAttribute(String),
    #[error("unknown attribute `{attribute}` on {uid}")]
    UnknownAttribute { uid: String, attribute: String },
    #[error("invalid relation value for `{attribute}`: {reason}")]
    InvalidRelation { attribute: String, reason: String },
    #[error("invalid component value for `{attribute}`: {reason}")]
    InvalidComponent { attribute: String, reason: String },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("invalid query: {0}")]
    Query(#[from] ParseError),
}

pub fn validate_document_id(document_id: &str) -> Result<(), ValidationError> {
    if document_id.trim().is_empty() {
        return Err(ValidationError::EmptyDocumentId);
    }
    Ok(())
}

/// Check that every key of `data` is a writable attribute of `uid`, recursing into
/// component values.
pub fn validate_data(
    schema: &SchemaRegistry,
    uid: &str,
    data: &Map<String, Value>,
) -> Result<(), ValidationError> {
    let model = schema.get_model(uid)?;
    let attributes = model.attributes();

    for (key, value) in data {
        if is_identity_field(key) {
            return Err(ValidationError::ReservedAttribute(key.clone()));
        }
        let attribute = attributes
            .get(key)
            .ok_or_else(|| ValidationError::UnknownAttribute {
                uid: uid.to_string(),
                attribute: key.clone(),
            })?;

        if let Attribute::Component(component) = attribute {
            let items: Vec<&Value> = match (value, component.repeatable) {
                (Value::Null, _) => Vec::new(),
                (Value::Array(items), true) => items.iter().collect(),
                (Value::Object(_), false) => vec![value],
                (_, true) => {
                    return Err(ValidationError::InvalidComponent {
                        attribute: key.clone(),
                        reason: "expected an array of objects".into(),
                    })
                }
                (_, false) => {
                    return Err(ValidationError::InvalidComponent {
                        attribute: key.clone(),
                        reason: "expected an object".into(),
                    })
                }
            };
            for item in items {
                let map = item.as_object().ok_or_else(|| ValidationError::InvalidComponent {
                    attribute: key.clone(),
                    reason: "expected an object".into(),
                })?;
                // Component items may carry their own id to be updated in place.
                let mut inner = map.clone();
                inner.remove(ID);
                validate_data(schema, &component.component, &inner)?;
            }
        }
    }
    Ok(())
}
