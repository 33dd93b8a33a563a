use document_service_query::ParseError;
use thiserror::Error;

use crate::document::{Status, ValidationError};
use crate::schema::SchemaError;
use crate::store::StoreError;

/// Errors surfaced by the document service.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("document {document_id} not found in {uid}")]
    NotFound { uid: String, document_id: String },

    #[error(
        "relation target {document_id} not found in {uid} (locale: {}, status: {status})",
        locale.as_deref().unwrap_or("none")
    )]
    RelationTargetNotFound {
        uid: String,
        document_id: String,
        locale: Option<String>,
        status: Status,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DocumentError {
    pub fn not_found(uid: &str, document_id: &str) -> Self {
        DocumentError::NotFound {
            uid: uid.to_string(),
            document_id: document_id.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, DocumentError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DocumentError::NotFound { .. })
    }
}

impl From<SchemaError> for DocumentError {
    fn from(err: SchemaError) -> Self {
        DocumentError::Validation(err.into())
    }
}

impl From<ParseError> for DocumentError {
    fn from(err: ParseError) -> Self {
        DocumentError::Validation(err.into())
    }
}

pub type DocumentResult<T> = Result<T, DocumentError>;
