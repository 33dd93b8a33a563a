//! Document metadata engine.
//!
//! Computes, for one version, the sibling locales and the opposite-status version of
//! the same document, plus the derived `status` shown to editors.

use chrono::{DateTime, Utc};
use document_service_query::{Comparison, FilterNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::model::{DOCUMENT_ID, LOCALE};
use crate::document::{DocumentStatus, Entity, EntityId, Status};
use crate::error::DocumentResult;
use crate::schema::SchemaRegistry;
use crate::store::{EntityQueries, EntityQuery, StoreResult};
use crate::transform::status_filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataOptions {
    pub available_locales: bool,
    pub available_status: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            available_locales: true,
            available_status: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableLocale {
    pub id: EntityId,
    pub locale: Option<String>,
    pub status: DocumentStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableStatus {
    pub id: EntityId,
    pub locale: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl From<&Entity> for AvailableStatus {
    fn from(row: &Entity) -> Self {
        Self {
            id: row.id,
            locale: row.locale.clone(),
            published_at: row.published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by.clone(),
            updated_by: row.updated_by.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub available_locales: Vec<AvailableLocale>,
    pub available_status: Vec<AvailableStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentWithMetadata {
    pub data: Value,
    pub meta: DocumentMetadata,
}

/// Classify a `(draft, published)` pair. A draft edited after publication is
/// `modified`.
pub fn classify_status(draft: Option<&Entity>, published: Option<&Entity>) -> DocumentStatus {
    match (draft, published) {
        (Some(draft), Some(published)) if draft.updated_at > published.updated_at => {
            DocumentStatus::Modified
        }
        (_, Some(_)) => DocumentStatus::Published,
        _ => DocumentStatus::Draft,
    }
}

fn same_locale(locale: Option<&str>) -> FilterNode {
    match locale {
        Some(locale) => FilterNode::eq(LOCALE, locale),
        None => FilterNode::is_null(LOCALE),
    }
}

fn other_locales(locale: Option<&str>) -> FilterNode {
    match locale {
        Some(locale) => FilterNode::Or(vec![
            FilterNode::field(LOCALE, Comparison::Ne(Value::from(locale))),
            FilterNode::is_null(LOCALE),
        ]),
        None => FilterNode::not_null(LOCALE),
    }
}

async fn load_available_status(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    version: &Entity,
) -> StoreResult<Vec<Entity>> {
    let Some(opposite) = status_filter(schema, uid, version.status().opposite()) else {
        return Ok(Vec::new());
    };
    let query = EntityQuery::new()
        .filter(FilterNode::eq(DOCUMENT_ID, version.document_id.as_str()))
        .filter(same_locale(version.locale.as_deref()))
        .filter(opposite)
        .fields(Some(Vec::new()));
    queries.find_many(uid, &query).await
}

async fn load_other_locales(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    version: &Entity,
    enabled: bool,
) -> StoreResult<Vec<Entity>> {
    if !enabled || !schema.is_localized(uid) {
        return Ok(Vec::new());
    }
    let query = EntityQuery::new()
        .filter(FilterNode::eq(DOCUMENT_ID, version.document_id.as_str()))
        .filter(other_locales(version.locale.as_deref()))
        .fields(Some(Vec::new()));
    queries.find_many(uid, &query).await
}

fn available_locales(
    schema: &SchemaRegistry,
    uid: &str,
    version: &Entity,
    rows: &[Entity],
) -> Vec<AvailableLocale> {
    let draft_and_publish = schema.has_draft_and_publish(uid);
    let mut locales: Vec<Option<String>> = Vec::new();
    for row in rows {
        if !locales.contains(&row.locale) {
            locales.push(row.locale.clone());
        }
    }
    locales.sort();

    locales
        .into_iter()
        .filter_map(|locale| {
            let pick = |status: Status| {
                rows.iter()
                    .find(|row| row.locale == locale && row.status() == status)
            };
            let draft = pick(Status::Draft);
            let published = pick(Status::Published);
            let status = if draft_and_publish {
                classify_status(draft, published)
            } else {
                DocumentStatus::Published
            };
            let (preferred, fallback) = match version.status() {
                Status::Draft => (draft, published),
                Status::Published => (published, draft),
            };
            let row = preferred.or(fallback)?;
            Some(AvailableLocale {
                id: row.id,
                locale: row.locale.clone(),
                status,
                published_at: row.published_at,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        })
        .collect()
}

/// Derived status of `version`, given its opposite-status sibling.
pub fn version_status(
    schema: &SchemaRegistry,
    uid: &str,
    version: &Entity,
    sibling: Option<&Entity>,
) -> DocumentStatus {
    if !schema.has_draft_and_publish(uid) {
        return DocumentStatus::Published;
    }
    match version.status() {
        Status::Draft => classify_status(Some(version), sibling),
        Status::Published => classify_status(sibling, Some(version)),
    }
}

/// Attach metadata to the output `data` of `version` and inject its derived `status`.
///
/// Issues at most two store queries, concurrently. The opposite-status sibling is
/// always loaded since the derived status depends on it.
pub async fn format_document_with_metadata(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    version: &Entity,
    data: Value,
    options: MetadataOptions,
) -> DocumentResult<DocumentWithMetadata> {
    let (status_rows, locale_rows) = tokio::try_join!(
        load_available_status(schema, queries, uid, version),
        load_other_locales(schema, queries, uid, version, options.available_locales),
    )?;

    let status = version_status(schema, uid, version, status_rows.first());
    let mut data = data;
    if let Value::Object(map) = &mut data {
        map.insert("status".to_string(), Value::from(status.as_str()));
    }

    let available_status = if options.available_status {
        status_rows.iter().map(AvailableStatus::from).collect()
    } else {
        Vec::new()
    };
    Ok(DocumentWithMetadata {
        data,
        meta: DocumentMetadata {
            available_locales: available_locales(schema, uid, version, &locale_rows),
            available_status,
        },
    })
}
