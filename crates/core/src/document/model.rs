use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id::{Status, VersionKey};

/// Physical primary key assigned by the entity store.
pub type EntityId = i64;

pub const ID: &str = "id";
pub const DOCUMENT_ID: &str = "documentId";
pub const LOCALE: &str = "locale";
pub const PUBLISHED_AT: &str = "publishedAt";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const CREATED_BY: &str = "createdBy";
pub const UPDATED_BY: &str = "updatedBy";

/// Attributes managed by the service; callers cannot write them through `data`.
pub const IDENTITY_FIELDS: [&str; 8] = [
    ID,
    DOCUMENT_ID,
    LOCALE,
    PUBLISHED_AT,
    CREATED_AT,
    UPDATED_AT,
    CREATED_BY,
    UPDATED_BY,
];

pub fn is_identity_field(name: &str) -> bool {
    IDENTITY_FIELDS.contains(&name)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One physical row: a single version of a document (or a component row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub document_id: String,
    pub locale: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    /// Content attributes, relation ids, and component ids stored as JSON.
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl Entity {
    pub fn status(&self) -> Status {
        if self.published_at.is_some() {
            Status::Published
        } else {
            Status::Draft
        }
    }

    pub fn is_draft(&self) -> bool {
        self.published_at.is_none()
    }

    pub fn version_key(&self) -> VersionKey {
        VersionKey::new(self.document_id.clone(), self.locale.clone(), self.status())
    }

    /// JSON view of the row: identity fields followed by content.
    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = Map::with_capacity(self.content.len() + IDENTITY_FIELDS.len());
        row.insert(ID.into(), Value::from(self.id));
        row.insert(DOCUMENT_ID.into(), Value::String(self.document_id.clone()));
        row.insert(
            LOCALE.into(),
            self.locale.clone().map(Value::String).unwrap_or(Value::Null),
        );
        row.insert(
            PUBLISHED_AT.into(),
            self.published_at
                .as_ref()
                .map(|ts| Value::String(format_timestamp(ts)))
                .unwrap_or(Value::Null),
        );
        row.insert(CREATED_AT.into(), Value::String(format_timestamp(&self.created_at)));
        row.insert(UPDATED_AT.into(), Value::String(format_timestamp(&self.updated_at)));
        row.insert(
            CREATED_BY.into(),
            self.created_by.clone().map(Value::String).unwrap_or(Value::Null),
        );
        row.insert(
            UPDATED_BY.into(),
            self.updated_by.clone().map(Value::String).unwrap_or(Value::Null),
        );
        for (key, value) in &self.content {
            row.entry(key.clone()).or_insert_with(|| value.clone());
        }
        row
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.to_row())
    }
}

/// Insert payload for the entity store.
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub document_id: String,
    pub locale: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Defaults to now.
    pub created_at: Option<DateTime<Utc>>,
    /// Defaults to `created_at`.
    pub updated_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub content: Map<String, Value>,
}

impl NewEntity {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }

    pub fn locale(mut self, locale: Option<String>) -> Self {
        self.locale = locale;
        self
    }

    pub fn published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }

    pub fn content(mut self, content: Map<String, Value>) -> Self {
        self.content = content;
        self
    }
}

/// Partial update. Content keys are merged; timestamps only move when set.
#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub content: Map<String, Value>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl EntityPatch {
    /// A patch that does not count as an edit (relation bookkeeping).
    pub fn silent(content: Map<String, Value>) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }
}

/// Extract row ids from a stored link value: an id, an array of ids, or populated rows.
pub fn link_ids(value: Option<&Value>) -> Vec<EntityId> {
    fn one(value: &Value) -> Option<EntityId> {
        match value {
            Value::Number(n) => n.as_i64(),
            Value::Object(map) => map.get(ID).and_then(Value::as_i64),
            _ => None,
        }
    }
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(one).collect(),
        Some(other) => one(other).into_iter().collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn entity() -> Entity {
        let ts = Utc.with_ymd_and_hms(2024, 2, 16, 10, 0, 0).unwrap();
        Entity {
            id: 7,
            document_id: "Article1".into(),
            locale: Some("en".into()),
            published_at: None,
            created_at: ts,
            updated_at: ts,
            created_by: None,
            updated_by: None,
            content: json!({"title": "Hello", "categories": [1, 2]})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    #[test]
    fn row_view_contains_identity_and_content() {
        let row = entity().to_row();
        assert_eq!(row["id"], json!(7));
        assert_eq!(row["documentId"], json!("Article1"));
        assert_eq!(row["publishedAt"], json!(null));
        assert_eq!(row["updatedAt"], json!("2024-02-16T10:00:00.000Z"));
        assert_eq!(row["title"], json!("Hello"));
    }

    #[test]
    fn status_follows_published_at() {
        let mut e = entity();
        assert_eq!(e.status(), Status::Draft);
        e.published_at = Some(e.created_at);
        assert_eq!(e.status(), Status::Published);
        assert_eq!(e.version_key().to_string(), "Article1@en#published");
    }

    #[test]
    fn link_ids_from_any_shape() {
        assert_eq!(link_ids(Some(&json!(3))), vec![3]);
        assert_eq!(link_ids(Some(&json!([1, 2]))), vec![1, 2]);
        assert_eq!(link_ids(Some(&json!([{"id": 4}, {"id": 5}]))), vec![4, 5]);
        assert!(link_ids(Some(&json!(null))).is_empty());
        assert!(link_ids(None).is_empty());
    }
}
