use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted after a document write has been committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocumentEvent {
    #[serde(rename = "entry.create")]
    Create(EntryEvent),
    #[serde(rename = "entry.update")]
    Update(EntryEvent),
    #[serde(rename = "entry.delete")]
    Delete(EntryEvent),
    #[serde(rename = "entry.publish")]
    Publish(EntryEvent),
    #[serde(rename = "entry.unpublish")]
    Unpublish(EntryEvent),
    #[serde(rename = "entry.draft-discard")]
    DraftDiscard(EntryEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryEvent {
    pub uid: String,
    pub document_id: String,
    pub locale: Option<String>,
    /// The affected version as returned to the caller.
    pub document: Value,
    pub timestamp: DateTime<Utc>,
}

impl EntryEvent {
    pub fn new(uid: &str, document_id: &str, locale: Option<String>, document: Value) -> Self {
        Self {
            uid: uid.to_string(),
            document_id: document_id.to_string(),
            locale,
            document,
            timestamp: Utc::now(),
        }
    }
}

impl DocumentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentEvent::Create(_) => "entry.create",
            DocumentEvent::Update(_) => "entry.update",
            DocumentEvent::Delete(_) => "entry.delete",
            DocumentEvent::Publish(_) => "entry.publish",
            DocumentEvent::Unpublish(_) => "entry.unpublish",
            DocumentEvent::DraftDiscard(_) => "entry.draft-discard",
        }
    }

    pub fn entry(&self) -> &EntryEvent {
        match self {
            DocumentEvent::Create(entry)
            | DocumentEvent::Update(entry)
            | DocumentEvent::Delete(entry)
            | DocumentEvent::Publish(entry)
            | DocumentEvent::Unpublish(entry)
            | DocumentEvent::DraftDiscard(entry) => entry,
        }
    }
}
