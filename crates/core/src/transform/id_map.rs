//! Per-operation `(uid, documentId, locale, status) <-> id` cache.
//!
//! References are registered first, then loaded with one query per target uid, then
//! resolved synchronously.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use document_service_query::FilterNode;
use futures::future::try_join_all;
use serde_json::Value;

use super::input::DocumentRef;
use crate::document::model::{DOCUMENT_ID, ID};
use crate::document::{EntityId, Status, VersionKey};
use crate::error::{DocumentError, DocumentResult};
use crate::schema::SchemaRegistry;
use crate::store::{EntityQueries, EntityQuery, StoreError, StoreResult};

/// Locale and status the enclosing operation writes or reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationContext {
    pub locale: Option<String>,
    pub status: Status,
}

impl RelationContext {
    pub fn new(locale: Option<String>, status: Status) -> Self {
        Self { locale, status }
    }
}

#[derive(Debug, Default)]
pub struct IdMap {
    pending: BTreeMap<String, BTreeSet<String>>,
    loaded: HashSet<(String, String)>,
    ids: HashMap<(String, VersionKey), EntityId>,
    keys: HashMap<(String, EntityId), VersionKey>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document whose versions must be known before resolution.
    pub fn add(&mut self, uid: &str, document_id: &str) {
        if self.loaded.contains(&(uid.to_string(), document_id.to_string())) {
            return;
        }
        self.pending
            .entry(uid.to_string())
            .or_default()
            .insert(document_id.to_string());
    }

    fn register(&mut self, uid: &str, rows: impl IntoIterator<Item = crate::document::Entity>) {
        for row in rows {
            let key = row.version_key();
            self.ids.insert((uid.to_string(), key.clone()), row.id);
            self.keys.insert((uid.to_string(), row.id), key);
        }
    }

    /// Load every pending document, one query per uid, concurrently.
    pub async fn load(&mut self, queries: &dyn EntityQueries) -> StoreResult<()> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(());
        }
        let loads = pending.into_iter().map(|(uid, document_ids)| async move {
            let query = EntityQuery::new()
                .filter(FilterNode::is_in(
                    DOCUMENT_ID,
                    document_ids.iter().map(|id| Value::from(id.as_str())).collect(),
                ))
                .fields(Some(Vec::new()));
            let rows = queries.find_many(&uid, &query).await?;
            Ok::<_, StoreError>((uid, document_ids, rows))
        });

        for (uid, document_ids, rows) in try_join_all(loads).await? {
            tracing::debug!(
                uid = %uid,
                documents = document_ids.len(),
                versions = rows.len(),
                "id map loaded"
            );
            self.register(&uid, rows);
            for document_id in document_ids {
                self.loaded.insert((uid.clone(), document_id));
            }
        }
        Ok(())
    }

    /// Load rows by physical id, then every sibling version of their documents.
    pub async fn load_ids(
        &mut self,
        queries: &dyn EntityQueries,
        uid: &str,
        ids: &[EntityId],
    ) -> StoreResult<()> {
        let unknown: Vec<Value> = ids
            .iter()
            .filter(|id| !self.keys.contains_key(&(uid.to_string(), **id)))
            .map(|id| Value::from(*id))
            .collect();
        if !unknown.is_empty() {
            let query = EntityQuery::new()
                .filter(FilterNode::is_in(ID, unknown))
                .fields(Some(Vec::new()));
            for row in queries.find_many(uid, &query).await? {
                self.add(uid, &row.document_id);
            }
        }
        self.load(queries).await
    }

    pub fn get(
        &self,
        uid: &str,
        document_id: &str,
        locale: Option<&str>,
        status: Status,
    ) -> Option<EntityId> {
        let key = VersionKey::new(document_id, locale.map(str::to_string), status);
        self.ids.get(&(uid.to_string(), key)).copied()
    }

    /// Reverse lookup of a loaded row.
    pub fn key(&self, uid: &str, id: EntityId) -> Option<&VersionKey> {
        self.keys.get(&(uid.to_string(), id))
    }

    /// Pick the version of `reference` the enclosing operation should link to.
    ///
    /// Unresolvable references are dropped (`Ok(None)`) unless the caller pinned a
    /// locale or status on them.
    pub fn resolve(
        &self,
        schema: &SchemaRegistry,
        target: &str,
        reference: &DocumentRef,
        ctx: &RelationContext,
    ) -> DocumentResult<Option<EntityId>> {
        let locale = if schema.is_localized(target) {
            reference.locale.clone().or_else(|| ctx.locale.clone())
        } else {
            None
        };
        let status = if schema.has_draft_and_publish(target) {
            reference.status.unwrap_or(ctx.status)
        } else {
            Status::Published
        };

        match self.get(target, &reference.document_id, locale.as_deref(), status) {
            Some(id) => Ok(Some(id)),
            None if reference.is_pinned() => Err(DocumentError::RelationTargetNotFound {
                uid: target.to_string(),
                document_id: reference.document_id.clone(),
                locale,
                status,
            }),
            None => {
                tracing::warn!(
                    target_uid = %target,
                    document_id = %reference.document_id,
                    locale = ?locale,
                    %status,
                    "dropping relation to missing document version"
                );
                Ok(None)
            }
        }
    }

    /// The sibling of row `id` in `status`, same document and locale.
    pub fn sibling(&self, uid: &str, id: EntityId, status: Status) -> Option<EntityId> {
        let key = self.key(uid, id)?;
        self.get(uid, &key.document_id, key.locale.as_deref(), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NewEntity;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    const CATEGORY: &str = "api::category.category";

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::from_json(json!({
                "contentTypes": [
                    {"uid": CATEGORY, "localized": true, "attributes": {
                        "name": {"type": "string"}
                    }},
                    {"uid": "api::tag.tag", "draftAndPublish": false, "attributes": {
                        "name": {"type": "string"}
                    }}
                ]
            }))
            .unwrap(),
        )
    }

    async fn seed(store: &MemoryStore) -> (EntityId, EntityId, EntityId) {
        let draft = store
            .create(CATEGORY, NewEntity::new("Cat1").locale(Some("en".into())))
            .await
            .unwrap();
        let published = store
            .create(
                CATEGORY,
                NewEntity::new("Cat1").locale(Some("en".into())).published_at(Some(Utc::now())),
            )
            .await
            .unwrap();
        let tag = store
            .create("api::tag.tag", NewEntity::new("Tag1").published_at(Some(Utc::now())))
            .await
            .unwrap();
        (draft.id, published.id, tag.id)
    }

    #[tokio::test]
    async fn resolves_by_context_and_pins() {
        let schema = schema();
        let store = MemoryStore::new(schema.clone());
        let (draft, published, tag) = seed(&store).await;

        let mut map = IdMap::new();
        map.add(CATEGORY, "Cat1");
        map.add("api::tag.tag", "Tag1");
        map.load(&store).await.unwrap();

        let draft_ctx = RelationContext::new(Some("en".into()), Status::Draft);
        let cat = DocumentRef::new("Cat1");
        assert_eq!(map.resolve(&schema, CATEGORY, &cat, &draft_ctx).unwrap(), Some(draft));

        let pinned = DocumentRef {
            status: Some(Status::Published),
            ..DocumentRef::new("Cat1")
        };
        assert_eq!(
            map.resolve(&schema, CATEGORY, &pinned, &draft_ctx).unwrap(),
            Some(published)
        );

        // Non draft-and-publish targets always resolve to their single row.
        let tag_ref = DocumentRef::new("Tag1");
        assert_eq!(map.resolve(&schema, "api::tag.tag", &tag_ref, &draft_ctx).unwrap(), Some(tag));

        let fr_ctx = RelationContext::new(Some("fr".into()), Status::Draft);
        assert_eq!(map.resolve(&schema, CATEGORY, &cat, &fr_ctx).unwrap(), None);

        let pinned_fr = DocumentRef {
            locale: Some("fr".into()),
            ..DocumentRef::new("Cat1")
        };
        assert!(matches!(
            map.resolve(&schema, CATEGORY, &pinned_fr, &draft_ctx),
            Err(DocumentError::RelationTargetNotFound { .. })
        ));

        assert_eq!(map.sibling(CATEGORY, draft, Status::Published), Some(published));
    }

    #[tokio::test]
    async fn loads_siblings_from_ids() {
        let schema = schema();
        let store = MemoryStore::new(schema);
        let (draft, published, _) = seed(&store).await;

        let mut map = IdMap::new();
        map.load_ids(&store, CATEGORY, &[draft]).await.unwrap();
        assert_eq!(map.key(CATEGORY, draft).unwrap().to_string(), "Cat1@en#draft");
        assert_eq!(map.sibling(CATEGORY, draft, Status::Published), Some(published));
    }
}
