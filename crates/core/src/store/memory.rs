//! In-memory entity store.
//!
//! Rows live in per-uid ordered maps behind one `tokio::sync::Mutex`. A transaction
//! takes the lock for its whole lifetime and keeps a snapshot to restore on rollback,
//! so transactions are serialized and reads outside a transaction wait for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use document_service_query::compare::sort_ordering;
use document_service_query::{
    eval_filter, value_at_path, EvalError, FilterNode, NestedRows, Scope, SortOrder,
};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::populate::shape_entities;
use super::{EntityQueries, EntityQuery, EntityStore, StoreError, StoreResult, StoreTransaction};
use crate::document::model::ID;
use crate::document::{link_ids, Entity, EntityId, EntityPatch, NewEntity};
use crate::schema::{Attribute, SchemaRegistry};

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<EntityId, Entity>>,
    next_id: EntityId,
}

impl Tables {
    fn table(&self, uid: &str) -> impl Iterator<Item = &Entity> {
        self.rows.get(uid).into_iter().flat_map(|rows| rows.values())
    }

    fn rows_by_id(&self, uid: &str, ids: &[EntityId]) -> Vec<Map<String, Value>> {
        let Some(rows) = self.rows.get(uid) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| rows.get(id)).map(Entity::to_row).collect()
    }

    fn matching(
        &self,
        schema: &SchemaRegistry,
        uid: &str,
        filter: Option<&FilterNode>,
    ) -> StoreResult<Vec<&Entity>> {
        schema.get_model(uid)?;
        let scope = MemoryScope {
            tables: self,
            schema,
            uid,
        };
        let mut matched = Vec::new();
        for entity in self.table(uid) {
            let keep = match filter {
                Some(node) => eval_filter(node, &entity.to_row(), &scope)?,
                None => true,
            };
            if keep {
                matched.push(entity);
            }
        }
        Ok(matched)
    }

    fn select(
        &self,
        schema: &SchemaRegistry,
        uid: &str,
        query: &EntityQuery,
    ) -> StoreResult<Vec<Entity>> {
        let matched = self.matching(schema, uid, query.filter.as_ref())?;

        let mut keyed = Vec::with_capacity(matched.len());
        let scope = MemoryScope {
            tables: self,
            schema,
            uid,
        };
        for entity in matched {
            let row = entity.to_row();
            let keys = query
                .sort
                .iter()
                .map(|field| value_at_path(&field.path, &row, &scope))
                .collect::<Result<Vec<_>, _>>()?;
            keyed.push((keys, entity));
        }
        // BTreeMap iteration already yields ascending ids; the sort is stable.
        keyed.sort_by(|(left, _), (right, _)| {
            query
                .sort
                .iter()
                .zip(left.iter().zip(right))
                .map(|(field, (l, r))| match field.order {
                    SortOrder::Asc => sort_ordering(l, r),
                    SortOrder::Desc => sort_ordering(r, l),
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(keyed
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    fn insert(&mut self, uid: &str, new: NewEntity) -> Entity {
        self.next_id += 1;
        let now = Utc::now();
        let created_at = new.created_at.unwrap_or(now);
        let entity = Entity {
            id: self.next_id,
            document_id: new.document_id,
            locale: new.locale,
            published_at: new.published_at,
            created_at,
            updated_at: new.updated_at.unwrap_or(created_at),
            created_by: new.created_by,
            updated_by: new.updated_by,
            content: new.content,
        };
        self.rows
            .entry(uid.to_string())
            .or_default()
            .insert(entity.id, entity.clone());
        entity
    }

    fn update(&mut self, uid: &str, id: EntityId, patch: EntityPatch) -> StoreResult<Entity> {
        let entity = self
            .rows
            .get_mut(uid)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| StoreError::NotFound {
                uid: uid.to_string(),
                id,
            })?;
        entity.content.extend(patch.content);
        if let Some(updated_at) = patch.updated_at {
            entity.updated_at = updated_at;
        }
        if patch.updated_by.is_some() {
            entity.updated_by = patch.updated_by;
        }
        Ok(entity.clone())
    }

    fn remove(&mut self, uid: &str, id: EntityId) -> Option<Entity> {
        self.rows.get_mut(uid).and_then(|rows| rows.remove(&id))
    }

    fn remove_matching(
        &mut self,
        schema: &SchemaRegistry,
        uid: &str,
        filter: Option<&FilterNode>,
    ) -> StoreResult<u64> {
        let ids: Vec<EntityId> = self
            .matching(schema, uid, filter)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        for id in &ids {
            self.remove(uid, *id);
        }
        Ok(ids.len() as u64)
    }
}

/// Follows relation and component attributes through the in-memory tables.
struct MemoryScope<'a> {
    tables: &'a Tables,
    schema: &'a SchemaRegistry,
    uid: &'a str,
}

impl Scope for MemoryScope<'_> {
    fn nested(
        &self,
        attribute: &str,
        row: &Map<String, Value>,
    ) -> Result<Option<NestedRows<'_>>, EvalError> {
        let schema = self.schema;
        let Some(attr) = schema.attribute(self.uid, attribute) else {
            return Ok(None);
        };
        let (target, rows) = match attr {
            Attribute::Relation(relation) => match &relation.mapped_by {
                None => (
                    relation.target.as_str(),
                    self.tables
                        .rows_by_id(&relation.target, &link_ids(row.get(attribute))),
                ),
                Some(mapped_by) => {
                    let owner = row.get(ID).and_then(Value::as_i64);
                    let rows = self
                        .tables
                        .table(&relation.target)
                        .filter(|e| {
                            owner.is_some_and(|id| link_ids(e.content.get(mapped_by)).contains(&id))
                        })
                        .map(Entity::to_row)
                        .collect();
                    (relation.target.as_str(), rows)
                }
            },
            Attribute::Component(component) => (
                component.component.as_str(),
                self.tables
                    .rows_by_id(&component.component, &link_ids(row.get(attribute))),
            ),
            Attribute::Scalar { .. } => return Ok(None),
        };
        Ok(Some(NestedRows {
            rows,
            scope: Box::new(MemoryScope {
                tables: self.tables,
                schema,
                uid: target,
            }),
        }))
    }
}

/// Shared access to the tables for the store and its transactions.
#[async_trait]
trait TableAccess: Send + Sync {
    fn schema(&self) -> &SchemaRegistry;

    async fn with_tables<R, F>(&self, f: F) -> StoreResult<R>
    where
        R: Send,
        F: FnOnce(&mut Tables) -> StoreResult<R> + Send;
}

#[async_trait]
impl<T: TableAccess> EntityQueries for T {
    async fn find_many(&self, uid: &str, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
        let schema = self.schema();
        let mut entities = self
            .with_tables(|tables| tables.select(schema, uid, query))
            .await?;
        shape_entities(self, schema, uid, &mut entities, query).await?;
        Ok(entities)
    }

    async fn count(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        let schema = self.schema();
        self.with_tables(|tables| Ok(tables.matching(schema, uid, filter)?.len() as u64))
            .await
    }

    async fn create(&self, uid: &str, entity: NewEntity) -> StoreResult<Entity> {
        self.schema().get_model(uid)?;
        self.with_tables(|tables| Ok(tables.insert(uid, entity))).await
    }

    async fn update(&self, uid: &str, id: EntityId, patch: EntityPatch) -> StoreResult<Entity> {
        self.with_tables(|tables| tables.update(uid, id, patch)).await
    }

    async fn delete(&self, uid: &str, id: EntityId) -> StoreResult<Option<Entity>> {
        self.with_tables(|tables| Ok(tables.remove(uid, id))).await
    }

    async fn delete_many(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        let schema = self.schema();
        self.with_tables(|tables| tables.remove_matching(schema, uid, filter))
            .await
    }
}

/// Entity store kept entirely in process memory.
#[derive(Clone)]
pub struct MemoryStore {
    schema: Arc<SchemaRegistry>,
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    /// Number of rows currently stored for `uid`.
    pub async fn len(&self, uid: &str) -> usize {
        self.tables.lock().await.table(uid).count()
    }

    pub async fn is_empty(&self, uid: &str) -> bool {
        self.len(uid).await == 0
    }
}

#[async_trait]
impl TableAccess for MemoryStore {
    fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    async fn with_tables<R, F>(&self, f: F) -> StoreResult<R>
    where
        R: Send,
        F: FnOnce(&mut Tables) -> StoreResult<R> + Send,
    {
        let mut tables = self.tables.lock().await;
        f(&mut *tables)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let snapshot = guard.clone();
        tracing::trace!("memory transaction started");
        Ok(Box::new(MemoryTransaction {
            schema: self.schema.clone(),
            guard: Mutex::new(Some(guard)),
            snapshot: Some(snapshot),
        }))
    }

    fn as_queries(&self) -> &dyn EntityQueries {
        self
    }
}

pub struct MemoryTransaction {
    schema: Arc<SchemaRegistry>,
    guard: Mutex<Option<OwnedMutexGuard<Tables>>>,
    snapshot: Option<Tables>,
}

#[async_trait]
impl TableAccess for MemoryTransaction {
    fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    async fn with_tables<R, F>(&self, f: F) -> StoreResult<R>
    where
        R: Send,
        F: FnOnce(&mut Tables) -> StoreResult<R> + Send,
    {
        let mut slot = self.guard.lock().await;
        let tables = slot
            .as_mut()
            .ok_or_else(|| StoreError::Transaction("transaction already finished".into()))?;
        f(&mut **tables)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.snapshot = None;
        self.guard.get_mut().take();
        tracing::trace!("memory transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.restore();
        tracing::trace!("memory transaction rolled back");
        Ok(())
    }

    fn as_queries(&self) -> &dyn EntityQueries {
        self
    }
}

impl MemoryTransaction {
    fn restore(&mut self) {
        let guard = self.guard.get_mut().take();
        if let (Some(mut guard), Some(snapshot)) = (guard, self.snapshot.take()) {
            *guard = snapshot;
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use document_service_query::{Comparison, Populate, PopulateEntry, SortField};
    use serde_json::json;

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::from_json(json!({
                "contentTypes": [
                    {
                        "uid": "api::article.article",
                        "attributes": {
                            "title": {"type": "string"},
                            "views": {"type": "integer"},
                            "categories": {
                                "type": "relation",
                                "relation": "manyToMany",
                                "target": "api::category.category",
                                "inversedBy": "articles"
                            }
                        }
                    },
                    {
                        "uid": "api::category.category",
                        "attributes": {
                            "name": {"type": "string"},
                            "articles": {
                                "type": "relation",
                                "relation": "manyToMany",
                                "target": "api::article.article",
                                "mappedBy": "categories"
                            }
                        }
                    }
                ]
            }))
            .unwrap(),
        )
    }

    fn content(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn seed(store: &MemoryStore) -> (Entity, Entity, Entity) {
        let category = |name: &str| NewEntity::new(name).content(content(json!({"name": name})));
        let c1 = store
            .create("api::category.category", category("Cat1"))
            .await
            .unwrap();
        let c2 = store
            .create("api::category.category", category("Cat2"))
            .await
            .unwrap();
        let article = store
            .create(
                "api::article.article",
                NewEntity::new("Article1").content(content(
                    json!({"title": "Hello", "views": 10, "categories": [c2.id, c1.id]}),
                )),
            )
            .await
            .unwrap();
        (c1, c2, article)
    }

    #[tokio::test]
    async fn filters_through_relations() {
        let store = MemoryStore::new(schema());
        let (_, _, article) = seed(&store).await;

        let query = EntityQuery::new().filter(FilterNode::nested(
            "categories",
            FilterNode::eq("name", "Cat1"),
        ));
        let found = store.find_many("api::article.article", &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, article.id);

        let inverse = EntityQuery::new().filter(FilterNode::nested(
            "articles",
            FilterNode::field("views", Comparison::Gt(json!(5))),
        ));
        let count = store.count("api::category.category", inverse.filter.as_ref()).await;
        assert_eq!(count.unwrap(), 2);
    }

    #[tokio::test]
    async fn populates_in_stored_order_and_inverse() {
        let store = MemoryStore::new(schema());
        let (c1, c2, _) = seed(&store).await;

        let query = EntityQuery::new().populate(Populate::All);
        let article = store
            .find_one("api::article.article", &query)
            .await
            .unwrap()
            .unwrap();
        let names: Vec<_> = article.content["categories"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("Cat2"), json!("Cat1")]);

        let mut entries = BTreeMap::new();
        entries.insert("articles".to_string(), PopulateEntry::default());
        let query = EntityQuery::new()
            .filter(FilterNode::eq("id", c1.id))
            .populate(Populate::Attributes(entries));
        let category = store
            .find_one("api::category.category", &query)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(category.content["articles"][0]["title"], json!("Hello"));
        assert_ne!(c1.id, c2.id);
    }

    #[tokio::test]
    async fn sorts_limits_and_selects_fields() {
        let store = MemoryStore::new(schema());
        seed(&store).await;

        let query = EntityQuery::new()
            .sort(vec![SortField::desc("name")])
            .limit(1)
            .fields(Some(vec!["name".into()]));
        let found = store.find_many("api::category.category", &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content["name"], json!("Cat2"));
        assert!(!found[0].content.contains_key("articles"));
    }

    #[tokio::test]
    async fn update_merges_content_and_keeps_timestamps_when_silent() {
        let store = MemoryStore::new(schema());
        let (c1, _, _) = seed(&store).await;

        let updated = store
            .update(
                "api::category.category",
                c1.id,
                EntityPatch::silent(content(json!({"name": "Renamed"}))),
            )
            .await
            .unwrap();
        assert_eq!(updated.content["name"], json!("Renamed"));
        assert_eq!(updated.updated_at, c1.updated_at);

        let missing = store
            .update("api::category.category", 999, EntityPatch::default())
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn rollback_and_drop_restore_snapshot() {
        let store = MemoryStore::new(schema());
        seed(&store).await;

        let tx = store.begin().await.unwrap();
        tx.delete_many("api::category.category", None).await.unwrap();
        assert_eq!(tx.count("api::category.category", None).await.unwrap(), 0);
        tx.rollback().await.unwrap();
        assert_eq!(store.len("api::category.category").await, 2);

        {
            let tx = store.begin().await.unwrap();
            tx.create("api::category.category", NewEntity::new("Cat3")).await.unwrap();
        }
        assert_eq!(store.len("api::category.category").await, 2);

        let tx = store.begin().await.unwrap();
        tx.create("api::category.category", NewEntity::new("Cat3")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.len("api::category.category").await, 3);
    }

    #[tokio::test]
    async fn unknown_uid_is_an_error() {
        let store = MemoryStore::new(schema());
        let result = store.find_many("api::nope.nope", &EntityQuery::new()).await;
        assert!(matches!(result, Err(StoreError::Schema(_))));
    }
}
