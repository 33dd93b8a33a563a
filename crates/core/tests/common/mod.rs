#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use document_service_core::document::{Entity, EntityId, EntityPatch, NewEntity};
use document_service_core::store::{
    EntityQueries, EntityQuery, StoreError, StoreResult, StoreTransaction,
};
use document_service_core::{
    DocumentParams, DocumentService, DocumentServiceConfig, EntityStore, MemoryStore,
    SchemaRegistry,
};
use document_service_query::FilterNode;
use serde_json::{json, Value};

pub const ARTICLE: &str = "api::article.article";
pub const CATEGORY: &str = "api::category.category";
pub const TAG: &str = "api::tag.tag";
pub const SHOP: &str = "api::shop.shop";
pub const PRODUCT: &str = "api::product.product";
pub const HOMEPAGE: &str = "api::homepage.homepage";

pub fn schema() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::from_json(json!({
            "contentTypes": [
                {"uid": ARTICLE, "localized": true, "attributes": {
                    "title": {"type": "string"},
                    "category": {"type": "relation", "relation": "manyToOne", "target": CATEGORY},
                    "tags": {"type": "relation", "relation": "manyToMany", "target": TAG},
                    "seo": {"type": "component", "component": "shared.seo"}
                }},
                {"uid": CATEGORY, "localized": true, "attributes": {
                    "name": {"type": "string"}
                }},
                {"uid": TAG, "draftAndPublish": false, "attributes": {
                    "name": {"type": "string"}
                }},
                {"uid": SHOP, "draftAndPublish": false, "attributes": {
                    "name": {"type": "string"},
                    "products": {"type": "relation", "relation": "manyToMany", "target": PRODUCT}
                }},
                {"uid": PRODUCT, "attributes": {
                    "name": {"type": "string"}
                }},
                {"uid": HOMEPAGE, "kind": "singleType", "attributes": {
                    "title": {"type": "string"}
                }}
            ],
            "components": [
                {"uid": "shared.seo", "attributes": {"metaTitle": {"type": "string"}}}
            ]
        }))
        .expect("valid schema"),
    )
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub service: DocumentService,
}

pub fn harness() -> Harness {
    let schema = schema();
    let store = Arc::new(MemoryStore::new(schema.clone()));
    let config = DocumentServiceConfig::default();
    let service = DocumentService::with_store(schema, store.clone(), config);
    Harness { store, service }
}

/// Service over a `FailingStore`, for tests that break a write partway through.
pub fn failing_harness() -> (Harness, Arc<FailingStore>) {
    let schema = schema();
    let store = Arc::new(MemoryStore::new(schema.clone()));
    let failing = Arc::new(FailingStore::new(store.clone()));
    let config = DocumentServiceConfig::default();
    let service = DocumentService::with_store(schema, failing.clone(), config);
    (Harness { store, service }, failing)
}

pub fn params(value: Value) -> DocumentParams {
    DocumentParams::from_json(&value).expect("valid params")
}

pub fn document_id(document: &Value) -> String {
    document["id"].as_str().expect("document id").to_string()
}

impl Harness {
    pub async fn create(&self, uid: &str, value: Value) -> Value {
        self.service
            .documents(uid)
            .create(&params(value))
            .await
            .expect("create")
    }

    pub async fn find(&self, uid: &str, document_id: &str, value: Value) -> Option<Value> {
        self.service
            .documents(uid)
            .find_one(document_id, &params(value))
            .await
            .expect("find_one")
    }

    pub async fn count(&self, uid: &str, value: Value) -> u64 {
        self.service
            .documents(uid)
            .count(&params(value))
            .await
            .expect("count")
    }
}

/// Row creates seen by a `FailingStore` and the countdown to the one that fails.
#[derive(Default)]
pub struct CreateCounter {
    created: AtomicUsize,
    countdown: AtomicUsize,
}

impl CreateCounter {
    /// Count one create; `true` when it is the armed one.
    fn trip(&self) -> bool {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    fn check(&self, uid: &str) -> StoreResult<()> {
        if self.trip() {
            return Err(StoreError::Transaction(format!("create in {uid} failed")));
        }
        Ok(())
    }
}

/// `MemoryStore` whose n-th create after `fail_create` fails.
pub struct FailingStore {
    inner: Arc<MemoryStore>,
    counter: Arc<CreateCounter>,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            counter: Arc::default(),
        }
    }

    pub fn fail_create(&self, nth: usize) {
        self.counter.countdown.store(nth, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.counter.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityQueries for FailingStore {
    async fn find_many(&self, uid: &str, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
        self.inner.find_many(uid, query).await
    }

    async fn count(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        self.inner.count(uid, filter).await
    }

    async fn create(&self, uid: &str, entity: NewEntity) -> StoreResult<Entity> {
        self.counter.check(uid)?;
        self.inner.create(uid, entity).await
    }

    async fn update(&self, uid: &str, id: EntityId, patch: EntityPatch) -> StoreResult<Entity> {
        self.inner.update(uid, id, patch).await
    }

    async fn delete(&self, uid: &str, id: EntityId) -> StoreResult<Option<Entity>> {
        self.inner.delete(uid, id).await
    }

    async fn delete_many(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        self.inner.delete_many(uid, filter).await
    }
}

#[async_trait]
impl EntityStore for FailingStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(FailingTransaction {
            inner,
            counter: self.counter.clone(),
        }))
    }

    fn as_queries(&self) -> &dyn EntityQueries {
        self
    }
}

struct FailingTransaction {
    inner: Box<dyn StoreTransaction>,
    counter: Arc<CreateCounter>,
}

#[async_trait]
impl EntityQueries for FailingTransaction {
    async fn find_many(&self, uid: &str, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
        self.inner.as_queries().find_many(uid, query).await
    }

    async fn count(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        self.inner.as_queries().count(uid, filter).await
    }

    async fn create(&self, uid: &str, entity: NewEntity) -> StoreResult<Entity> {
        self.counter.check(uid)?;
        self.inner.as_queries().create(uid, entity).await
    }

    async fn update(&self, uid: &str, id: EntityId, patch: EntityPatch) -> StoreResult<Entity> {
        self.inner.as_queries().update(uid, id, patch).await
    }

    async fn delete(&self, uid: &str, id: EntityId) -> StoreResult<Option<Entity>> {
        self.inner.as_queries().delete(uid, id).await
    }

    async fn delete_many(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        self.inner.as_queries().delete_many(uid, filter).await
    }
}

#[async_trait]
impl StoreTransaction for FailingTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }

    fn as_queries(&self) -> &dyn EntityQueries {
        self
    }
}
