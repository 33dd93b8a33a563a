//! Entity store abstraction.
//!
//! The document service never talks to a database directly. It reads and writes
//! physical rows (`Entity`) through these traits:
//! - `EntityQueries`: row-level reads and writes, shared by stores and transactions
//! - `EntityStore`: a store that can open transactions
//! - `StoreTransaction`: a unit of work that is committed or rolled back as a whole
//!
//! `MemoryStore` backs tests and embedded use, `PgEntityStore` persists to PostgreSQL.

pub mod memory;
pub mod populate;
pub mod postgres;

use async_trait::async_trait;
use document_service_query::{EvalError, FilterNode, Populate, SortField};
use thiserror::Error;

use crate::document::{Entity, EntityId, EntityPatch, NewEntity};
use crate::schema::SchemaError;

pub use memory::MemoryStore;
pub use postgres::PgEntityStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{uid} row {id} not found")]
    NotFound { uid: String, id: EntityId },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("filter evaluation failed: {0}")]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transaction error: {0}")]
    Transaction(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Row selection for `find_many` / `find_one`.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    pub filter: Option<FilterNode>,
    /// Empty means ascending `id`.
    pub sort: Vec<SortField>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Content attributes to return. Identity fields are always returned.
    pub fields: Option<Vec<String>>,
    pub populate: Populate,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: FilterNode) -> Self {
        self.filter = FilterNode::and_opt(self.filter.take(), Some(filter));
        self
    }

    pub fn filter_opt(mut self, filter: Option<FilterNode>) -> Self {
        self.filter = FilterNode::and_opt(self.filter.take(), filter);
        self
    }

    pub fn sort(mut self, sort: Vec<SortField>) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn fields(mut self, fields: Option<Vec<String>>) -> Self {
        self.fields = fields;
        self
    }

    pub fn populate(mut self, populate: Populate) -> Self {
        self.populate = populate;
        self
    }
}

/// Row-level operations on one content type (or component) table.
#[async_trait]
pub trait EntityQueries: Send + Sync {
    async fn find_many(&self, uid: &str, query: &EntityQuery) -> StoreResult<Vec<Entity>>;

    async fn find_one(&self, uid: &str, query: &EntityQuery) -> StoreResult<Option<Entity>> {
        let query = EntityQuery {
            limit: Some(1),
            ..query.clone()
        };
        Ok(self.find_many(uid, &query).await?.into_iter().next())
    }

    async fn count(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64>;

    async fn create(&self, uid: &str, entity: NewEntity) -> StoreResult<Entity>;

    async fn create_many(&self, uid: &str, entities: Vec<NewEntity>) -> StoreResult<Vec<Entity>> {
        let mut created = Vec::with_capacity(entities.len());
        for entity in entities {
            created.push(self.create(uid, entity).await?);
        }
        Ok(created)
    }

    /// Merge `patch` into row `id`. Fails with `StoreError::NotFound` if absent.
    async fn update(&self, uid: &str, id: EntityId, patch: EntityPatch) -> StoreResult<Entity>;

    /// Remove row `id`, returning it if it existed.
    async fn delete(&self, uid: &str, id: EntityId) -> StoreResult<Option<Entity>>;

    /// Remove every row matching `filter` (all rows when `None`). Returns the count.
    async fn delete_many(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64>;
}

/// A store that can open transactions.
#[async_trait]
pub trait EntityStore: EntityQueries {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    fn as_queries(&self) -> &dyn EntityQueries;
}

/// Dropping an unfinished transaction rolls it back.
#[async_trait]
pub trait StoreTransaction: EntityQueries {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;

    fn as_queries(&self) -> &dyn EntityQueries;
}
