//! Document service.
//!
//! `DocumentService` owns the collaborators; `DocumentService::documents(uid)` hands out
//! a per-content-type `DocumentRepository` exposing the document operations. Every
//! operation that writes runs in one store transaction and emits its lifecycle events
//! after commit.

mod publish;
mod read;
mod write;

use std::sync::Arc;

use chrono::Utc;
use document_service_query::FilterNode;
use serde::Serialize;
use serde_json::Value;

use crate::components::{ComponentLifecycle, StoreComponents};
use crate::config::DocumentServiceConfig;
use crate::document::model::{DOCUMENT_ID, ID, LOCALE};
use crate::document::{Entity, EntityId, LocaleParam, NewEntity, Status, ValidationError};
use crate::error::{DocumentError, DocumentResult};
use crate::events::{DocumentEvent, EventBus};
use crate::params::DocumentParams;
use crate::relations::{apply_inverse_links, apply_owner_links, relink_incoming, reresolve_links};
use crate::schema::{Attribute, ContentKind, ContentType, SchemaRegistry};
use crate::store::{EntityQueries, EntityQuery, EntityStore, StoreTransaction};
use crate::transform::{
    status_filter, transform_output_document_id, DocumentData, OutputShape, RelationContext,
    TransformedParams,
};

pub use read::{DocumentPage, Pagination};

/// Result of an operation touching several versions of one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentVersions {
    pub document_id: String,
    pub entries: Vec<Value>,
}

#[derive(Clone)]
pub struct DocumentService {
    schema: Arc<SchemaRegistry>,
    store: Arc<dyn EntityStore>,
    components: Arc<dyn ComponentLifecycle>,
    events: EventBus,
    config: DocumentServiceConfig,
}

impl DocumentService {
    pub fn new(
        schema: Arc<SchemaRegistry>,
        store: Arc<dyn EntityStore>,
        components: Arc<dyn ComponentLifecycle>,
        events: EventBus,
        config: DocumentServiceConfig,
    ) -> Self {
        Self {
            schema,
            store,
            components,
            events,
            config,
        }
    }

    /// Service with the store-backed component lifecycle and a fresh event bus.
    pub fn with_store(
        schema: Arc<SchemaRegistry>,
        store: Arc<dyn EntityStore>,
        config: DocumentServiceConfig,
    ) -> Self {
        let components = Arc::new(StoreComponents::new(schema.clone()));
        let events = EventBus::new(config.event_bus_capacity);
        Self::new(schema, store, components, events, config)
    }

    pub fn documents(&self, uid: impl Into<String>) -> DocumentRepository<'_> {
        DocumentRepository {
            service: self,
            uid: uid.into(),
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &DocumentServiceConfig {
        &self.config
    }
}

/// Document operations on one content type.
pub struct DocumentRepository<'a> {
    service: &'a DocumentService,
    uid: String,
}

impl<'a> DocumentRepository<'a> {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    fn schema(&self) -> &'a SchemaRegistry {
        &self.service.schema
    }

    fn content_type(&self) -> DocumentResult<&'a ContentType> {
        Ok(self.service.schema.content_type(&self.uid)?)
    }

    fn is_single_type(&self) -> bool {
        self.content_type()
            .is_ok_and(|ct| ct.kind == ContentKind::SingleType)
    }

    fn localized(&self) -> bool {
        self.schema().is_localized(&self.uid)
    }

    fn draft_and_publish(&self) -> bool {
        self.schema().has_draft_and_publish(&self.uid)
    }

    fn require_draft_and_publish(&self) -> DocumentResult<()> {
        if self.draft_and_publish() {
            Ok(())
        } else {
            let message = format!("{} does not have draft and publish enabled", self.uid);
            Err(ValidationError::InvalidParams(message).into())
        }
    }

    fn default_locale(&self) -> &str {
        &self.service.config.default_locale
    }

    /// Locale context for relation resolution: the operation's locale, else the default.
    fn relation_context(&self, locale: Option<&str>, status: Status) -> RelationContext {
        let locale = locale.unwrap_or(self.default_locale());
        RelationContext::new(Some(locale.to_string()), status)
    }

    /// Locale of a write that targets exactly one version.
    fn write_locale(&self, params: &DocumentParams) -> DocumentResult<Option<String>> {
        if !self.localized() {
            return Ok(None);
        }
        match &params.locale {
            None => Ok(Some(self.default_locale().to_string())),
            Some(locale) => match locale.single() {
                Some(locale) => Ok(Some(locale.to_string())),
                None => {
                    let message = "this operation requires a single locale".to_string();
                    Err(ValidationError::InvalidParams(message).into())
                }
            },
        }
    }

    /// Row filter for the requested locales. An omitted locale means the default locale,
    /// or every locale when `omitted_means_all`.
    fn locale_scope(
        &self,
        locale: Option<&LocaleParam>,
        omitted_means_all: bool,
    ) -> Option<FilterNode> {
        if !self.localized() {
            return None;
        }
        match locale {
            None if omitted_means_all => None,
            None => Some(FilterNode::eq(LOCALE, self.default_locale())),
            Some(LocaleParam::All) => None,
            Some(LocaleParam::One(locale)) => Some(FilterNode::eq(LOCALE, locale.as_str())),
            Some(LocaleParam::Many(locales)) => Some(FilterNode::is_in(
                LOCALE,
                locales.iter().map(|l| Value::from(l.as_str())).collect(),
            )),
        }
    }

    fn document_filter(&self, document_id: &str) -> FilterNode {
        FilterNode::eq(DOCUMENT_ID, document_id)
    }

    /// Versions of `document_id` in `locale_scope`, optionally restricted to `status`.
    async fn versions(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        locale_scope: Option<FilterNode>,
        status: Option<Status>,
    ) -> DocumentResult<Vec<Entity>> {
        let query = EntityQuery::new()
            .filter(self.document_filter(document_id))
            .filter_opt(locale_scope)
            .filter_opt(status.and_then(|status| status_filter(self.schema(), &self.uid, status)));
        Ok(queries.find_many(&self.uid, &query).await?)
    }

    /// The single version of `document_id` in `locale` and `status`.
    async fn version(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        locale: Option<&str>,
        status: Status,
    ) -> DocumentResult<Option<Entity>> {
        let locale = match locale {
            Some(locale) => FilterNode::eq(LOCALE, locale),
            None => FilterNode::is_null(LOCALE),
        };
        let query = EntityQuery::new()
            .filter(self.document_filter(document_id))
            .filter(locale)
            .filter_opt(status_filter(self.schema(), &self.uid, status));
        Ok(queries.find_one(&self.uid, &query).await?)
    }

    fn render(&self, entity: Entity, params: &TransformedParams) -> Value {
        transform_output_document_id(
            self.schema(),
            &self.uid,
            entity.into_value(),
            OutputShape::new(params.fields.as_deref(), &params.populate),
        )
    }

    /// Reload row `id` with the caller's fields and populate, then render it.
    async fn reload(
        &self,
        queries: &dyn EntityQueries,
        id: EntityId,
        params: &TransformedParams,
    ) -> DocumentResult<Value> {
        let query = EntityQuery::new()
            .filter(FilterNode::eq(ID, id))
            .fields(params.fields.clone())
            .populate(params.populate.clone());
        let entity = queries
            .find_one(&self.uid, &query)
            .await?
            .ok_or_else(|| DocumentError::not_found(&self.uid, &id.to_string()))?;
        Ok(self.render(entity, params))
    }

    /// Insert one version built from resolved `data`.
    async fn insert_version(
        &self,
        queries: &dyn EntityQueries,
        entity: NewEntity,
        data: &DocumentData<EntityId>,
    ) -> DocumentResult<Entity> {
        let mut content = data.scalars.clone();
        apply_owner_links(self.schema(), &self.uid, &mut content, &data.relations)?;
        content.extend(
            self.service
                .components
                .create_components(queries, &self.uid, &data.components)
                .await?,
        );
        let created = queries.create(&self.uid, entity.content(content)).await?;
        apply_inverse_links(self.schema(), queries, &self.uid, created.id, &data.relations).await?;
        Ok(created)
    }

    /// Copy `source` into a new row described by `target`: content and owning links
    /// copied, components deep-cloned, links re-resolved to `status` when given, then
    /// `overrides` applied.
    async fn clone_version(
        &self,
        queries: &dyn EntityQueries,
        source: &Entity,
        target: NewEntity,
        status: Option<Status>,
        overrides: Option<&DocumentData<EntityId>>,
    ) -> DocumentResult<Entity> {
        let model = self.schema().get_model(&self.uid)?;
        let mut content = source.content.clone();
        content.retain(|key, _| {
            !matches!(model.attributes().get(key), Some(Attribute::Component(_)))
        });
        if let Some(status) = status {
            reresolve_links(self.schema(), queries, &self.uid, &mut content, status).await?;
        }

        let skip: Vec<String> = overrides
            .map(|data| data.components.keys().cloned().collect())
            .unwrap_or_default();
        content.extend(
            self.service
                .components
                .clone_components(queries, &self.uid, source, status, &skip)
                .await?,
        );

        if let Some(data) = overrides {
            content.extend(data.scalars.clone());
            apply_owner_links(self.schema(), &self.uid, &mut content, &data.relations)?;
            content.extend(
                self.service
                    .components
                    .create_components(queries, &self.uid, &data.components)
                    .await?,
            );
        }

        let created = queries.create(&self.uid, target.content(content)).await?;
        if let Some(data) = overrides {
            apply_inverse_links(self.schema(), queries, &self.uid, created.id, &data.relations)
                .await?;
        }
        Ok(created)
    }

    /// Remove one row with its components and every reference to it.
    async fn remove_version(
        &self,
        queries: &dyn EntityQueries,
        entity: &Entity,
    ) -> DocumentResult<()> {
        self.service
            .components
            .delete_components(queries, &self.uid, entity)
            .await?;
        relink_incoming(self.schema(), queries, &self.uid, entity.id, None).await?;
        queries.delete(&self.uid, entity.id).await?;
        Ok(())
    }

    fn emit(&self, events: Vec<DocumentEvent>) {
        for event in events {
            self.service.events.emit(event);
        }
    }
}

fn new_version(
    document_id: &str,
    locale: Option<String>,
    published: bool,
    actor: Option<&String>,
) -> NewEntity {
    let mut entity = NewEntity::new(document_id)
        .locale(locale)
        .published_at(published.then(Utc::now));
    entity.created_by = actor.cloned();
    entity.updated_by = actor.cloned();
    entity
}

/// Commit on success, roll back on error.
async fn finish<T>(tx: Box<dyn StoreTransaction>, result: DocumentResult<T>) -> DocumentResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(error = %rollback, "transaction rollback failed");
            }
            Err(err)
        }
    }
}
