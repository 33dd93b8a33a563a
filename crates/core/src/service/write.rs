use chrono::Utc;
use serde_json::{Map, Value};

use super::{finish, new_version, DocumentRepository, DocumentVersions};
use crate::document::validate::validate_document_id;
use crate::document::{generate_document_id, Entity, EntityId, EntityPatch, Status, ValidationError};
use crate::error::{DocumentError, DocumentResult};
use crate::events::{DocumentEvent, EntryEvent};
use crate::params::DocumentParams;
use crate::relations::{apply_inverse_links, apply_owner_links};
use crate::store::EntityQueries;
use crate::transform::{
    transform_params_document_id, DocumentData, RelationContext, TransformedParams,
};

impl DocumentRepository<'_> {
    /// Status that relation inputs of a write resolve to. Draft-and-publish types always
    /// write drafts; other types take the caller's status.
    fn write_status(&self, params: &DocumentParams) -> Status {
        if self.draft_and_publish() {
            Status::Draft
        } else {
            params.status.unwrap_or_default()
        }
    }

    pub(super) fn entry_event(&self, entity: &Entity, document: Value) -> EntryEvent {
        EntryEvent::new(&self.uid, &entity.document_id, entity.locale.clone(), document)
    }

    async fn transform_write(
        &self,
        queries: &dyn EntityQueries,
        params: &DocumentParams,
        ctx: &RelationContext,
    ) -> DocumentResult<(TransformedParams, DocumentData<EntityId>)> {
        let mut transformed =
            transform_params_document_id(self.schema(), queries, &self.uid, params, ctx).await?;
        let data = transformed.data.take().unwrap_or_default();
        Ok((transformed, data))
    }

    /// Create a document. Draft-and-publish types get a draft, published in the same
    /// transaction when `status` is `published`.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn create(&self, params: &DocumentParams) -> DocumentResult<Value> {
        if params.data.is_none() {
            return Err(ValidationError::MissingData.into());
        }
        let locale = self.write_locale(params)?;
        let ctx = self.relation_context(locale.as_deref(), self.write_status(params));
        let document_id = generate_document_id();

        let tx = self.service.store.begin().await?;
        let result = self
            .create_in(tx.as_queries(), &document_id, locale, params, &ctx)
            .await;
        let (document, events) = finish(tx, result).await?;
        self.emit(events);
        Ok(document)
    }

    async fn create_in(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        locale: Option<String>,
        params: &DocumentParams,
        ctx: &RelationContext,
    ) -> DocumentResult<(Value, Vec<DocumentEvent>)> {
        let (transformed, data) = self.transform_write(queries, params, ctx).await?;
        let draft_and_publish = self.draft_and_publish();
        let entity = new_version(document_id, locale, !draft_and_publish, params.actor.as_ref());
        let created = self.insert_version(queries, entity, &data).await?;

        let document = self.reload(queries, created.id, &transformed).await?;
        let mut events = vec![DocumentEvent::Create(self.entry_event(&created, document.clone()))];
        if draft_and_publish && params.status == Some(Status::Published) {
            let published = self.publish_draft(queries, &created).await?;
            let document = self.reload(queries, published.id, &transformed).await?;
            events.push(DocumentEvent::Publish(self.entry_event(&published, document.clone())));
            return Ok((document, events));
        }
        Ok((document, events))
    }

    /// Update the draft of `document_id` in the requested locale, creating that locale's
    /// draft when the document exists only in other locales.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn update(
        &self,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<Value> {
        validate_document_id(document_id)?;
        if self.draft_and_publish() && params.status == Some(Status::Published) {
            return Err(ValidationError::PublishedUpdate.into());
        }
        let locale = self.write_locale(params)?;
        let ctx = self.relation_context(locale.as_deref(), self.write_status(params));

        let tx = self.service.store.begin().await?;
        let result = self
            .update_in(tx.as_queries(), document_id, locale, params, &ctx)
            .await;
        let (document, event) = finish(tx, result).await?;
        self.emit(vec![event]);
        Ok(document)
    }

    async fn update_in(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        locale: Option<String>,
        params: &DocumentParams,
        ctx: &RelationContext,
    ) -> DocumentResult<(Value, DocumentEvent)> {
        let existing = self
            .version(queries, document_id, locale.as_deref(), Status::Draft)
            .await?;
        if existing.is_none() && self.versions(queries, document_id, None, None).await?.is_empty() {
            return Err(DocumentError::not_found(&self.uid, document_id));
        }

        let (transformed, data) = self.transform_write(queries, params, ctx).await?;
        let Some(existing) = existing else {
            tracing::debug!(document_id, locale = ?locale, "creating locale version on update");
            let published = !self.draft_and_publish();
            let entity = new_version(document_id, locale, published, params.actor.as_ref());
            let created = self.insert_version(queries, entity, &data).await?;
            let document = self.reload(queries, created.id, &transformed).await?;
            let event = DocumentEvent::Create(self.entry_event(&created, document.clone()));
            return Ok((document, event));
        };

        let mut content: Map<String, Value> = existing.content.clone();
        content.extend(data.scalars.clone());
        apply_owner_links(self.schema(), &self.uid, &mut content, &data.relations)?;
        content.extend(
            self.service
                .components
                .update_components(queries, &self.uid, &existing, &data.components)
                .await?,
        );
        let patch = EntityPatch {
            content,
            updated_at: Some(Utc::now()),
            updated_by: params.actor.clone(),
        };
        let updated = queries.update(&self.uid, existing.id, patch).await?;
        apply_inverse_links(self.schema(), queries, &self.uid, updated.id, &data.relations).await?;

        let document = self.reload(queries, updated.id, &transformed).await?;
        Ok((document.clone(), DocumentEvent::Update(self.entry_event(&updated, document))))
    }

    /// Delete every version of `document_id`, or only those in the explicitly requested
    /// locales.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn delete(
        &self,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<DocumentVersions> {
        validate_document_id(document_id)?;
        let tx = self.service.store.begin().await?;
        let result = self.delete_in(tx.as_queries(), document_id, params).await;
        let (deleted, events) = finish(tx, result).await?;
        self.emit(events);
        Ok(deleted)
    }

    async fn delete_in(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<(DocumentVersions, Vec<DocumentEvent>)> {
        let scope = self.locale_scope(params.locale.as_ref(), true);
        let rows = self.versions(queries, document_id, scope, None).await?;
        if rows.is_empty() {
            return Err(DocumentError::not_found(&self.uid, document_id));
        }

        let shape = TransformedParams::default();
        let mut entries = Vec::with_capacity(rows.len());
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            self.remove_version(queries, &row).await?;
            let document = self.render(row.clone(), &shape);
            events.push(DocumentEvent::Delete(self.entry_event(&row, document.clone())));
            entries.push(document);
        }
        Ok((
            DocumentVersions {
                document_id: document_id.to_string(),
                entries,
            },
            events,
        ))
    }
}
