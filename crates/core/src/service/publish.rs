//! Publish state machine for draft-and-publish types.
//!
//! Each `(documentId, locale)` has a draft slot and a published slot. `publish` copies the
//! draft into the published slot, `unpublish` empties the published slot and
//! `discard_draft` copies the published slot back into the draft slot.

use chrono::{DateTime, Utc};

use super::{finish, new_version, DocumentRepository, DocumentVersions};
use crate::document::validate::validate_document_id;
use crate::document::{generate_document_id, Entity, NewEntity, Status};
use crate::error::{DocumentError, DocumentResult};
use crate::events::DocumentEvent;
use crate::params::DocumentParams;
use crate::relations::relink_incoming;
use crate::store::EntityQueries;
use crate::transform::{transform_params_document_id, TransformedParams};

/// Target row for a copy of `source` into another slot: same document, locale, authorship
/// and timestamps.
fn copy_of(source: &Entity, published_at: Option<DateTime<Utc>>) -> NewEntity {
    let mut entity = NewEntity::new(source.document_id.as_str())
        .locale(source.locale.clone())
        .published_at(published_at);
    entity.created_at = Some(source.created_at);
    entity.updated_at = Some(source.updated_at);
    entity.created_by = source.created_by.clone();
    entity.updated_by = source.updated_by.clone();
    entity
}

impl DocumentRepository<'_> {
    /// Copy `draft` into its published slot, replacing any previous published row.
    pub(super) async fn publish_draft(
        &self,
        queries: &dyn EntityQueries,
        draft: &Entity,
    ) -> DocumentResult<Entity> {
        let previous = self
            .version(queries, &draft.document_id, draft.locale.as_deref(), Status::Published)
            .await?;
        if let Some(previous) = &previous {
            self.service
                .components
                .delete_components(queries, &self.uid, previous)
                .await?;
            queries.delete(&self.uid, previous.id).await?;
        }

        let target = copy_of(draft, Some(Utc::now()));
        let published = self
            .clone_version(queries, draft, target, Some(Status::Published), None)
            .await?;
        if let Some(previous) = previous {
            relink_incoming(self.schema(), queries, &self.uid, previous.id, Some(published.id))
                .await?;
        }
        tracing::info!(
            uid = %self.uid,
            document_id = %draft.document_id,
            locale = ?draft.locale,
            id = published.id,
            "published version"
        );
        Ok(published)
    }

    /// Publish the drafts of `document_id` in the requested locales (default locale when
    /// omitted). Locales without a draft are skipped.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn publish(
        &self,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<DocumentVersions> {
        validate_document_id(document_id)?;
        self.require_draft_and_publish()?;

        let tx = self.service.store.begin().await?;
        let result = self.publish_in(tx.as_queries(), document_id, params).await;
        let (published, events) = finish(tx, result).await?;
        self.emit(events);
        Ok(published)
    }

    async fn publish_in(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<(DocumentVersions, Vec<DocumentEvent>)> {
        let scope = self.locale_scope(params.locale.as_ref(), false);
        let drafts = self
            .versions(queries, document_id, scope, Some(Status::Draft))
            .await?;
        if drafts.is_empty() {
            return Err(DocumentError::not_found(&self.uid, document_id));
        }

        let shape = TransformedParams::default();
        let mut versions = DocumentVersions {
            document_id: document_id.to_string(),
            entries: Vec::with_capacity(drafts.len()),
        };
        let mut events = Vec::with_capacity(drafts.len());
        for draft in &drafts {
            let published = self.publish_draft(queries, draft).await?;
            let document = self.reload(queries, published.id, &shape).await?;
            events.push(DocumentEvent::Publish(self.entry_event(&published, document.clone())));
            versions.entries.push(document);
        }
        Ok((versions, events))
    }

    /// Remove the published versions of `document_id` in the requested locales. A
    /// published version without a draft is first copied back into the draft slot.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn unpublish(
        &self,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<DocumentVersions> {
        validate_document_id(document_id)?;
        self.require_draft_and_publish()?;

        let tx = self.service.store.begin().await?;
        let result = self.unpublish_in(tx.as_queries(), document_id, params).await;
        let (unpublished, events) = finish(tx, result).await?;
        self.emit(events);
        Ok(unpublished)
    }

    async fn unpublish_in(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<(DocumentVersions, Vec<DocumentEvent>)> {
        let scope = self.locale_scope(params.locale.as_ref(), false);
        let published = self
            .versions(queries, document_id, scope, Some(Status::Published))
            .await?;
        if published.is_empty() {
            return Err(DocumentError::not_found(&self.uid, document_id));
        }

        let shape = TransformedParams::default();
        let mut versions = DocumentVersions {
            document_id: document_id.to_string(),
            entries: Vec::with_capacity(published.len()),
        };
        let mut events = Vec::with_capacity(published.len());
        for row in published {
            let draft = self
                .version(queries, document_id, row.locale.as_deref(), Status::Draft)
                .await?;
            if draft.is_none() {
                tracing::debug!(
                    document_id,
                    locale = ?row.locale,
                    "restoring draft before unpublish"
                );
                self.clone_version(queries, &row, copy_of(&row, None), Some(Status::Draft), None)
                    .await?;
            }
            self.remove_version(queries, &row).await?;
            let document = self.render(row.clone(), &shape);
            events.push(DocumentEvent::Unpublish(self.entry_event(&row, document.clone())));
            versions.entries.push(document);
        }
        Ok((versions, events))
    }

    /// Replace the drafts of `document_id` in the requested locales by copies of their
    /// published versions.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn discard_draft(
        &self,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<DocumentVersions> {
        validate_document_id(document_id)?;
        self.require_draft_and_publish()?;

        let tx = self.service.store.begin().await?;
        let result = self.discard_draft_in(tx.as_queries(), document_id, params).await;
        let (drafts, events) = finish(tx, result).await?;
        self.emit(events);
        Ok(drafts)
    }

    async fn discard_draft_in(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<(DocumentVersions, Vec<DocumentEvent>)> {
        let scope = self.locale_scope(params.locale.as_ref(), false);
        let published = self
            .versions(queries, document_id, scope, Some(Status::Published))
            .await?;
        if published.is_empty() {
            return Err(DocumentError::not_found(&self.uid, document_id));
        }

        let shape = TransformedParams::default();
        let mut versions = DocumentVersions {
            document_id: document_id.to_string(),
            entries: Vec::with_capacity(published.len()),
        };
        let mut events = Vec::with_capacity(published.len());
        for row in &published {
            let previous = self
                .version(queries, document_id, row.locale.as_deref(), Status::Draft)
                .await?;
            if let Some(previous) = &previous {
                self.service
                    .components
                    .delete_components(queries, &self.uid, previous)
                    .await?;
                queries.delete(&self.uid, previous.id).await?;
            }
            let draft = self
                .clone_version(queries, row, copy_of(row, None), Some(Status::Draft), None)
                .await?;
            if let Some(previous) = previous {
                relink_incoming(self.schema(), queries, &self.uid, previous.id, Some(draft.id))
                    .await?;
            }
            let document = self.reload(queries, draft.id, &shape).await?;
            events.push(DocumentEvent::DraftDiscard(self.entry_event(&draft, document.clone())));
            versions.entries.push(document);
        }
        Ok((versions, events))
    }

    /// Duplicate the drafts of `document_id` (every locale unless restricted) into a new
    /// document, applying `data` as overrides.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn clone(
        &self,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<DocumentVersions> {
        validate_document_id(document_id)?;
        let tx = self.service.store.begin().await?;
        let result = self.clone_in(tx.as_queries(), document_id, params).await;
        let (cloned, events) = finish(tx, result).await?;
        self.emit(events);
        Ok(cloned)
    }

    async fn clone_in(
        &self,
        queries: &dyn EntityQueries,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<(DocumentVersions, Vec<DocumentEvent>)> {
        let scope = self.locale_scope(params.locale.as_ref(), true);
        let sources = self
            .versions(queries, document_id, scope, Some(Status::Draft))
            .await?;
        if sources.is_empty() {
            return Err(DocumentError::not_found(&self.uid, document_id));
        }

        let draft_and_publish = self.draft_and_publish();
        let status = if draft_and_publish {
            Status::Draft
        } else {
            params.status.unwrap_or_default()
        };
        let clone_id = generate_document_id();
        let mut versions = DocumentVersions {
            document_id: clone_id.clone(),
            entries: Vec::with_capacity(sources.len()),
        };
        let mut prepared = Vec::with_capacity(sources.len());
        for source in &sources {
            let ctx = self.relation_context(source.locale.as_deref(), status);
            let transformed =
                transform_params_document_id(self.schema(), queries, &self.uid, params, &ctx)
                    .await?;
            prepared.push((source, transformed));
        }

        let mut events = Vec::with_capacity(sources.len());
        for (source, transformed) in prepared {
            let target = new_version(
                &clone_id,
                source.locale.clone(),
                !draft_and_publish,
                params.actor.as_ref(),
            );
            let cloned = self
                .clone_version(queries, source, target, None, transformed.data.as_ref())
                .await?;
            let document = self.reload(queries, cloned.id, &transformed).await?;
            events.push(DocumentEvent::Create(self.entry_event(&cloned, document.clone())));
            versions.entries.push(document);
        }
        tracing::debug!(
            document_id,
            clone_id = %clone_id,
            versions = versions.entries.len(),
            "cloned document"
        );
        Ok((versions, events))
    }
}
