use serde::Serialize;
use serde_json::Value;

use super::DocumentRepository;
use crate::document::validate::validate_document_id;
use crate::document::{Status, ValidationError};
use crate::error::DocumentResult;
use crate::metadata::{format_document_with_metadata, DocumentWithMetadata, MetadataOptions};
use crate::params::DocumentParams;
use crate::store::EntityQuery;
use crate::transform::{status_filter, transform_params_document_id, TransformedParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u64,
    pub page_size: u64,
    pub page_count: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentPage {
    pub results: Vec<Value>,
    pub pagination: Pagination,
}

/// `(page, pageSize)` normalized against the configured bounds.
fn page_bounds(
    page: Option<u64>,
    page_size: Option<u64>,
    default_size: u64,
    max_size: u64,
) -> (u64, u64) {
    let size = page_size.unwrap_or(default_size).clamp(1, max_size.max(1));
    (page.unwrap_or(1).max(1), size)
}

/// Row offset of `page`. Fails when the page lies beyond any addressable row.
fn page_offset(page: u64, page_size: u64) -> DocumentResult<u64> {
    (page - 1).checked_mul(page_size).ok_or_else(|| {
        ValidationError::InvalidParams(format!("page {page} is out of range")).into()
    })
}

/// `(offset, limit)` for a list read: `page`/`pageSize` win over `start`/`limit`.
fn window(
    params: &DocumentParams,
    default_size: u64,
    max_size: u64,
) -> DocumentResult<(Option<u64>, Option<u64>)> {
    if params.page.is_some() || params.page_size.is_some() {
        let (page, size) = page_bounds(params.page, params.page_size, default_size, max_size);
        return Ok((Some(page_offset(page, size)?), Some(size)));
    }
    Ok((params.start, params.limit.map(|limit| limit.min(max_size))))
}

impl DocumentRepository<'_> {
    fn read_status(&self, params: &DocumentParams) -> Status {
        params.status.unwrap_or_default()
    }

    async fn transform_read(&self, params: &DocumentParams) -> DocumentResult<TransformedParams> {
        let ctx = self.relation_context(params.single_locale(), self.read_status(params));
        let queries = self.service.store.as_queries();
        if params.data.is_some() {
            tracing::debug!(uid = %self.uid, "ignoring `data` on a read");
            let params = DocumentParams {
                data: None,
                ..params.clone()
            };
            return transform_params_document_id(self.schema(), queries, &self.uid, &params, &ctx)
                .await;
        }
        transform_params_document_id(self.schema(), queries, &self.uid, params, &ctx).await
    }

    fn read_query(&self, params: &DocumentParams, transformed: &TransformedParams) -> EntityQuery {
        EntityQuery::new()
            .filter_opt(status_filter(self.schema(), &self.uid, self.read_status(params)))
            .filter_opt(self.locale_scope(params.locale.as_ref(), false))
            .filter_opt(transformed.filters.clone())
            .sort(transformed.sort.clone())
            .fields(transformed.fields.clone())
            .populate(transformed.populate.clone())
    }

    /// The version of `document_id` matching the requested locale and status.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn find_one(
        &self,
        document_id: &str,
        params: &DocumentParams,
    ) -> DocumentResult<Option<Value>> {
        validate_document_id(document_id)?;
        let transformed = self.transform_read(params).await?;
        let query = self
            .read_query(params, &transformed)
            .filter(self.document_filter(document_id));
        let found = self
            .service
            .store
            .as_queries()
            .find_one(&self.uid, &query)
            .await?;
        Ok(found.map(|entity| self.render(entity, &transformed)))
    }

    /// Like `find_one`, with the version's metadata and derived `status` attached.
    #[tracing::instrument(skip(self, params, options), fields(uid = %self.uid))]
    pub async fn find_one_with_metadata(
        &self,
        document_id: &str,
        params: &DocumentParams,
        options: MetadataOptions,
    ) -> DocumentResult<Option<DocumentWithMetadata>> {
        validate_document_id(document_id)?;
        let transformed = self.transform_read(params).await?;
        let query = self
            .read_query(params, &transformed)
            .filter(self.document_filter(document_id));
        let queries = self.service.store.as_queries();
        let Some(entity) = queries.find_one(&self.uid, &query).await? else {
            return Ok(None);
        };
        let data = self.render(entity.clone(), &transformed);
        let formatted =
            format_document_with_metadata(self.schema(), queries, &self.uid, &entity, data, options)
                .await?;
        Ok(Some(formatted))
    }

    /// First version matching the parameters.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn find_first(&self, params: &DocumentParams) -> DocumentResult<Option<Value>> {
        let transformed = self.transform_read(params).await?;
        let query = self.read_query(params, &transformed);
        let found = self
            .service
            .store
            .as_queries()
            .find_one(&self.uid, &query)
            .await?;
        Ok(found.map(|entity| self.render(entity, &transformed)))
    }

    /// Versions matching the parameters, windowed by `start`/`limit` or `page`/`pageSize`.
    /// A single type yields at most one result.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn find_many(&self, params: &DocumentParams) -> DocumentResult<Vec<Value>> {
        let transformed = self.transform_read(params).await?;
        let config = &self.service.config;
        let (offset, limit) = window(params, config.default_page_size, config.max_page_size)?;
        let limit = if self.is_single_type() { Some(1) } else { limit };

        let mut query = self.read_query(params, &transformed);
        query.offset = offset;
        query.limit = limit;
        let rows = self
            .service
            .store
            .as_queries()
            .find_many(&self.uid, &query)
            .await?;
        Ok(rows
            .into_iter()
            .map(|entity| self.render(entity, &transformed))
            .collect())
    }

    /// One page of results with pagination totals.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn find_page(&self, params: &DocumentParams) -> DocumentResult<DocumentPage> {
        let transformed = self.transform_read(params).await?;
        let config = &self.service.config;
        let (page, page_size) = page_bounds(
            params.page,
            params.page_size,
            config.default_page_size,
            config.max_page_size,
        );
        let offset = page_offset(page, page_size)?;

        let query = self
            .read_query(params, &transformed)
            .offset(offset)
            .limit(page_size);
        let queries = self.service.store.as_queries();
        let (rows, total) = tokio::try_join!(
            queries.find_many(&self.uid, &query),
            queries.count(&self.uid, query.filter.as_ref()),
        )?;

        Ok(DocumentPage {
            results: rows
                .into_iter()
                .map(|entity| self.render(entity, &transformed))
                .collect(),
            pagination: Pagination {
                page,
                page_size,
                page_count: total.div_ceil(page_size),
                total,
            },
        })
    }

    /// Number of versions matching the status, locale and filters.
    #[tracing::instrument(skip(self, params), fields(uid = %self.uid))]
    pub async fn count(&self, params: &DocumentParams) -> DocumentResult<u64> {
        let transformed = self.transform_read(params).await?;
        let query = self.read_query(params, &transformed);
        Ok(self
            .service
            .store
            .as_queries()
            .count(&self.uid, query.filter.as_ref())
            .await?)
    }
}
