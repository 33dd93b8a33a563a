//! Id-map and id-transform engine.
//!
//! Callers speak `documentId`; the entity store speaks physical `id`. Inputs are
//! rewritten on the way in (`transform_params_document_id`) and rows on the way out
//! (`transform_output_document_id`).

pub mod id_map;
pub mod input;
pub mod output;
pub mod query;

use document_service_query::{FilterNode, Populate, SortField};

use crate::document::EntityId;
use crate::error::DocumentResult;
use crate::params::DocumentParams;
use crate::schema::SchemaRegistry;
use crate::store::EntityQueries;

pub use id_map::{IdMap, RelationContext};
pub use input::{
    ComponentItem, ComponentValue, Connect, DocumentData, DocumentRef, Position, RelationInput,
};
pub use output::{transform_output_document_id, OutputShape};
pub use query::{
    status_filter, transform_fields, transform_filters, transform_populate, transform_sort,
};

/// Parameters rewritten for the entity store.
#[derive(Debug, Clone, Default)]
pub struct TransformedParams {
    pub data: Option<DocumentData<EntityId>>,
    pub filters: Option<FilterNode>,
    pub sort: Vec<SortField>,
    pub fields: Option<Vec<String>>,
    pub populate: Populate,
}

pub async fn transform_params_document_id(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    params: &DocumentParams,
    ctx: &RelationContext,
) -> DocumentResult<TransformedParams> {
    let data = match &params.data {
        Some(data) => {
            let parsed = DocumentData::parse(schema, uid, data)?;
            Some(transform_data(schema, queries, uid, parsed, ctx).await?)
        }
        None => None,
    };
    Ok(TransformedParams {
        data,
        filters: params.filters.clone().map(|f| transform_filters(schema, uid, f)),
        sort: transform_sort(schema, uid, params.sort.clone()),
        fields: transform_fields(params.fields.clone()),
        populate: transform_populate(schema, uid, &params.populate, ctx.status)?,
    })
}

/// Resolve every relation reference of `data` to a row id: register, batch load,
/// then rewrite.
pub async fn transform_data(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    data: DocumentData<DocumentRef>,
    ctx: &RelationContext,
) -> DocumentResult<DocumentData<EntityId>> {
    let mut id_map = IdMap::new();
    data.for_each_relation(schema, uid, &mut |model_uid, name, input| {
        if let Some(relation) = schema.relation(model_uid, name) {
            for reference in input.refs() {
                id_map.add(&relation.target, &reference.document_id);
            }
        }
    });
    id_map.load(queries).await?;

    data.try_map_relations(schema, uid, &mut |model_uid, name, input| {
        let Some(relation) = schema.relation(model_uid, name) else {
            return Ok(None);
        };
        let target = relation.target.as_str();
        let resolved =
            input.try_filter_map(|reference| id_map.resolve(schema, target, &reference, ctx))?;
        if resolved.is_none() {
            tracing::debug!(uid = model_uid, attribute = name, "relation input dropped");
        }
        Ok(resolved)
    })
}
