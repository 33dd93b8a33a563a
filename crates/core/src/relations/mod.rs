//! Relations resolver.
//!
//! Turns resolved relation inputs into stored link values, mirrors writes on inverse
//! attributes onto the owning side, re-resolves links when a version changes status,
//! and keeps incoming references pointing at live rows.

pub mod apply;

use std::collections::BTreeMap;

use document_service_query::FilterNode;
use serde_json::{Map, Value};

use crate::document::model::ID;
use crate::document::{link_ids, EntityId, EntityPatch, Status, ValidationError};
use crate::error::DocumentResult;
use crate::schema::{Attribute, SchemaRegistry};
use crate::store::{EntityQueries, EntityQuery};
use crate::transform::{IdMap, RelationInput};

pub use apply::{apply_relation_input, stored_value};

fn linked_to(attribute: &str, id: EntityId) -> FilterNode {
    FilterNode::nested(attribute, FilterNode::eq(ID, id))
}

/// Apply the owning-side inputs of `relations` to `content`.
pub fn apply_owner_links(
    schema: &SchemaRegistry,
    uid: &str,
    content: &mut Map<String, Value>,
    relations: &BTreeMap<String, RelationInput<EntityId>>,
) -> Result<(), ValidationError> {
    for (name, input) in relations {
        let Some(relation) = schema.relation(uid, name) else {
            continue;
        };
        if !relation.is_owner() {
            continue;
        }
        let to_many = relation.relation.is_to_many();
        let current = link_ids(content.get(name));
        let ids = apply_relation_input(name, current, input.clone(), to_many)?;
        content.insert(name.clone(), stored_value(ids, to_many));
    }
    Ok(())
}

/// Apply the inverse-side inputs of `relations` written on row `id` to the owning rows.
pub async fn apply_inverse_links(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    id: EntityId,
    relations: &BTreeMap<String, RelationInput<EntityId>>,
) -> DocumentResult<()> {
    for (name, input) in relations {
        let Some(relation) = schema.relation(uid, name) else {
            continue;
        };
        let Some(mapped_by) = relation.mapped_by.as_deref() else {
            continue;
        };
        let Some(owner) = schema.relation(&relation.target, mapped_by) else {
            tracing::warn!(
                uid,
                attribute = %name,
                mapped_by,
                "inverse relation without owning attribute"
            );
            continue;
        };
        let owner_to_many = owner.relation.is_to_many();
        let target = relation.target.as_str();

        let current_rows = queries
            .find_many(
                target,
                &EntityQuery::new()
                    .filter(linked_to(mapped_by, id))
                    .fields(Some(vec![mapped_by.to_string()])),
            )
            .await?;
        let current: Vec<EntityId> = current_rows.iter().map(|row| row.id).collect();
        let to_many = relation.relation.is_to_many();
        let next = apply_relation_input(name, current.clone(), input.clone(), to_many)?;

        for row in current_rows.iter().filter(|row| !next.contains(&row.id)) {
            let mut ids = link_ids(row.content.get(mapped_by));
            ids.retain(|linked| *linked != id);
            let patch = Map::from_iter([(mapped_by.to_string(), stored_value(ids, owner_to_many))]);
            queries.update(target, row.id, EntityPatch::silent(patch)).await?;
        }

        for added in next.iter().filter(|added| !current.contains(added)) {
            let query = EntityQuery::new()
                .filter(FilterNode::eq(ID, *added))
                .fields(Some(vec![mapped_by.to_string()]));
            let Some(row) = queries.find_one(target, &query).await? else {
                continue;
            };
            let mut ids = if owner_to_many {
                link_ids(row.content.get(mapped_by))
            } else {
                Vec::new()
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
            let patch = Map::from_iter([(mapped_by.to_string(), stored_value(ids, owner_to_many))]);
            queries.update(target, row.id, EntityPatch::silent(patch)).await?;
        }
    }
    Ok(())
}

/// Point every owning link stored in `content` at the `status` sibling of its target.
///
/// Targets without draft and publish keep their id; targets without a version in
/// `status` are dropped.
pub async fn reresolve_links(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    content: &mut Map<String, Value>,
    status: Status,
) -> DocumentResult<()> {
    let model = schema.get_model(uid)?;
    let owners: Vec<(&String, &str, bool)> = model
        .attributes()
        .iter()
        .filter_map(|(name, attribute)| match attribute {
            Attribute::Relation(relation) if relation.is_owner() && content.contains_key(name) => {
                Some((name, relation.target.as_str(), relation.relation.is_to_many()))
            }
            _ => None,
        })
        .filter(|(_, target, _)| schema.has_draft_and_publish(target))
        .collect();
    if owners.is_empty() {
        return Ok(());
    }

    let mut by_target: BTreeMap<&str, Vec<EntityId>> = BTreeMap::new();
    for (name, target, _) in &owners {
        by_target
            .entry(*target)
            .or_default()
            .extend(link_ids(content.get(name.as_str())));
    }
    let mut id_map = IdMap::new();
    for (target, ids) in &by_target {
        id_map.load_ids(queries, target, ids).await?;
    }

    for (name, target, to_many) in owners {
        let ids = link_ids(content.get(name.as_str()));
        let before = ids.len();
        let resolved: Vec<EntityId> = ids
            .into_iter()
            .filter_map(|id| id_map.sibling(target, id, status))
            .collect();
        if resolved.len() < before {
            tracing::debug!(
                uid,
                attribute = %name,
                %status,
                dropped = before - resolved.len(),
                "dropped links without a matching version"
            );
        }
        content.insert(name.clone(), stored_value(resolved, to_many));
    }
    Ok(())
}

/// Rewrite every owning link to row `old_id` of `uid` so it points at `new_id`, or
/// remove it when `new_id` is `None`. Returns the number of rows patched.
pub async fn relink_incoming(
    schema: &SchemaRegistry,
    queries: &dyn EntityQueries,
    uid: &str,
    old_id: EntityId,
    new_id: Option<EntityId>,
) -> DocumentResult<u64> {
    let mut patched = 0;
    for source in schema.relations_targeting(uid) {
        let query = EntityQuery::new()
            .filter(linked_to(source.attribute, old_id))
            .fields(Some(vec![source.attribute.to_string()]));
        let rows = queries.find_many(source.uid, &query).await?;
        let to_many = source.relation.relation.is_to_many();

        for row in rows {
            let mut ids: Vec<EntityId> = Vec::new();
            for id in link_ids(row.content.get(source.attribute)) {
                let id = if id == old_id { new_id } else { Some(id) };
                if let Some(id) = id.filter(|id| !ids.contains(id)) {
                    ids.push(id);
                }
            }
            let patch =
                Map::from_iter([(source.attribute.to_string(), stored_value(ids, to_many))]);
            queries.update(source.uid, row.id, EntityPatch::silent(patch)).await?;
            patched += 1;
        }
    }
    if patched > 0 {
        tracing::debug!(uid, old_id, new_id = ?new_id, patched, "relinked incoming references");
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NewEntity;
    use crate::store::MemoryStore;
    use crate::transform::Connect;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::from_json(json!({
                "contentTypes": [
                    {"uid": "api::article.article", "attributes": {
                        "title": {"type": "string"},
                        "categories": {
                            "type": "relation",
                            "relation": "manyToMany",
                            "target": "api::category.category",
                            "inversedBy": "articles"
                        },
                        "tag": {
                            "type": "relation",
                            "relation": "manyToOne",
                            "target": "api::tag.tag",
                            "inversedBy": "articles"
                        }
                    }},
                    {"uid": "api::category.category", "attributes": {
                        "name": {"type": "string"},
                        "articles": {
                            "type": "relation",
                            "relation": "manyToMany",
                            "target": "api::article.article",
                            "mappedBy": "categories"
                        }
                    }},
                    {"uid": "api::tag.tag", "draftAndPublish": false, "attributes": {
                        "articles": {
                            "type": "relation",
                            "relation": "oneToMany",
                            "target": "api::article.article",
                            "mappedBy": "tag"
                        }
                    }}
                ]
            }))
            .unwrap(),
        )
    }

    async fn row(
        store: &MemoryStore,
        uid: &str,
        document_id: &str,
        published: bool,
        content: Value,
    ) -> EntityId {
        let entity = NewEntity::new(document_id)
            .published_at(published.then(Utc::now))
            .content(content.as_object().cloned().unwrap_or_default());
        store.create(uid, entity).await.unwrap().id
    }

    async fn content(store: &MemoryStore, uid: &str, id: EntityId) -> Map<String, Value> {
        store
            .find_one(uid, &EntityQuery::new().filter(FilterNode::eq(ID, id)))
            .await
            .unwrap()
            .unwrap()
            .content
    }

    #[test]
    fn owner_links_skip_inverse_attributes() {
        let schema = schema();
        let mut content = Map::from_iter([("categories".to_string(), json!([1]))]);
        let relations = BTreeMap::from([
            (
                "categories".to_string(),
                RelationInput::Operations {
                    set: None,
                    connect: vec![Connect { target: 2, position: None }],
                    disconnect: Vec::new(),
                },
            ),
            ("articles".to_string(), RelationInput::List(vec![7])),
        ]);
        apply_owner_links(&schema, "api::article.article", &mut content, &relations).unwrap();
        assert_eq!(content["categories"], json!([1, 2]));
        assert!(!content.contains_key("articles"));
    }

    #[tokio::test]
    async fn inverse_writes_patch_owning_rows() {
        let schema = schema();
        let store = MemoryStore::new(schema.clone());
        let a1 = row(&store, "api::article.article", "A1", false, json!({"categories": []})).await;
        let a2 = row(&store, "api::article.article", "A2", false, json!({"categories": []})).await;
        let cat = row(&store, "api::category.category", "C1", false, json!({})).await;
        let tag = row(&store, "api::tag.tag", "T1", true, json!({})).await;

        let relations =
            BTreeMap::from([("articles".to_string(), RelationInput::List(vec![a1, a2]))]);
        apply_inverse_links(&schema, &store, "api::category.category", cat, &relations)
            .await
            .unwrap();
        assert_eq!(content(&store, "api::article.article", a1).await["categories"], json!([cat]));
        assert_eq!(content(&store, "api::article.article", a2).await["categories"], json!([cat]));

        let relations = BTreeMap::from([("articles".to_string(), RelationInput::List(vec![a2]))]);
        apply_inverse_links(&schema, &store, "api::category.category", cat, &relations)
            .await
            .unwrap();
        assert_eq!(content(&store, "api::article.article", a1).await["categories"], json!([]));

        let relations = BTreeMap::from([("articles".to_string(), RelationInput::Shorthand(a1))]);
        apply_inverse_links(&schema, &store, "api::tag.tag", tag, &relations).await.unwrap();
        assert_eq!(content(&store, "api::article.article", a1).await["tag"], json!(tag));
    }

    #[tokio::test]
    async fn reresolve_and_relink() {
        let schema = schema();
        let store = MemoryStore::new(schema.clone());
        let draft_cat = row(&store, "api::category.category", "C1", false, json!({})).await;
        let published_cat = row(&store, "api::category.category", "C1", true, json!({})).await;
        let lonely_cat = row(&store, "api::category.category", "C2", false, json!({})).await;
        let tag = row(&store, "api::tag.tag", "T1", true, json!({})).await;

        let mut links = Map::from_iter([
            ("categories".to_string(), json!([draft_cat, lonely_cat])),
            ("tag".to_string(), json!(tag)),
        ]);
        reresolve_links(&schema, &store, "api::article.article", &mut links, Status::Published)
            .await
            .unwrap();
        assert_eq!(links["categories"], json!([published_cat]));
        assert_eq!(links["tag"], json!(tag));

        let article = row(&store, "api::article.article", "A1", true, Value::Object(links)).await;
        let replacement = row(&store, "api::category.category", "C3", true, json!({})).await;
        let patched = relink_incoming(
            &schema,
            &store,
            "api::category.category",
            published_cat,
            Some(replacement),
        )
        .await
        .unwrap();
        assert_eq!(patched, 1);
        assert_eq!(
            content(&store, "api::article.article", article).await["categories"],
            json!([replacement])
        );

        relink_incoming(&schema, &store, "api::category.category", replacement, None)
            .await
            .unwrap();
        assert_eq!(content(&store, "api::article.article", article).await["categories"], json!([]));
    }
}
