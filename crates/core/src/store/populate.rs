//! Relation and component population shared by every store.
//!
//! Stores return rows with link attributes holding raw row ids. `populate_entities`
//! replaces the requested ones with the linked rows, issuing one query per attribute
//! for the whole batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use document_service_query::{FilterNode, Populate, PopulateEntry};
use serde_json::{Map, Value};

use super::{EntityQueries, EntityQuery, StoreError, StoreResult};
use crate::document::model::{is_identity_field, DOCUMENT_ID, ID};
use crate::document::{link_ids, Entity, EntityId};
use crate::schema::{Attribute, SchemaRegistry};

/// Resolve `populate` against the schema of `uid`: `*` expands to every relation and
/// component attribute.
pub fn expand_populate(
    schema: &SchemaRegistry,
    uid: &str,
    populate: &Populate,
) -> StoreResult<BTreeMap<String, PopulateEntry>> {
    let model = schema.get_model(uid)?;
    match populate {
        Populate::None => Ok(BTreeMap::new()),
        Populate::All => Ok(model
            .attributes()
            .iter()
            .filter(|(_, attribute)| attribute.is_link())
            .map(|(name, _)| (name.clone(), PopulateEntry::default()))
            .collect()),
        Populate::Attributes(entries) => {
            for name in entries.keys() {
                match model.attributes().get(name) {
                    Some(attribute) if attribute.is_link() => {}
                    Some(_) => {
                        return Err(StoreError::InvalidQuery(format!(
                            "`{name}` on {uid} is not a relation or component"
                        )))
                    }
                    None => {
                        return Err(StoreError::InvalidQuery(format!(
                            "cannot populate unknown attribute `{name}` on {uid}"
                        )))
                    }
                }
            }
            Ok(entries.clone())
        }
    }
}

/// Replace link ids with linked rows for every populated attribute, then trim content
/// to `fields` (populated attributes are always kept).
pub async fn shape_entities(
    queries: &dyn EntityQueries,
    schema: &SchemaRegistry,
    uid: &str,
    entities: &mut [Entity],
    query: &EntityQuery,
) -> StoreResult<()> {
    let populated = populate_entities(queries, schema, uid, entities, &query.populate).await?;
    if let Some(fields) = &query.fields {
        for entity in entities.iter_mut() {
            entity
                .content
                .retain(|key, _| fields.contains(key) || populated.contains(key));
        }
    }
    Ok(())
}

/// Returns the names of the attributes that were populated.
pub async fn populate_entities(
    queries: &dyn EntityQueries,
    schema: &SchemaRegistry,
    uid: &str,
    entities: &mut [Entity],
    populate: &Populate,
) -> StoreResult<BTreeSet<String>> {
    let entries = expand_populate(schema, uid, populate)?;
    if entries.is_empty() || entities.is_empty() {
        return Ok(entries.into_keys().collect());
    }
    let model = schema.get_model(uid)?;

    for (name, entry) in &entries {
        let Some(attribute) = model.attributes().get(name) else {
            continue;
        };
        match attribute {
            Attribute::Relation(relation) => match &relation.mapped_by {
                None => {
                    populate_links(
                        queries,
                        &relation.target,
                        name,
                        relation.relation.is_to_many(),
                        entities,
                        entry,
                    )
                    .await?
                }
                Some(mapped_by) => {
                    populate_inverse(
                        queries,
                        &relation.target,
                        name,
                        mapped_by,
                        relation.relation.is_to_many(),
                        entities,
                        entry,
                    )
                    .await?
                }
            },
            Attribute::Component(component) => {
                populate_links(
                    queries,
                    &component.component,
                    name,
                    component.repeatable,
                    entities,
                    entry,
                )
                .await?
            }
            Attribute::Scalar { .. } => {}
        }
    }
    Ok(entries.into_keys().collect())
}

fn nested_query(entry: &PopulateEntry, base: FilterNode) -> EntityQuery {
    EntityQuery::new()
        .filter(base)
        .filter_opt(entry.filters.clone())
        .sort(entry.sort.clone())
        .fields(entry.fields.clone())
        .populate(entry.populate.clone())
}

fn linked_value(rows: Vec<Value>, to_many: bool) -> Value {
    if to_many {
        Value::Array(rows)
    } else {
        rows.into_iter().next().unwrap_or(Value::Null)
    }
}

/// Owning relations and components: the row stores the linked ids.
async fn populate_links(
    queries: &dyn EntityQueries,
    target: &str,
    name: &str,
    to_many: bool,
    entities: &mut [Entity],
    entry: &PopulateEntry,
) -> StoreResult<()> {
    let ids: BTreeSet<EntityId> = entities
        .iter()
        .flat_map(|e| link_ids(e.content.get(name)))
        .collect();

    let linked: Vec<Entity> = if ids.is_empty() {
        Vec::new()
    } else {
        let base = FilterNode::is_in(ID, ids.into_iter().map(Value::from).collect());
        queries.find_many(target, &nested_query(entry, base)).await?
    };
    // Keep the stored order unless the populate entry asks for a sort.
    let rank: HashMap<EntityId, usize> =
        linked.iter().enumerate().map(|(i, e)| (e.id, i)).collect();
    let rows: HashMap<EntityId, Value> =
        linked.into_iter().map(|e| (e.id, e.into_value())).collect();

    for entity in entities.iter_mut() {
        let mut ids = link_ids(entity.content.get(name));
        if !entry.sort.is_empty() {
            ids.sort_by_key(|id| rank.get(id).copied().unwrap_or(usize::MAX));
        }
        let related = ids.iter().filter_map(|id| rows.get(id).cloned()).collect();
        entity.content.insert(name.to_string(), linked_value(related, to_many));
    }
    Ok(())
}

/// Inverse relations: the target rows store our ids in `mapped_by`.
async fn populate_inverse(
    queries: &dyn EntityQueries,
    target: &str,
    name: &str,
    mapped_by: &str,
    to_many: bool,
    entities: &mut [Entity],
    entry: &PopulateEntry,
) -> StoreResult<()> {
    let owner_ids: Vec<Value> = entities.iter().map(|e| Value::from(e.id)).collect();
    let base = FilterNode::nested(mapped_by, FilterNode::is_in(ID, owner_ids));

    let mut query = nested_query(entry, base);
    // The owning attribute is needed to group rows back onto their owners.
    let strip_mapped = match &mut query.fields {
        Some(fields) if !fields.iter().any(|f| f == mapped_by) => {
            fields.push(mapped_by.to_string());
            true
        }
        _ => false,
    };
    let linked = queries.find_many(target, &query).await?;

    let mut grouped: HashMap<EntityId, Vec<Value>> = HashMap::new();
    for mut row in linked {
        let owners = link_ids(row.content.get(mapped_by));
        if strip_mapped {
            row.content.remove(mapped_by);
        }
        let value = row.into_value();
        for owner in owners {
            grouped.entry(owner).or_default().push(value.clone());
        }
    }

    for entity in entities.iter_mut() {
        let related = grouped.remove(&entity.id).unwrap_or_default();
        entity.content.insert(name.to_string(), linked_value(related, to_many));
    }
    Ok(())
}

/// Keep the identity pair and the requested attributes of an output row.
pub fn project_row(row: &mut Map<String, Value>, fields: &[String]) {
    row.retain(|key, _| {
        key == ID
            || key == DOCUMENT_ID
            || fields.iter().any(|f| f == key)
            || !is_identity_field(key)
    });
}
