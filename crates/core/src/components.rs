//! Component lifecycle.
//!
//! Component rows belong to exactly one owner row. The owner stores their ids; the
//! lifecycle creates, updates, deletes and deep-clones them, always through the
//! caller's query handle so the work joins the caller's transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use document_service_query::FilterNode;
use serde_json::{Map, Value};

use crate::document::model::ID;
use crate::document::{
    generate_document_id, link_ids, Entity, EntityId, EntityPatch, NewEntity, Status,
};
use crate::error::DocumentResult;
use crate::relations::{apply_owner_links, reresolve_links, stored_value};
use crate::schema::{Attribute, ComponentAttribute, SchemaRegistry};
use crate::store::{EntityQueries, EntityQuery};
use crate::transform::{ComponentItem, ComponentValue};

/// Resolved component input of one owner row, by attribute.
pub type ComponentInput = BTreeMap<String, ComponentValue<EntityId>>;

/// Link values to merge into the owner row, by attribute.
pub type ComponentLinks = Map<String, Value>;

#[async_trait]
pub trait ComponentLifecycle: Send + Sync {
    /// Component rows of `entity`, by attribute, in stored order.
    async fn get_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
    ) -> DocumentResult<BTreeMap<String, Vec<Entity>>>;

    async fn create_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        input: &ComponentInput,
    ) -> DocumentResult<ComponentLinks>;

    /// Items carrying a known component id are updated, the others created, and rows
    /// no longer referenced deleted.
    async fn update_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
        input: &ComponentInput,
    ) -> DocumentResult<ComponentLinks>;

    async fn delete_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
    ) -> DocumentResult<()>;

    /// Deep-clone the component rows of `entity`, skipping the attributes in `skip`.
    /// With a `status`, relations inside the clones are re-resolved to that status.
    async fn clone_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
        status: Option<Status>,
        skip: &[String],
    ) -> DocumentResult<ComponentLinks>;
}

/// Component rows stored in the entity store under the component uid.
#[derive(Debug, Clone)]
pub struct StoreComponents {
    schema: Arc<SchemaRegistry>,
}

impl StoreComponents {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self { schema }
    }

    fn component_attributes<'a>(
        &'a self,
        uid: &str,
    ) -> DocumentResult<Vec<(&'a String, &'a ComponentAttribute)>> {
        let model = self.schema.get_model(uid)?;
        Ok(model
            .attributes()
            .iter()
            .filter_map(|(name, attribute)| match attribute {
                Attribute::Component(component) => Some((name, component)),
                _ => None,
            })
            .collect())
    }

    fn component_of(&self, uid: &str, name: &str) -> Option<&ComponentAttribute> {
        self.schema.attribute(uid, name).and_then(Attribute::as_component)
    }

    async fn load_rows(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        ids: &[EntityId],
    ) -> DocumentResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_values = ids.iter().map(|id| Value::from(*id)).collect();
        let query = EntityQuery::new().filter(FilterNode::is_in(ID, id_values));
        let mut rows: HashMap<EntityId, Entity> = queries
            .find_many(uid, &query)
            .await?
            .into_iter()
            .map(|row| (row.id, row))
            .collect();
        Ok(ids.iter().filter_map(|id| rows.remove(id)).collect())
    }

    async fn create_item(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        item: &ComponentItem<EntityId>,
    ) -> DocumentResult<EntityId> {
        let mut content = item.data.scalars.clone();
        apply_owner_links(&self.schema, uid, &mut content, &item.data.relations)?;
        content.extend(self.create_components(queries, uid, &item.data.components).await?);
        let row = queries
            .create(uid, NewEntity::new(generate_document_id()).content(content))
            .await?;
        Ok(row.id)
    }

    async fn update_item(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        row: &Entity,
        item: &ComponentItem<EntityId>,
    ) -> DocumentResult<EntityId> {
        let mut content = row.content.clone();
        content.extend(item.data.scalars.clone());
        apply_owner_links(&self.schema, uid, &mut content, &item.data.relations)?;
        content.extend(self.update_components(queries, uid, row, &item.data.components).await?);
        queries.update(uid, row.id, EntityPatch::silent(content)).await?;
        Ok(row.id)
    }

    async fn delete_row(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        row: &Entity,
    ) -> DocumentResult<()> {
        self.delete_components(queries, uid, row).await?;
        queries.delete(uid, row.id).await?;
        Ok(())
    }
}

#[async_trait]
impl ComponentLifecycle for StoreComponents {
    async fn get_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
    ) -> DocumentResult<BTreeMap<String, Vec<Entity>>> {
        let mut components = BTreeMap::new();
        for (name, component) in self.component_attributes(uid)? {
            let ids = link_ids(entity.content.get(name));
            let rows = self.load_rows(queries, &component.component, &ids).await?;
            components.insert(name.clone(), rows);
        }
        Ok(components)
    }

    async fn create_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        input: &ComponentInput,
    ) -> DocumentResult<ComponentLinks> {
        let mut links = Map::new();
        for (name, component) in self.component_attributes(uid)? {
            let Some(value) = input.get(name) else {
                continue;
            };
            let mut ids = Vec::new();
            for item in value.items() {
                ids.push(self.create_item(queries, &component.component, item).await?);
            }
            links.insert(name.clone(), stored_value(ids, component.repeatable));
        }
        Ok(links)
    }

    async fn update_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
        input: &ComponentInput,
    ) -> DocumentResult<ComponentLinks> {
        let mut links = Map::new();
        for (name, component) in self.component_attributes(uid)? {
            let Some(value) = input.get(name) else {
                continue;
            };
            let existing = self
                .load_rows(queries, &component.component, &link_ids(entity.content.get(name)))
                .await?;
            let mut ids = Vec::new();
            for item in value.items() {
                let id = match item.id.and_then(|id| existing.iter().find(|row| row.id == id)) {
                    Some(row) => self.update_item(queries, &component.component, row, item).await?,
                    None => self.create_item(queries, &component.component, item).await?,
                };
                ids.push(id);
            }
            for row in existing.iter().filter(|row| !ids.contains(&row.id)) {
                self.delete_row(queries, &component.component, row).await?;
            }
            links.insert(name.clone(), stored_value(ids, component.repeatable));
        }
        Ok(links)
    }

    async fn delete_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
    ) -> DocumentResult<()> {
        for (name, rows) in self.get_components(queries, uid, entity).await? {
            let Some(component) = self.component_of(uid, &name) else {
                continue;
            };
            for row in &rows {
                self.delete_row(queries, &component.component, row).await?;
            }
        }
        Ok(())
    }

    async fn clone_components(
        &self,
        queries: &dyn EntityQueries,
        uid: &str,
        entity: &Entity,
        status: Option<Status>,
        skip: &[String],
    ) -> DocumentResult<ComponentLinks> {
        let mut links = Map::new();
        for (name, rows) in self.get_components(queries, uid, entity).await? {
            if skip.contains(&name) {
                continue;
            }
            let Some(component) = self.component_of(uid, &name) else {
                continue;
            };
            let mut ids = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut content = row.content.clone();
                if let Some(status) = status {
                    let target = &component.component;
                    reresolve_links(&self.schema, queries, target, &mut content, status).await?;
                }
                content.extend(
                    self.clone_components(queries, &component.component, row, status, &[])
                        .await?,
                );
                let row = NewEntity::new(generate_document_id()).content(content);
                let clone = queries.create(&component.component, row).await?;
                ids.push(clone.id);
            }
            links.insert(name, stored_value(ids, component.repeatable));
        }
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{DocumentData, RelationInput};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::from_json(json!({
                "contentTypes": [
                    {"uid": "api::page.page", "attributes": {
                        "title": {"type": "string"},
                        "seo": {"type": "component", "component": "shared.seo"},
                        "blocks": {
                            "type": "component", "component": "shared.block", "repeatable": true
                        }
                    }},
                    {"uid": "api::category.category", "attributes": {"name": {"type": "string"}}}
                ],
                "components": [
                    {"uid": "shared.seo", "attributes": {
                        "meta": {"type": "string"},
                        "category": {
                            "type": "relation",
                            "relation": "oneToOne",
                            "target": "api::category.category"
                        }
                    }},
                    {"uid": "shared.block", "attributes": {
                        "text": {"type": "string"},
                        "seo": {"type": "component", "component": "shared.seo"}
                    }}
                ]
            }))
            .unwrap(),
        )
    }

    fn item(id: Option<EntityId>, scalars: Value) -> ComponentItem<EntityId> {
        ComponentItem {
            id,
            data: DocumentData {
                scalars: scalars.as_object().cloned().unwrap_or_default(),
                ..DocumentData::default()
            },
        }
    }

    async fn owner(store: &MemoryStore, links: ComponentLinks) -> Entity {
        store
            .create("api::page.page", NewEntity::new("Page1").content(links))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_nested_components_and_delete_cascade() {
        let schema = schema();
        let store = MemoryStore::new(schema.clone());
        let components = StoreComponents::new(schema);

        let mut nested = item(None, json!({"text": "one"}));
        let inner = item(None, json!({"meta": "inner"}));
        nested
            .data
            .components
            .insert("seo".into(), ComponentValue::Single(Some(inner)));
        let input = ComponentInput::from([
            ("seo".to_string(), ComponentValue::Single(Some(item(None, json!({"meta": "m"}))))),
            (
                "blocks".to_string(),
                ComponentValue::Repeatable(vec![nested, item(None, json!({"text": "two"}))]),
            ),
        ]);
        let links = components.create_components(&store, "api::page.page", &input).await.unwrap();
        assert!(links["seo"].is_i64());
        assert_eq!(links["blocks"].as_array().unwrap().len(), 2);
        assert_eq!(store.len("shared.seo").await, 2);
        assert_eq!(store.len("shared.block").await, 2);

        let page = owner(&store, links).await;
        let loaded = components.get_components(&store, "api::page.page", &page).await.unwrap();
        assert_eq!(loaded["blocks"][0].content["text"], "one");
        assert_eq!(loaded["blocks"][1].content["text"], "two");

        components.delete_components(&store, "api::page.page", &page).await.unwrap();
        assert!(store.is_empty("shared.seo").await);
        assert!(store.is_empty("shared.block").await);
    }

    #[tokio::test]
    async fn update_keeps_known_items_and_drops_the_rest() {
        let schema = schema();
        let store = MemoryStore::new(schema.clone());
        let components = StoreComponents::new(schema);

        let input = ComponentInput::from([(
            "blocks".to_string(),
            ComponentValue::Repeatable(vec![
                item(None, json!({"text": "one"})),
                item(None, json!({"text": "two"})),
            ]),
        )]);
        let links = components
            .create_components(&store, "api::page.page", &input)
            .await
            .unwrap();
        let page = owner(&store, links).await;
        let ids = link_ids(page.content.get("blocks"));

        let update = ComponentInput::from([(
            "blocks".to_string(),
            ComponentValue::Repeatable(vec![
                item(Some(ids[1]), json!({"text": "two!"})),
                item(None, json!({"text": "three"})),
            ]),
        )]);
        let links = components
            .update_components(&store, "api::page.page", &page, &update)
            .await
            .unwrap();
        let new_ids = link_ids(links.get("blocks"));
        assert_eq!(new_ids[0], ids[1]);
        assert_eq!(new_ids.len(), 2);
        assert_eq!(store.len("shared.block").await, 2);

        let page = store
            .update("api::page.page", page.id, EntityPatch::silent(links))
            .await
            .unwrap();
        let loaded = components.get_components(&store, "api::page.page", &page).await.unwrap();
        let texts: Vec<&Value> = loaded["blocks"].iter().map(|row| &row.content["text"]).collect();
        assert_eq!(texts, [&json!("two!"), &json!("three")]);
    }

    #[tokio::test]
    async fn clone_re_resolves_relations() {
        let schema = schema();
        let store = MemoryStore::new(schema.clone());
        let components = StoreComponents::new(schema);

        let draft_cat = store
            .create("api::category.category", NewEntity::new("Cat1"))
            .await
            .unwrap();
        let published_cat = store
            .create(
                "api::category.category",
                NewEntity::new("Cat1").published_at(Some(chrono::Utc::now())),
            )
            .await
            .unwrap();

        let mut seo = item(None, json!({"meta": "m"}));
        seo.data
            .relations
            .insert("category".into(), RelationInput::Shorthand(draft_cat.id));
        let input = ComponentInput::from([("seo".to_string(), ComponentValue::Single(Some(seo)))]);
        let links = components
            .create_components(&store, "api::page.page", &input)
            .await
            .unwrap();
        let page = owner(&store, links).await;

        let links = components
            .clone_components(&store, "api::page.page", &page, Some(Status::Published), &[])
            .await
            .unwrap();
        assert_ne!(links["seo"], page.content["seo"]);
        let clone = Entity {
            content: links,
            ..page.clone()
        };
        let loaded = components.get_components(&store, "api::page.page", &clone).await.unwrap();
        assert_eq!(loaded["seo"][0].content["category"], json!(published_cat.id));
        assert_eq!(loaded["seo"][0].content["meta"], "m");
        assert_eq!(store.len("shared.seo").await, 2);
    }
}
