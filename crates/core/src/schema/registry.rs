use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::model::{Attribute, Component, ContentType, RelationAttribute};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("unknown attribute `{attribute}` on {uid}")]
    UnknownAttribute { uid: String, attribute: String },
    #[error("invalid schema: {0}")]
    Invalid(String),
}

/// A registered model: either a content type or a component.
#[derive(Debug, Clone, Copy)]
pub enum Model<'a> {
    ContentType(&'a ContentType),
    Component(&'a Component),
}

impl<'a> Model<'a> {
    pub fn uid(&self) -> &'a str {
        match self {
            Model::ContentType(ct) => &ct.uid,
            Model::Component(c) => &c.uid,
        }
    }

    pub fn attributes(&self) -> &'a BTreeMap<String, Attribute> {
        match self {
            Model::ContentType(ct) => &ct.attributes,
            Model::Component(c) => &c.attributes,
        }
    }
}

/// An owning relation attribute somewhere in the schema.
#[derive(Debug, Clone, Copy)]
pub struct RelationSource<'a> {
    pub uid: &'a str,
    pub attribute: &'a str,
    pub relation: &'a RelationAttribute,
}

/// Read-only registry of content type and component schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    content_types: HashMap<String, ContentType>,
    components: HashMap<String, Component>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaDocument {
    #[serde(default)]
    content_types: Vec<ContentType>,
    #[serde(default)]
    components: Vec<Component>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"contentTypes": [...], "components": [...]}` and validate references.
    pub fn from_json(value: Value) -> Result<Self, SchemaError> {
        let doc: SchemaDocument =
            serde_json::from_value(value).map_err(|e| SchemaError::Invalid(e.to_string()))?;
        let mut registry = Self::new();
        for ct in doc.content_types {
            registry.register_content_type(ct);
        }
        for component in doc.components {
            registry.register_component(component);
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.register_content_type(content_type);
        self
    }

    pub fn with_component(mut self, component: Component) -> Self {
        self.register_component(component);
        self
    }

    pub fn register_content_type(&mut self, content_type: ContentType) {
        self.content_types.insert(content_type.uid.clone(), content_type);
    }

    pub fn register_component(&mut self, component: Component) {
        self.components.insert(component.uid.clone(), component);
    }

    /// Check that every relation target and component reference is registered.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for model in self.models() {
            for (name, attribute) in model.attributes() {
                match attribute {
                    Attribute::Relation(rel) => {
                        if !self.content_types.contains_key(&rel.target) {
                            return Err(SchemaError::Invalid(format!(
                                "{}.{name} targets unknown content type {}",
                                model.uid(),
                                rel.target
                            )));
                        }
                    }
                    Attribute::Component(comp) => {
                        if !self.components.contains_key(&comp.component) {
                            return Err(SchemaError::Invalid(format!(
                                "{}.{name} uses unknown component {}",
                                model.uid(),
                                comp.component
                            )));
                        }
                    }
                    Attribute::Scalar { .. } => {}
                }
            }
        }
        Ok(())
    }

    fn models(&self) -> impl Iterator<Item = Model<'_>> {
        self.content_types
            .values()
            .map(Model::ContentType)
            .chain(self.components.values().map(Model::Component))
    }

    pub fn get_model(&self, uid: &str) -> Result<Model<'_>, SchemaError> {
        if let Some(ct) = self.content_types.get(uid) {
            return Ok(Model::ContentType(ct));
        }
        self.components
            .get(uid)
            .map(Model::Component)
            .ok_or_else(|| SchemaError::UnknownModel(uid.to_string()))
    }

    pub fn content_type(&self, uid: &str) -> Result<&ContentType, SchemaError> {
        self.content_types
            .get(uid)
            .ok_or_else(|| SchemaError::UnknownModel(uid.to_string()))
    }

    pub fn get_component(&self, uid: &str) -> Result<&Component, SchemaError> {
        self.components
            .get(uid)
            .ok_or_else(|| SchemaError::UnknownModel(uid.to_string()))
    }

    pub fn attribute(&self, uid: &str, name: &str) -> Option<&Attribute> {
        self.get_model(uid).ok()?.attributes().get(name)
    }

    pub fn relation(&self, uid: &str, name: &str) -> Option<&RelationAttribute> {
        self.attribute(uid, name).and_then(Attribute::as_relation)
    }

    /// Localization flag; components and unknown uids are not localized.
    pub fn is_localized(&self, uid: &str) -> bool {
        self.content_types.get(uid).is_some_and(|ct| ct.localized)
    }

    pub fn has_draft_and_publish(&self, uid: &str) -> bool {
        self.content_types
            .get(uid)
            .is_some_and(|ct| ct.draft_and_publish)
    }

    /// Every owning relation attribute (content types and components) pointing at `target`.
    pub fn relations_targeting(&self, target: &str) -> Vec<RelationSource<'_>> {
        let mut sources = Vec::new();
        for model in self.models() {
            for (name, attribute) in model.attributes() {
                if let Attribute::Relation(rel) = attribute {
                    if rel.target == target && rel.is_owner() {
                        sources.push(RelationSource {
                            uid: model.uid(),
                            attribute: name,
                            relation: rel,
                        });
                    }
                }
            }
        }
        sources.sort_by(|a, b| (a.uid, a.attribute).cmp(&(b.uid, b.attribute)));
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_json(json!({
            "contentTypes": [
                {
                    "uid": "api::article.article",
                    "localized": true,
                    "attributes": {
                        "title": {"type": "string"},
                        "categories": {
                            "type": "relation",
                            "relation": "manyToMany",
                            "target": "api::category.category",
                            "inversedBy": "articles"
                        }
                    }
                },
                {
                    "uid": "api::category.category",
                    "localized": true,
                    "attributes": {
                        "name": {"type": "string"},
                        "articles": {
                            "type": "relation",
                            "relation": "manyToMany",
                            "target": "api::article.article",
                            "mappedBy": "categories"
                        }
                    }
                },
                {
                    "uid": "api::shop.shop",
                    "draftAndPublish": false,
                    "attributes": {
                        "featured": {"type": "component", "component": "shop.featured"}
                    }
                }
            ],
            "components": [
                {
                    "uid": "shop.featured",
                    "attributes": {
                        "category": {
                            "type": "relation",
                            "relation": "oneToOne",
                            "target": "api::category.category"
                        }
                    }
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn lookup_flags() {
        let registry = registry();
        assert!(registry.is_localized("api::article.article"));
        assert!(!registry.is_localized("api::shop.shop"));
        assert!(!registry.has_draft_and_publish("api::shop.shop"));
        assert!(!registry.has_draft_and_publish("shop.featured"));
        assert!(registry.get_model("shop.featured").is_ok());
        assert!(matches!(
            registry.get_model("api::nope.nope"),
            Err(SchemaError::UnknownModel(_))
        ));
    }

    #[test]
    fn owning_relations_targeting_uid() {
        let registry = registry();
        let sources = registry.relations_targeting("api::category.category");
        let names: Vec<_> = sources.iter().map(|s| (s.uid, s.attribute)).collect();
        assert_eq!(
            names,
            vec![
                ("api::article.article", "categories"),
                ("shop.featured", "category"),
            ]
        );
    }

    #[test]
    fn reject_unknown_target() {
        let result = SchemaRegistry::from_json(json!({
            "contentTypes": [{
                "uid": "api::a.a",
                "attributes": {
                    "b": {"type": "relation", "relation": "oneToOne", "target": "api::b.b"}
                }
            }]
        }));
        assert!(matches!(result, Err(SchemaError::Invalid(_))));
    }
}
