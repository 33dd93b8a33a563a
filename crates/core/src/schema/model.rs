use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Content type schema, as registered by the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentType {
    pub uid: String,
    #[serde(default)]
    pub kind: ContentKind,
    #[serde(default = "default_true")]
    pub draft_and_publish: bool,
    #[serde(default)]
    pub localized: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentKind {
    #[default]
    CollectionType,
    SingleType,
}

/// Reusable group of attributes stored as its own rows and owned by a content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub uid: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationKind {
    pub fn is_to_many(self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationAttribute {
    pub relation: RelationKind,
    pub target: String,
    pub inversed_by: Option<String>,
    /// Set on the inverse side; the link is stored on `target.<mapped_by>`.
    pub mapped_by: Option<String>,
}

impl RelationAttribute {
    pub fn is_owner(&self) -> bool {
        self.mapped_by.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentAttribute {
    pub component: String,
    pub repeatable: bool,
}

/// A schema attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawAttribute", into = "RawAttribute")]
pub enum Attribute {
    Scalar { kind: String, required: bool },
    Relation(RelationAttribute),
    Component(ComponentAttribute),
}

impl Attribute {
    pub fn as_relation(&self) -> Option<&RelationAttribute> {
        match self {
            Attribute::Relation(rel) => Some(rel),
            _ => None,
        }
    }

    pub fn as_component(&self) -> Option<&ComponentAttribute> {
        match self {
            Attribute::Component(comp) => Some(comp),
            _ => None,
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, Attribute::Relation(_))
    }

    /// Relations and components: attributes whose stored value is a row id.
    pub fn is_link(&self) -> bool {
        !matches!(self, Attribute::Scalar { .. })
    }
}

/// Wire shape of an attribute (`{"type": "relation", "relation": "oneToMany", ...}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAttribute {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relation: Option<RelationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inversed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mapped_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    component: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    repeatable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    required: bool,
}

impl TryFrom<RawAttribute> for Attribute {
    type Error = String;

    fn try_from(raw: RawAttribute) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "relation" => {
                let relation = raw
                    .relation
                    .ok_or_else(|| "relation attribute requires `relation`".to_string())?;
                let target = raw
                    .target
                    .ok_or_else(|| "relation attribute requires `target`".to_string())?;
                Ok(Attribute::Relation(RelationAttribute {
                    relation,
                    target,
                    inversed_by: raw.inversed_by,
                    mapped_by: raw.mapped_by,
                }))
            }
            "component" => {
                let component = raw
                    .component
                    .ok_or_else(|| "component attribute requires `component`".to_string())?;
                Ok(Attribute::Component(ComponentAttribute {
                    component,
                    repeatable: raw.repeatable,
                }))
            }
            "" => Err("attribute `type` cannot be empty".to_string()),
            _ => Ok(Attribute::Scalar {
                kind: raw.kind,
                required: raw.required,
            }),
        }
    }
}

impl From<Attribute> for RawAttribute {
    fn from(attribute: Attribute) -> Self {
        match attribute {
            Attribute::Scalar { kind, required } => RawAttribute {
                kind,
                required,
                ..RawAttribute::default()
            },
            Attribute::Relation(rel) => RawAttribute {
                kind: "relation".into(),
                relation: Some(rel.relation),
                target: Some(rel.target),
                inversed_by: rel.inversed_by,
                mapped_by: rel.mapped_by,
                ..RawAttribute::default()
            },
            Attribute::Component(comp) => RawAttribute {
                kind: "component".into(),
                component: Some(comp.component),
                repeatable: comp.repeatable,
                ..RawAttribute::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_content_type_with_defaults() {
        let ct: ContentType = serde_json::from_value(json!({
            "uid": "api::article.article",
            "attributes": {
                "title": {"type": "string", "required": true},
                "categories": {
                    "type": "relation", "relation": "manyToMany", "target": "api::category.category"
                },
                "seo": {"type": "component", "component": "shared.seo"}
            }
        }))
        .unwrap();

        assert_eq!(ct.kind, ContentKind::CollectionType);
        assert!(ct.draft_and_publish);
        assert!(!ct.localized);
        assert!(matches!(ct.attributes["title"], Attribute::Scalar { required: true, .. }));
        let rel = ct.attributes["categories"].as_relation().unwrap();
        assert!(rel.relation.is_to_many());
        assert!(rel.is_owner());
        assert!(!ct.attributes["seo"].as_component().unwrap().repeatable);
    }

    #[test]
    fn reject_relation_without_target() {
        let result: Result<Attribute, _> =
            serde_json::from_value(json!({"type": "relation", "relation": "oneToOne"}));
        assert!(result.is_err());
    }
}
