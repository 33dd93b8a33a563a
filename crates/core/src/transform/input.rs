//! Typed view of a write payload.
//!
//! `data` is parsed once at the boundary into `DocumentData<DocumentRef>`: scalar
//! attributes, relation inputs still addressed by `documentId`, and component items.
//! Resolution turns it into `DocumentData<EntityId>` with the same shape.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::document::model::{DOCUMENT_ID, ID, LOCALE};
use crate::document::validate::{validate_data, ValidationError};
use crate::document::{EntityId, Status};
use crate::schema::{Attribute, SchemaRegistry};

/// A reference to some version of a document, as written by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub document_id: String,
    pub locale: Option<String>,
    pub status: Option<Status>,
}

impl DocumentRef {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            locale: None,
            status: None,
        }
    }

    /// A pinned reference must resolve; an unpinned one may be dropped.
    pub fn is_pinned(&self) -> bool {
        self.locale.is_some() || self.status.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position<I> {
    Start,
    End,
    Before(I),
    After(I),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect<I> {
    pub target: I,
    pub position: Option<Position<I>>,
}

/// Every accepted shape of a relation value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationInput<I> {
    /// `null`: clear the relation.
    Null,
    /// `"docId"`
    Shorthand(I),
    /// `{"documentId": "docId", "locale": "en", "status": "draft"}`
    LongForm(I),
    /// `["docA", {"documentId": "docB"}]`
    List(Vec<I>),
    /// `{"set": [...]}` or `{"connect": [...], "disconnect": [...]}`
    Operations {
        set: Option<Vec<I>>,
        connect: Vec<Connect<I>>,
        disconnect: Vec<I>,
    },
}

impl<I> RelationInput<I> {
    /// Every reference, including position anchors.
    pub fn refs(&self) -> Vec<&I> {
        match self {
            RelationInput::Null => Vec::new(),
            RelationInput::Shorthand(r) | RelationInput::LongForm(r) => vec![r],
            RelationInput::List(items) => items.iter().collect(),
            RelationInput::Operations {
                set,
                connect,
                disconnect,
            } => {
                let mut refs: Vec<&I> = set.iter().flatten().collect();
                for item in connect {
                    refs.push(&item.target);
                    if let Some(Position::Before(anchor) | Position::After(anchor)) =
                        &item.position
                    {
                        refs.push(anchor);
                    }
                }
                refs.extend(disconnect);
                refs
            }
        }
    }

    /// Rewrite every reference. `f` returning `None` drops the reference; a dropped
    /// scalar drops the whole input (`Ok(None)`).
    pub fn try_filter_map<J, E>(
        self,
        mut f: impl FnMut(I) -> Result<Option<J>, E>,
    ) -> Result<Option<RelationInput<J>>, E> {
        let list = |items: Vec<I>, f: &mut dyn FnMut(I) -> Result<Option<J>, E>| {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(mapped) = f(item)? {
                    out.push(mapped);
                }
            }
            Ok::<_, E>(out)
        };

        Ok(match self {
            RelationInput::Null => Some(RelationInput::Null),
            RelationInput::Shorthand(r) => f(r)?.map(RelationInput::Shorthand),
            RelationInput::LongForm(r) => f(r)?.map(RelationInput::LongForm),
            RelationInput::List(items) => Some(RelationInput::List(list(items, &mut f)?)),
            RelationInput::Operations {
                set,
                connect,
                disconnect,
            } => {
                let set = match set {
                    Some(items) => Some(list(items, &mut f)?),
                    None => None,
                };
                let mut connected = Vec::with_capacity(connect.len());
                for item in connect {
                    let Some(target) = f(item.target)? else {
                        continue;
                    };
                    let position = match item.position {
                        None => None,
                        Some(Position::Start) => Some(Position::Start),
                        Some(Position::End) => Some(Position::End),
                        Some(Position::Before(anchor)) => f(anchor)?.map(Position::Before),
                        Some(Position::After(anchor)) => f(anchor)?.map(Position::After),
                    };
                    connected.push(Connect { target, position });
                }
                let disconnect = list(disconnect, &mut f)?;
                Some(RelationInput::Operations {
                    set,
                    connect: connected,
                    disconnect,
                })
            }
        })
    }
}

fn invalid(attribute: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidRelation {
        attribute: attribute.to_string(),
        reason: reason.into(),
    }
}

fn parse_status(attribute: &str, value: Option<&Value>) -> Result<Option<Status>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.parse()?)),
        Some(other) => Err(invalid(attribute, format!("invalid status {other}"))),
    }
}

fn parse_locale(attribute: &str, value: Option<&Value>) -> Result<Option<String>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(invalid(attribute, format!("invalid locale {other}"))),
    }
}

/// `"docId"` or `{"documentId"|"id": "docId", "locale"?, "status"?}`.
fn parse_ref(attribute: &str, value: &Value) -> Result<DocumentRef, ValidationError> {
    match value {
        Value::String(id) if !id.is_empty() => Ok(DocumentRef::new(id.clone())),
        Value::Object(map) => {
            let id = map
                .get(DOCUMENT_ID)
                .or_else(|| map.get(ID))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| invalid(attribute, "expected a `documentId` string"))?;
            Ok(DocumentRef {
                document_id: id.to_string(),
                locale: parse_locale(attribute, map.get(LOCALE))?,
                status: parse_status(attribute, map.get("status"))?,
            })
        }
        other => Err(invalid(attribute, format!("expected a documentId, got {other}"))),
    }
}

fn parse_refs(attribute: &str, value: &Value) -> Result<Vec<DocumentRef>, ValidationError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| parse_ref(attribute, item))
            .collect(),
        other => Ok(vec![parse_ref(attribute, other)?]),
    }
}

fn parse_position(
    attribute: &str,
    value: &Value,
) -> Result<Position<DocumentRef>, ValidationError> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid(attribute, "`position` must be an object"))?;
    let anchor = |id: &Value| -> Result<DocumentRef, ValidationError> {
        let document_id = id
            .as_str()
            .ok_or_else(|| invalid(attribute, "position anchor must be a documentId"))?;
        Ok(DocumentRef {
            document_id: document_id.to_string(),
            locale: parse_locale(attribute, map.get(LOCALE))?,
            status: parse_status(attribute, map.get("status"))?,
        })
    };
    if let Some(id) = map.get("before") {
        Ok(Position::Before(anchor(id)?))
    } else if let Some(id) = map.get("after") {
        Ok(Position::After(anchor(id)?))
    } else if map.get("start").and_then(Value::as_bool) == Some(true) {
        Ok(Position::Start)
    } else if map.get("end").and_then(Value::as_bool) == Some(true) {
        Ok(Position::End)
    } else {
        Err(invalid(attribute, "`position` needs `before`, `after`, `start` or `end`"))
    }
}

fn parse_connect(
    attribute: &str,
    value: &Value,
) -> Result<Vec<Connect<DocumentRef>>, ValidationError> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| {
            let target = parse_ref(attribute, item)?;
            let position = match item.get("position") {
                Some(position) => Some(parse_position(attribute, position)?),
                None => None,
            };
            Ok(Connect { target, position })
        })
        .collect()
}

impl RelationInput<DocumentRef> {
    pub fn parse(attribute: &str, value: &Value) -> Result<Self, ValidationError> {
        match value {
            Value::Null => Ok(RelationInput::Null),
            Value::String(_) => Ok(RelationInput::Shorthand(parse_ref(attribute, value)?)),
            Value::Array(_) => Ok(RelationInput::List(parse_refs(attribute, value)?)),
            Value::Object(map)
                if ["set", "connect", "disconnect"].iter().any(|k| map.contains_key(*k)) =>
            {
                let set = match map.get("set") {
                    Some(value) => Some(parse_refs(attribute, value)?),
                    None => None,
                };
                let connect = match map.get("connect") {
                    Some(value) => parse_connect(attribute, value)?,
                    None => Vec::new(),
                };
                let disconnect = match map.get("disconnect") {
                    Some(value) => parse_refs(attribute, value)?,
                    None => Vec::new(),
                };
                if set.is_some() && (!connect.is_empty() || !disconnect.is_empty()) {
                    return Err(invalid(
                        attribute,
                        "`set` cannot be combined with `connect` or `disconnect`",
                    ));
                }
                Ok(RelationInput::Operations {
                    set,
                    connect,
                    disconnect,
                })
            }
            Value::Object(_) => Ok(RelationInput::LongForm(parse_ref(attribute, value)?)),
            other => Err(invalid(attribute, format!("unsupported relation value {other}"))),
        }
    }
}

/// One component item; `id` is set when the caller refers to an existing component row.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentItem<I> {
    pub id: Option<EntityId>,
    pub data: DocumentData<I>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValue<I> {
    Single(Option<ComponentItem<I>>),
    Repeatable(Vec<ComponentItem<I>>),
}

impl<I> ComponentValue<I> {
    pub fn items(&self) -> Vec<&ComponentItem<I>> {
        match self {
            ComponentValue::Single(item) => item.iter().collect(),
            ComponentValue::Repeatable(items) => items.iter().collect(),
        }
    }
}

/// Parsed write payload for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentData<I> {
    pub scalars: Map<String, Value>,
    pub relations: BTreeMap<String, RelationInput<I>>,
    pub components: BTreeMap<String, ComponentValue<I>>,
}

impl<I> Default for DocumentData<I> {
    fn default() -> Self {
        Self {
            scalars: Map::new(),
            relations: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }
}

impl DocumentData<DocumentRef> {
    /// Validate `data` against the schema of `uid` and split it by attribute kind.
    pub fn parse(
        schema: &SchemaRegistry,
        uid: &str,
        data: &Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        validate_data(schema, uid, data)?;
        let model = schema.get_model(uid)?;
        let mut parsed = DocumentData::default();

        for (key, value) in data {
            match model.attributes().get(key) {
                Some(Attribute::Relation(_)) => {
                    parsed
                        .relations
                        .insert(key.clone(), RelationInput::parse(key, value)?);
                }
                Some(Attribute::Component(component)) => {
                    let item = |value: &Value| {
                        let mut map = value.as_object().cloned().unwrap_or_default();
                        let id = map.remove(ID).and_then(|id| id.as_i64());
                        Ok::<_, ValidationError>(ComponentItem {
                            id,
                            data: DocumentData::parse(schema, &component.component, &map)?,
                        })
                    };
                    let value = if component.repeatable {
                        let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
                        let items = items.iter().map(item).collect::<Result<_, _>>()?;
                        ComponentValue::Repeatable(items)
                    } else if value.is_null() {
                        ComponentValue::Single(None)
                    } else {
                        ComponentValue::Single(Some(item(value)?))
                    };
                    parsed.components.insert(key.clone(), value);
                }
                _ => {
                    parsed.scalars.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(parsed)
    }
}

impl<I> DocumentData<I> {
    /// Visit every relation input with the uid of the model that declares it,
    /// recursing into components.
    pub fn for_each_relation<'a>(
        &'a self,
        schema: &SchemaRegistry,
        uid: &str,
        f: &mut dyn FnMut(&str, &str, &'a RelationInput<I>),
    ) {
        for (name, input) in &self.relations {
            f(uid, name, input);
        }
        for (name, value) in &self.components {
            let Some(component) = schema.attribute(uid, name).and_then(Attribute::as_component)
            else {
                continue;
            };
            for item in value.items() {
                item.data.for_each_relation(schema, &component.component, f);
            }
        }
    }

    /// Rewrite every relation input. `f` receives the declaring uid and attribute name.
    pub fn try_map_relations<J, E>(
        self,
        schema: &SchemaRegistry,
        uid: &str,
        f: &mut dyn FnMut(&str, &str, RelationInput<I>) -> Result<Option<RelationInput<J>>, E>,
    ) -> Result<DocumentData<J>, E> {
        let mut relations = BTreeMap::new();
        for (name, input) in self.relations {
            if let Some(mapped) = f(uid, &name, input)? {
                relations.insert(name, mapped);
            }
        }

        let mut components = BTreeMap::new();
        for (name, value) in self.components {
            let component_uid = schema
                .attribute(uid, &name)
                .and_then(Attribute::as_component)
                .map(|c| c.component.clone())
                .unwrap_or_default();
            let mut map_item = |item: ComponentItem<I>| -> Result<ComponentItem<J>, E> {
                Ok(ComponentItem {
                    id: item.id,
                    data: item.data.try_map_relations(schema, &component_uid, f)?,
                })
            };
            let mapped = match value {
                ComponentValue::Single(item) => {
                    ComponentValue::Single(item.map(&mut map_item).transpose()?)
                }
                ComponentValue::Repeatable(items) => ComponentValue::Repeatable(
                    items.into_iter().map(&mut map_item).collect::<Result<_, _>>()?,
                ),
            };
            components.insert(name, mapped);
        }

        Ok(DocumentData {
            scalars: self.scalars,
            relations,
            components,
        })
    }
}
