use serde_json::Value;

use crate::document::{EntityId, ValidationError};
use crate::transform::{Connect, Position, RelationInput};

fn dedup(ids: Vec<EntityId>) -> Vec<EntityId> {
    let mut out: Vec<EntityId> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

fn connect_one(
    attribute: &str,
    ids: &mut Vec<EntityId>,
    Connect { target, position }: Connect<EntityId>,
) -> Result<(), ValidationError> {
    ids.retain(|id| *id != target);
    let anchor_index = |anchor: EntityId, ids: &[EntityId]| {
        ids.iter().position(|id| *id == anchor).ok_or_else(|| ValidationError::InvalidRelation {
            attribute: attribute.to_string(),
            reason: format!("position anchor {anchor} is not connected"),
        })
    };
    match position {
        None | Some(Position::End) => ids.push(target),
        Some(Position::Start) => ids.insert(0, target),
        Some(Position::Before(anchor)) => {
            let index = anchor_index(anchor, ids.as_slice())?;
            ids.insert(index, target);
        }
        Some(Position::After(anchor)) => {
            let index = anchor_index(anchor, ids.as_slice())?;
            ids.insert(index + 1, target);
        }
    }
    Ok(())
}

/// Apply `input` to the currently linked ids and return the new ordered list.
///
/// To-one attributes keep only the last id.
pub fn apply_relation_input(
    attribute: &str,
    current: Vec<EntityId>,
    input: RelationInput<EntityId>,
    to_many: bool,
) -> Result<Vec<EntityId>, ValidationError> {
    let mut ids = match input {
        RelationInput::Null => Vec::new(),
        RelationInput::Shorthand(id) | RelationInput::LongForm(id) => vec![id],
        RelationInput::List(ids) => dedup(ids),
        RelationInput::Operations { set: Some(ids), .. } => dedup(ids),
        RelationInput::Operations {
            set: None,
            connect,
            disconnect,
        } => {
            let mut ids = current;
            ids.retain(|id| !disconnect.contains(id));
            for item in connect {
                connect_one(attribute, &mut ids, item)?;
            }
            ids
        }
    };
    if !to_many && ids.len() > 1 {
        ids = ids.split_off(ids.len() - 1);
    }
    Ok(ids)
}

/// Stored JSON for a link attribute.
pub fn stored_value(ids: Vec<EntityId>, to_many: bool) -> Value {
    if to_many {
        Value::Array(ids.into_iter().map(Value::from).collect())
    } else {
        ids.into_iter().next().map(Value::from).unwrap_or(Value::Null)
    }
}
