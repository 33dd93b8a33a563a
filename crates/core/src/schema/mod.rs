pub mod model;
pub mod registry;

pub use model::{
    Attribute, Component, ComponentAttribute, ContentKind, ContentType, RelationAttribute,
    RelationKind,
};
pub use registry::{Model, RelationSource, SchemaError, SchemaRegistry};
