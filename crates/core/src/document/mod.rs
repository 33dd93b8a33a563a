pub mod id;
pub mod model;
pub mod validate;

pub use id::{generate_document_id, DocumentStatus, LocaleParam, Status, VersionKey};
pub use model::{link_ids, Entity, EntityId, EntityPatch, NewEntity};
pub use validate::ValidationError;
