//! Document service core.
//!
//! A document is the set of rows sharing one `documentId`, one per `(locale, status)`
//! slot. This crate resolves document-level parameters to rows, runs the publish state
//! machine and keeps relations between documents consistent.

pub mod bootstrap;
pub mod components;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod metadata;
pub mod params;
pub mod relations;
pub mod schema;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod transform;

pub use components::{ComponentLifecycle, StoreComponents};
pub use config::DocumentServiceConfig;
pub use document::{DocumentStatus, Entity, EntityId, LocaleParam, Status, ValidationError};
pub use error::{DocumentError, DocumentResult};
pub use events::{DocumentEvent, EventBus};
pub use metadata::{DocumentMetadata, DocumentWithMetadata, MetadataOptions};
pub use params::DocumentParams;
pub use schema::SchemaRegistry;
pub use service::{DocumentPage, DocumentRepository, DocumentService, DocumentVersions, Pagination};
pub use store::{EntityStore, MemoryStore, PgEntityStore};
