//! Wiring for embedders: configuration, tracing, store and service.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use crate::config::DocumentServiceConfig;
use crate::schema::SchemaRegistry;
use crate::service::DocumentService;
use crate::store::{EntityStore, MemoryStore, PgEntityStore};
use crate::telemetry;

/// Connect to PostgreSQL and apply the bundled migrations.
pub async fn connect_postgres(
    config: &DocumentServiceConfig,
    database_url: &str,
    schema: Arc<SchemaRegistry>,
) -> anyhow::Result<PgEntityStore> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {e}"))?;
    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {e}"))?;
    tracing::info!("Database migrations applied");

    Ok(PgEntityStore::new(pool, schema))
}

/// Build a service for `config`: PostgreSQL when `database_url` is set, otherwise the
/// in-memory store.
pub async fn build_service(
    config: DocumentServiceConfig,
    schema: Arc<SchemaRegistry>,
) -> anyhow::Result<DocumentService> {
    schema
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid schema: {e}"))?;

    let store: Arc<dyn EntityStore> = match &config.database_url {
        Some(url) => Arc::new(connect_postgres(&config, url, schema.clone()).await?),
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new(schema.clone()))
        }
    };
    Ok(DocumentService::with_store(schema, store, config))
}

/// Load `.env` and the environment, install tracing, then build the service.
pub async fn from_env(schema: Arc<SchemaRegistry>) -> anyhow::Result<DocumentService> {
    // Load .env file if present (dev convenience)
    let _ = dotenvy::dotenv();

    let config = DocumentServiceConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;
    telemetry::init(&config)?;
    tracing::info!(default_locale = %config.default_locale, "Starting document service");

    build_service(config, schema).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn falls_back_to_memory_store() {
        let schema = Arc::new(
            SchemaRegistry::from_json(json!({
                "contentTypes": [
                    {"uid": "api::tag.tag", "attributes": {"name": {"type": "string"}}}
                ]
            }))
            .unwrap(),
        );
        let service = build_service(DocumentServiceConfig::default(), schema).await.unwrap();
        let count = service
            .documents("api::tag.tag")
            .count(&Default::default())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
