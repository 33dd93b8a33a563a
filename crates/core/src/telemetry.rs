use tracing_subscriber::EnvFilter;

use crate::config::DocumentServiceConfig;

/// Install the global JSON subscriber. `RUST_LOG` wins over the configured level.
///
/// Fails if a global subscriber is already set.
pub fn init(config: &DocumentServiceConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}
