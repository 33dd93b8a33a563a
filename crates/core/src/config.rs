use std::env;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a valid {expected}, got `{value}`")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0}")]
    Inconsistent(String),
}

/// Document service configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentServiceConfig {
    /// Locale used when a localized operation does not name one.
    pub default_locale: String,
    /// `pageSize` when `find_page` is called without one.
    pub default_page_size: u64,
    /// Upper bound for `pageSize` and `limit`.
    pub max_page_size: u64,
    /// Event bus channel capacity.
    pub event_bus_capacity: usize,
    /// Log level (e.g., "info", "debug", "trace").
    pub log_level: String,
    /// PostgreSQL connection URL; the memory store is used when unset.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
}

impl Default for DocumentServiceConfig {
    fn default() -> Self {
        Self {
            default_locale: "en".to_string(),
            default_page_size: 25,
            max_page_size: 100,
            event_bus_capacity: 1024,
            log_level: "info".to_string(),
            database_url: None,
            db_max_connections: 20,
            db_min_connections: 5,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            expected,
            value,
        }),
    }
}

impl DocumentServiceConfig {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            default_locale: lookup("DEFAULT_LOCALE").unwrap_or(defaults.default_locale),
            default_page_size: parse(
                &lookup,
                "DEFAULT_PAGE_SIZE",
                "u64",
                defaults.default_page_size,
            )?,
            max_page_size: parse(&lookup, "MAX_PAGE_SIZE", "u64", defaults.max_page_size)?,
            event_bus_capacity: parse(
                &lookup,
                "EVENT_BUS_CAPACITY",
                "usize",
                defaults.event_bus_capacity,
            )?,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            db_max_connections: parse(
                &lookup,
                "DB_MAX_CONNECTIONS",
                "u32",
                defaults.db_max_connections,
            )?,
            db_min_connections: parse(
                &lookup,
                "DB_MIN_CONNECTIONS",
                "u32",
                defaults.db_min_connections,
            )?,
        };
        if config.default_page_size == 0 || config.default_page_size > config.max_page_size {
            return Err(ConfigError::Inconsistent(format!(
                "DEFAULT_PAGE_SIZE ({}) must be between 1 and MAX_PAGE_SIZE ({})",
                config.default_page_size, config.max_page_size
            )));
        }
        if config.event_bus_capacity == 0 {
            return Err(ConfigError::Inconsistent("EVENT_BUS_CAPACITY must be positive".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = DocumentServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DocumentServiceConfig::default());
    }

    #[test]
    fn overrides_from_source() {
        let config = DocumentServiceConfig::from_lookup(lookup(&[
            ("DEFAULT_LOCALE", "fr"),
            ("DEFAULT_PAGE_SIZE", "10"),
            ("DATABASE_URL", "postgres://localhost/docs"),
        ]))
        .unwrap();
        assert_eq!(config.default_locale, "fr");
        assert_eq!(config.default_page_size, 10);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/docs"));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(matches!(
            DocumentServiceConfig::from_lookup(lookup(&[("DB_MAX_CONNECTIONS", "many")])),
            Err(ConfigError::Invalid { key: "DB_MAX_CONNECTIONS", .. })
        ));
        assert!(matches!(
            DocumentServiceConfig::from_lookup(lookup(&[("DEFAULT_PAGE_SIZE", "500")])),
            Err(ConfigError::Inconsistent(_))
        ));
    }
}
