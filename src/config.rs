//! Runtime configuration module
//!
//! Loads database settings from environment variables (and `.env`).

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    /// PostgreSQL schema entity tables live in
    pub namespace: String,
    pub use_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 10,
            namespace: "public".to_string(),
            use_tls: false,
        }
    }
}

/// Complete runtime settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub database: DatabaseConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any variable source
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DatabaseConfig::default();
        let max_pool_size = parse_var(&var, "DB_MAX_CONNECTIONS")?.unwrap_or(defaults.max_pool_size);

        // DATABASE_URL wins over the individual variables
        let mut database = if let Some(database_url) = var("DATABASE_URL") {
            Self::parse_database_url(&database_url)?
        } else {
            DatabaseConfig {
                host: var("DB_HOST").unwrap_or(defaults.host),
                port: parse_var(&var, "DB_PORT")?.unwrap_or(defaults.port),
                user: var("DB_USER").unwrap_or(defaults.user),
                password: var("DB_PASSWORD").unwrap_or_default(),
                database: var("DB_NAME").unwrap_or(defaults.database),
                ..DatabaseConfig::default()
            }
        };

        database.max_pool_size = max_pool_size;
        if let Some(namespace) = var("DB_SCHEMA").filter(|s| !s.trim().is_empty()) {
            database.namespace = namespace.trim().to_string();
        }
        if let Some(tls) = var("DB_TLS") {
            database.use_tls = parse_flag(&tls)
                .ok_or_else(|| ConfigError::InvalidValue(format!("DB_TLS: {tls}")))?;
        }

        Ok(Self { database })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        let use_tls = host.contains("neon.tech")
            || parsed
                .query_pairs()
                .any(|(key, value)| key == "sslmode" && (value == "require" || value.starts_with("verify")));

        Ok(DatabaseConfig {
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database: if database.is_empty() {
                DatabaseConfig::default().database
            } else {
                database
            },
            host,
            use_tls,
            ..DatabaseConfig::default()
        })
    }
}

fn parse_var<F, T>(var: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("{key}: {raw}")))
        })
        .transpose()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "require" => Some(true),
        "0" | "false" | "no" | "off" | "disable" => Some(false),
        _ => None,
    }
}
