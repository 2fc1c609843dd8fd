use std::{sync::Arc, time::Duration};

use bankledger_core::{Backend, StoreError};
use bankledger_postgres::PostgresBackend;
use bankledger_sqlite::SqliteBackend;
use clap::Args;
use serde::Deserialize;

use crate::store::Store;

#[derive(Args, Debug, Clone)]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "bankledger.toml")]
    pub config: String,

    /// Database location (overrides config file)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// File path for sqlite, connection string for postgres.
    #[serde(default = "default_url")]
    pub url: String,

    /// How long a sqlite transaction waits for the write lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long a postgres transaction waits for a row lock; 0 waits without limit.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        backend: default_backend(),
        url: default_url(),
        busy_timeout_ms: default_busy_timeout_ms(),
        lock_timeout_ms: default_lock_timeout_ms(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Sqlite
}

fn default_url() -> String {
    "bankledger.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: default_database(),
            logging: default_logging(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(ref url) = cli.database_url {
            config.database.url = url.clone();
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn open_backend(&self) -> Result<Arc<dyn Backend>, StoreError> {
        let db = &self.database;
        let backend: Arc<dyn Backend> = match db.backend {
            BackendKind::Sqlite => Arc::new(SqliteBackend::with_busy_timeout(
                &db.url,
                Duration::from_millis(db.busy_timeout_ms),
            )?),
            BackendKind::Postgres => Arc::new(PostgresBackend::with_lock_timeout(
                &db.url,
                Duration::from_millis(db.lock_timeout_ms),
            )?),
        };
        tracing::info!(backend = backend.name(), "Opened ledger database");
        Ok(backend)
    }

    pub fn open_store(&self) -> Result<Store, StoreError> {
        Ok(Store::new(self.open_backend()?))
    }
}
