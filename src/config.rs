//! Service settings, layered from built-in defaults, an optional `agndb`
//! config file (or an explicit path) and `AGNDB_*` environment variables.
//!
//! Nested keys use a double underscore in the environment, so
//! `AGNDB_QUERY__MAX_PAGE_SIZE=500` sets `query.max_page_size`.

use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{PortalError, Result};
use crate::execute::Limits;
use crate::persist::PersistenceMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_address: String,
    pub allowed_origins: Vec<String>,
    pub log_filter: String,
    pub database: DatabaseSettings,
    pub query: QuerySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file; absent means an in-memory store.
    pub path: Option<String>,
    pub seed_demo_sources: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub query_timeout_ms: u64,
    pub export_timeout_ms: u64,
    pub export_row_ceiling: u64,
    pub export_chunk_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            allowed_origins: vec!["*".to_string()],
            log_filter: "info".to_string(),
            database: DatabaseSettings::default(),
            query: QuerySettings::default(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { path: None, seed_demo_sources: 0, seed: 42 }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            default_page_size: limits.default_page_size,
            max_page_size: limits.max_page_size,
            query_timeout_ms: limits.query_timeout.as_millis() as u64,
            export_timeout_ms: limits.export_timeout.as_millis() as u64,
            export_row_ceiling: limits.export_row_ceiling,
            export_chunk_bytes: limits.export_chunk_bytes,
        }
    }
}

impl Settings {
    /// Reads settings. An explicit `path` must exist; the default `agndb`
    /// file is optional.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name("agndb").required(false),
        };
        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("AGNDB")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_origins"),
            )
            .build()?
            .try_deserialize()?;
        settings.limits()?;
        Ok(settings)
    }

    pub fn limits(&self) -> Result<Limits> {
        let query = &self.query;
        if query.max_page_size == 0 || query.default_page_size == 0 {
            return Err(PortalError::Config("page sizes must be at least 1".into()));
        }
        if query.default_page_size > query.max_page_size {
            return Err(PortalError::Config(format!(
                "default page size {} exceeds the maximum of {}",
                query.default_page_size, query.max_page_size
            )));
        }
        if query.export_chunk_bytes == 0 {
            return Err(PortalError::Config("export chunks need at least one byte".into()));
        }
        Ok(Limits {
            default_page_size: query.default_page_size,
            max_page_size: query.max_page_size,
            query_timeout: Duration::from_millis(query.query_timeout_ms),
            export_timeout: Duration::from_millis(query.export_timeout_ms),
            export_row_ceiling: query.export_row_ceiling,
            export_chunk_bytes: query.export_chunk_bytes,
        })
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.database.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
}
