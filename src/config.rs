use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub queries: QueriesConfig,
}

/// Store connection settings. Exactly one of `uri` or `host` + `port` must be set.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub collection: Option<String>,
}

/// The connection form selected by a validated [`StoreConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Address { host: String, port: u16 },
    Uri(String),
}

impl StoreConfig {
    pub fn with_uri(uri: &str, database: &str, collection: Option<&str>) -> Self {
        Self {
            uri: Some(uri.to_string()),
            host: None,
            port: None,
            database: database.to_string(),
            collection: collection.map(str::to_string),
        }
    }

    /// Resolve which connection form this config uses.
    pub fn connection(&self) -> Result<Connection, Error> {
        let address = match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::Configuration(
                    "store.host is set but store.port is missing".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::Configuration(
                    "store.port is set but store.host is missing".to_string(),
                ))
            }
        };

        match (&self.uri, address) {
            (Some(_), Some(_)) => Err(Error::Configuration(
                "store.uri and store.host/store.port are mutually exclusive".to_string(),
            )),
            (Some(uri), None) if uri.trim().is_empty() => {
                Err(Error::Configuration("store.uri is empty".to_string()))
            }
            (Some(uri), None) => Ok(Connection::Uri(uri.clone())),
            (None, Some((host, port))) => Ok(Connection::Address { host, port }),
            (None, None) => Err(Error::Configuration(
                "either store.uri or store.host and store.port must be set".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            year: None,
            working_dir: default_working_dir(),
        }
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueriesConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_popular_limit")]
    pub popular_limit: i64,
    #[serde(default = "default_sample_size")]
    pub sample_size: i64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            popular_limit: default_popular_limit(),
            sample_size: default_sample_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_page_size() -> u64 {
    51
}
fn default_popular_limit() -> i64 {
    10
}
fn default_sample_size() -> i64 {
    1000
}
fn default_cache_ttl_secs() -> u64 {
    600
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate store
    if config.store.database.trim().is_empty() {
        anyhow::bail!("store.database must not be empty");
    }
    config.store.connection()?;

    // Validate queries
    if config.queries.page_size == 0 {
        anyhow::bail!("queries.page_size must be > 0");
    }
    if config.queries.popular_limit < 1 {
        anyhow::bail!("queries.popular_limit must be >= 1");
    }
    if config.queries.sample_size < 1 {
        anyhow::bail!("queries.sample_size must be >= 1");
    }

    if let Some(year) = config.ingest.year {
        if !(1000..=9999).contains(&year) {
            anyhow::bail!("ingest.year must be a four-digit year, got {}", year);
        }
    }

    Ok(config)
}
