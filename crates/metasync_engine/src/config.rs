//! Configuration for the sync engine.

use crate::dedup::DEFAULT_CACHE_TTL;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Provider name selecting the search index sink.
pub const SEARCH_PROVIDER: &str = "elastic_search";

/// Per-container engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Account holding the container.
    pub account: String,
    /// Container whose changes are propagated.
    pub container: String,
    /// Attempt JSON decoding of user metadata values.
    pub parse_json: bool,
    /// Lifetime of dedup records, in seconds.
    pub cache_ttl: u64,
    /// Keep one checkpoint record per account.
    pub per_account: bool,
}

impl EngineConfig {
    /// Creates a configuration for `account/container`.
    pub fn new(account: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            parse_json: false,
            cache_ttl: DEFAULT_CACHE_TTL,
            per_account: false,
        }
    }

    /// Sets JSON decoding of user metadata.
    pub fn with_parse_json(mut self, parse_json: bool) -> Self {
        self.parse_json = parse_json;
        self
    }

    /// Sets the dedup record lifetime.
    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl = secs;
        self
    }

    /// Sets the per-account checkpoint layout.
    pub fn with_per_account(mut self, per_account: bool) -> Self {
        self.per_account = per_account;
        self
    }
}

/// Search index destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchIndexConfig {
    /// Cluster endpoints.
    pub hosts: Vec<String>,
    /// Destination index.
    pub index: String,
    /// Ingest pipeline applied to every index write.
    pub pipeline: Option<String>,
    /// Whether to verify server certificates.
    pub verify_certs: Option<bool>,
    /// CA bundle used for verification.
    pub ca_certs: Option<String>,
}

impl SearchIndexConfig {
    /// Creates a configuration writing to `index` on `hosts`.
    pub fn new(hosts: Vec<String>, index: impl Into<String>) -> Self {
        Self {
            hosts,
            index: index.into(),
            pipeline: None,
            verify_certs: None,
            ca_certs: None,
        }
    }

    /// Sets the ingest pipeline.
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }
}

/// Message topic destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageTopicConfig {
    /// Broker endpoints.
    pub servers: Vec<String>,
    /// Destination topic.
    pub topic: String,
    /// Storage cluster identifier, first component of every message key.
    pub cluster_id: String,
    /// Dedup cache endpoints.
    pub cache_servers: Vec<String>,
}

impl MessageTopicConfig {
    /// Creates a configuration publishing to `topic`.
    pub fn new(servers: Vec<String>, topic: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            servers,
            topic: topic.into(),
            cluster_id: cluster_id.into(),
            cache_servers: Vec::new(),
        }
    }

    /// Sets the dedup cache endpoints.
    pub fn with_cache_servers(mut self, servers: Vec<String>) -> Self {
        self.cache_servers = servers;
        self
    }
}

/// Where changes are propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// Documents in a search index.
    SearchIndex(SearchIndexConfig),
    /// Keyed messages on a topic.
    MessageTopic(MessageTopicConfig),
}

impl DestinationConfig {
    /// Index or topic name; checkpoints are only valid for this value.
    pub fn destination_id(&self) -> &str {
        match self {
            DestinationConfig::SearchIndex(config) => &config.index,
            DestinationConfig::MessageTopic(config) => &config.topic,
        }
    }

    /// First component of dedup identity keys.
    pub fn dedup_namespace(&self) -> &str {
        match self {
            DestinationConfig::SearchIndex(config) => &config.index,
            DestinationConfig::MessageTopic(config) => &config.cluster_id,
        }
    }
}

/// One endpoint, a comma-separated list, or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Endpoints {
    /// A single string, possibly comma separated.
    One(String),
    /// A list of endpoints.
    Many(Vec<String>),
}

impl Endpoints {
    /// Flattens into trimmed, non-empty endpoints.
    pub fn to_vec(&self) -> Vec<String> {
        let items: Vec<&str> = match self {
            Endpoints::One(value) => value.split(',').collect(),
            Endpoints::Many(values) => values.iter().map(String::as_str).collect(),
        };
        items
            .into_iter()
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn default_provider() -> String {
    SEARCH_PROVIDER.to_string()
}

/// Operator-facing settings of one sync mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncSettings {
    /// `elastic_search` (default) or any other value for the message sink.
    #[serde(default = "default_provider")]
    pub meta_sync_provider: String,
    /// Source account.
    pub account: Option<String>,
    /// Source container.
    pub container: Option<String>,
    /// Attempt JSON decoding of user metadata values.
    #[serde(default)]
    pub parse_json: bool,
    /// Search cluster endpoints.
    pub es_hosts: Option<Endpoints>,
    /// Destination index.
    pub index: Option<String>,
    /// Ingest pipeline.
    pub pipeline: Option<String>,
    /// Verify search cluster certificates.
    pub verify_certs: Option<bool>,
    /// CA bundle for the search cluster.
    pub ca_certs: Option<String>,
    /// Broker endpoints.
    pub kafka_servers: Option<Endpoints>,
    /// Destination topic.
    pub topic: Option<String>,
    /// Storage cluster identifier.
    pub cluster_id: Option<String>,
    /// Dedup cache endpoints.
    pub memcache_servers: Option<Endpoints>,
    /// Dedup record lifetime, in seconds.
    pub verify_cache_life: Option<u64>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> SyncResult<&'a str> {
    value
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| missing(name))
}

fn required_endpoints(value: &Option<Endpoints>, name: &str) -> SyncResult<Vec<String>> {
    let endpoints = value.as_ref().map(Endpoints::to_vec).unwrap_or_default();
    if endpoints.is_empty() {
        return Err(missing(name));
    }
    Ok(endpoints)
}

fn missing(name: &str) -> SyncError {
    SyncError::configuration(format!("Configuration option \"{name}\" is missing"))
}

impl SyncSettings {
    /// Parses settings from JSON text.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::configuration(format!("invalid settings: {e}")))
    }

    /// Returns true if the settings select the search index sink.
    pub fn is_search(&self) -> bool {
        self.meta_sync_provider == SEARCH_PROVIDER
    }

    /// Validates the settings and resolves them into typed configurations.
    pub fn resolve(&self, per_account: bool) -> SyncResult<(EngineConfig, DestinationConfig)> {
        let account = required(&self.account, "account")?;
        let container = required(&self.container, "container")?;

        let mut engine = EngineConfig::new(account, container)
            .with_parse_json(self.parse_json)
            .with_per_account(per_account);
        if let Some(ttl) = self.verify_cache_life {
            engine = engine.with_cache_ttl(ttl);
        }

        let destination = if self.is_search() {
            let mut config = SearchIndexConfig::new(
                required_endpoints(&self.es_hosts, "es_hosts")?,
                required(&self.index, "index")?,
            );
            config.pipeline = self.pipeline.clone().filter(|p| !p.is_empty());
            config.verify_certs = self.verify_certs;
            config.ca_certs = self.ca_certs.clone();
            DestinationConfig::SearchIndex(config)
        } else {
            let config = MessageTopicConfig::new(
                required_endpoints(&self.kafka_servers, "kafka_servers")?,
                required(&self.topic, "topic")?,
                required(&self.cluster_id, "cluster_id")?,
            )
            .with_cache_servers(required_endpoints(&self.memcache_servers, "memcache_servers")?);
            DestinationConfig::MessageTopic(config)
        };

        Ok((engine, destination))
    }
}

/// Settings shared by every engine a factory creates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FactoryConfig {
    /// Directory holding checkpoint records.
    pub status_dir: Option<PathBuf>,
}

impl FactoryConfig {
    /// Creates a configuration storing checkpoints under `status_dir`.
    pub fn new(status_dir: impl Into<PathBuf>) -> Self {
        Self {
            status_dir: Some(status_dir.into()),
        }
    }

    /// Returns the status directory or a configuration error.
    pub fn require_status_dir(&self) -> SyncResult<&PathBuf> {
        self.status_dir
            .as_ref()
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| missing("status_dir"))
    }
}
