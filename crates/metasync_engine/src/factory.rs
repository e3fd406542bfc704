//! Building engines from operator settings.

use crate::checkpoint::CheckpointStore;
use crate::config::{DestinationConfig, FactoryConfig, MessageTopicConfig, SearchIndexConfig, SyncSettings};
use crate::dedup::TimestampCache;
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::sink::{MessageProducer, MessageTopicSink, SearchClient, SearchIndexSink, Sink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// An engine whose sink is chosen at runtime.
pub type DynSyncEngine = SyncEngine<Box<dyn Sink>>;

/// Bootstraps concrete clients for a destination.
///
/// Connection handling, TLS and credentials live behind this trait.
pub trait ClientProvider {
    /// Connects to a search cluster.
    fn search_client(&self, config: &SearchIndexConfig) -> SyncResult<Box<dyn SearchClient>>;

    /// Connects to a message broker.
    fn producer(&self, config: &MessageTopicConfig) -> SyncResult<Box<dyn MessageProducer>>;

    /// Connects to the shared dedup cache.
    fn timestamp_cache(&self, servers: &[String]) -> SyncResult<Arc<dyn TimestampCache>>;
}

/// Creates one engine per sync mapping.
pub struct SyncEngineFactory<P: ClientProvider> {
    status_dir: PathBuf,
    provider: P,
}

impl<P: ClientProvider> SyncEngineFactory<P> {
    /// Creates a factory; `status_dir` is required.
    pub fn new(config: &FactoryConfig, provider: P) -> SyncResult<Self> {
        let status_dir = config.require_status_dir()?.clone();
        Ok(Self {
            status_dir,
            provider,
        })
    }

    /// Directory holding checkpoint records.
    pub fn status_dir(&self) -> &Path {
        &self.status_dir
    }

    /// Builds an engine for one mapping.
    pub fn instance(&self, settings: &SyncSettings, per_account: bool) -> SyncResult<DynSyncEngine> {
        let (config, destination) = settings.resolve(per_account)?;
        debug!(
            provider = %settings.meta_sync_provider,
            destination = %destination.destination_id(),
            "creating sync engine"
        );

        let (sink, cache): (Box<dyn Sink>, Option<Arc<dyn TimestampCache>>) = match &destination {
            DestinationConfig::SearchIndex(search) => {
                let client = self.provider.search_client(search)?;
                let cache = match &settings.memcache_servers {
                    Some(servers) => Some(self.provider.timestamp_cache(&servers.to_vec())?),
                    None => None,
                };
                let sink: Box<dyn Sink> = Box::new(SearchIndexSink::new(client, search.clone()));
                (sink, cache)
            }
            DestinationConfig::MessageTopic(topic) => {
                let producer = self.provider.producer(topic)?;
                let cache = self.provider.timestamp_cache(&topic.cache_servers)?;
                let sink: Box<dyn Sink> = Box::new(MessageTopicSink::new(producer, topic.clone()));
                (sink, Some(cache))
            }
        };

        let checkpoints = CheckpointStore::new(
            &self.status_dir,
            config.account.clone(),
            config.container.clone(),
            destination.destination_id(),
        )
        .with_per_account(per_account);

        SyncEngine::new(config, sink, checkpoints, cache)
    }
}
