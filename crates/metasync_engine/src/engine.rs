//! The sync engine: dedup, build, dispatch, classify.

use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::dedup::{DedupFilter, TimestampCache};
use crate::document::{DocumentBuilder, SinkDocument};
use crate::error::{SyncError, SyncResult};
use crate::sink::Sink;
use crate::source::{ChangeRow, MetadataFetcher};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Counts for one `handle` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleReport {
    /// Rows received.
    pub received: usize,
    /// Rows suppressed by the dedup cache.
    pub deduplicated: usize,
    /// Rows accepted by the sink.
    pub dispatched: usize,
    /// Rows the sink already held.
    pub already_current: usize,
    /// Rows the sink rejected.
    pub failed: usize,
}

/// Cumulative statistics of an engine.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Number of `handle` calls that succeeded.
    pub batches_handled: u64,
    /// Number of `handle` calls that failed.
    pub batches_failed: u64,
    /// Total rows received.
    pub rows_received: u64,
    /// Total rows suppressed by the dedup cache.
    pub rows_deduplicated: u64,
    /// Total rows accepted by the sink.
    pub rows_dispatched: u64,
    /// Total rows the sink already held.
    pub rows_current: u64,
    /// Total rows rejected by the sink.
    pub rows_failed: u64,
    /// Last time a batch completed, successfully or not.
    pub last_batch_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Propagates change rows of one container to one sink.
///
/// The engine does not lock: callers must not run two `handle` calls for
/// the same partition at once.
pub struct SyncEngine<S: Sink> {
    config: EngineConfig,
    sink: S,
    builder: DocumentBuilder,
    checkpoints: CheckpointStore,
    cache: Option<Arc<dyn TimestampCache>>,
    stats: RwLock<SyncStats>,
}

impl<S: Sink> SyncEngine<S> {
    /// Creates an engine and prepares the sink.
    ///
    /// Fails if the sink needs a dedup cache and none is given, if the
    /// checkpoint store tracks another destination, or if the sink cannot be
    /// prepared (for example an ambiguous schema).
    pub fn new(
        config: EngineConfig,
        sink: S,
        checkpoints: CheckpointStore,
        cache: Option<Arc<dyn TimestampCache>>,
    ) -> SyncResult<Self> {
        if sink.requires_dedup() && cache.is_none() {
            return Err(SyncError::configuration(format!(
                "sink {} requires a dedup cache",
                sink.destination_id()
            )));
        }
        if checkpoints.destination() != sink.destination_id() {
            return Err(SyncError::configuration(format!(
                "checkpoints track {} but the sink writes to {}",
                checkpoints.destination(),
                sink.destination_id()
            )));
        }

        sink.prepare()?;
        info!(
            account = %config.account,
            container = %config.container,
            destination = %sink.destination_id(),
            "sync engine ready"
        );

        let builder = DocumentBuilder::new(config.account.clone(), config.container.clone())
            .with_parse_json(config.parse_json);
        Ok(Self {
            config,
            sink,
            builder,
            checkpoints,
            cache,
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The checkpoint store.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Reruns sink preparation (schema reconciliation for search sinks).
    pub fn reconcile_schema(&self) -> SyncResult<()> {
        self.sink.prepare()
    }

    /// Propagates one batch of rows, given in ascending version order.
    ///
    /// Any row that cannot be translated fails the whole batch. Rows the sink
    /// rejects are logged one by one before
    /// [`SyncError::BatchPartialFailure`] is returned; in that case the
    /// caller must not advance its checkpoint past this batch.
    pub fn handle(
        &self,
        rows: &[ChangeRow],
        fetcher: &dyn MetadataFetcher,
    ) -> SyncResult<HandleReport> {
        let result = self.handle_rows(rows, fetcher);
        self.record(rows.len(), &result);
        result
    }

    fn handle_rows(
        &self,
        rows: &[ChangeRow],
        fetcher: &dyn MetadataFetcher,
    ) -> SyncResult<HandleReport> {
        let mut report = HandleReport {
            received: rows.len(),
            ..HandleReport::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }
        debug!(rows = rows.len(), container = %self.config.container, "handling rows");

        let filter = self
            .cache
            .as_deref()
            .map(|cache| DedupFilter::new(cache, self.config.cache_ttl));

        let mut documents: Vec<(String, SinkDocument)> = Vec::with_capacity(rows.len());
        for row in rows {
            let object = row.object_name()?;
            let key = self
                .sink
                .identity_key(&self.config.account, &self.config.container, object);
            if let Some(filter) = &filter {
                if !filter.should_publish(&key, &row.version()?) {
                    report.deduplicated += 1;
                    continue;
                }
            }
            let document = self.builder.build(row, fetcher)?;
            documents.push((key, document));
        }
        if documents.is_empty() {
            return Ok(report);
        }

        let batch: Vec<SinkDocument> = documents.iter().map(|(_, doc)| doc.clone()).collect();
        let outcome = self.sink.dispatch(&batch)?;

        report.dispatched = outcome.delivered.len();
        report.already_current = outcome.current.len();
        report.failed = outcome.failures.len();

        if let Some(filter) = &filter {
            let published: HashSet<&str> = outcome
                .delivered
                .iter()
                .chain(&outcome.current)
                .map(String::as_str)
                .collect();
            for (key, document) in &documents {
                if published.contains(document.id().as_str()) {
                    filter.record(key, &document.created_at);
                }
            }
        }

        outcome.into_result(documents.len())?;
        Ok(report)
    }

    fn record(&self, received: usize, result: &SyncResult<HandleReport>) {
        let mut stats = self.stats.write();
        stats.rows_received += received as u64;
        stats.last_batch_time = Some(Instant::now());
        match result {
            Ok(report) => {
                stats.batches_handled += 1;
                stats.rows_deduplicated += report.deduplicated as u64;
                stats.rows_dispatched += report.dispatched as u64;
                stats.rows_current += report.already_current as u64;
            }
            Err(e) => {
                stats.batches_failed += 1;
                if let SyncError::BatchPartialFailure { failed, .. } = e {
                    stats.rows_failed += *failed as u64;
                }
                stats.last_error = Some(e.to_string());
            }
        }
    }

    /// Last processed row of `partition` for the current destination.
    pub fn last_processed_row(&self, partition: &str) -> SyncResult<u64> {
        self.checkpoints.last_processed(partition)
    }

    /// Last verified row of `partition` for the current destination.
    pub fn last_verified_row(&self, partition: &str) -> SyncResult<u64> {
        self.checkpoints.last_verified(partition)
    }

    /// Records the last processed row of `partition`.
    pub fn save_last_processed_row(&self, partition: &str, row: u64) -> SyncResult<()> {
        self.checkpoints.save_last_processed(partition, row)
    }

    /// Records the last verified row of `partition`.
    pub fn save_last_verified_row(&self, partition: &str, row: u64) -> SyncResult<()> {
        self.checkpoints.save_last_verified(partition, row)
    }
}
