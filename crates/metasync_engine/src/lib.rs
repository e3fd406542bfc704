//! # metasync engine
//!
//! Propagates object-storage change feeds into a search index or a message
//! topic.
//!
//! This crate provides:
//! - Version token decoding and ordering
//! - Document building from object metadata
//! - Additive schema reconciliation across sink generations
//! - Bulk dispatch with per-item failure classification
//! - Best-effort dedup of redundant notifications
//! - File-backed checkpoints per source partition
//!
//! ## Architecture
//!
//! A crawler (outside this crate) discovers rows and calls
//! [`SyncEngine::handle`] once per batch:
//!
//! ```text
//! rows ─► DedupFilter ─► DocumentBuilder ─► Sink::dispatch ─► BatchOutcome
//!              │                                                  │
//!        TimestampCache                               per-item error logs
//! ```
//!
//! The crawler then advances the partition cursor through the engine's
//! checkpoint accessors, but only when `handle` succeeded.
//!
//! ## Key Invariants
//!
//! - Sink document ids depend only on account, container and object name
//! - Schema changes only ever add fields
//! - A rejected row fails the whole batch, after every rejection is logged
//! - Dedup cache failures never fail a batch
//! - Checkpoints recorded for another destination read as zero

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod dedup;
mod dispatch;
mod document;
mod engine;
mod error;
mod factory;
mod mapping;
mod schema;
mod sink;
mod source;
mod version;

pub use checkpoint::{load_record, record_path, CheckpointEntry, CheckpointRecord, CheckpointStore};
pub use config::{
    DestinationConfig, EngineConfig, Endpoints, FactoryConfig, MessageTopicConfig,
    SearchIndexConfig, SyncSettings, SEARCH_PROVIDER,
};
pub use dedup::{identity_key, DedupFilter, MemoryTimestampCache, TimestampCache, DEFAULT_CACHE_TTL};
pub use dispatch::{
    extract_reason, to_ndjson, BatchOutcome, BulkAction, BulkItemResult, BulkOperation,
    ItemFailure,
};
pub use document::{document_id, http_date_millis, DocumentBuilder, FieldMap, FieldSource, SinkDocument};
pub use engine::{HandleReport, SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use factory::{ClientProvider, DynSyncEngine, SyncEngineFactory};
pub use mapping::{
    canonical_type, FieldType, SchemaCompat, SinkGeneration, ACCOUNT_FIELD, CANONICAL_FIELDS,
    CONTAINER_FIELD, LAST_MODIFIED_FIELD, OBJECT_FIELD, OP_TYPE_FIELD, TIMESTAMP_FIELD,
};
pub use schema::{reconcile, SchemaPatch, SchemaPlan, TargetSchema, DEFAULT_GROUPING, LEGACY_GROUPING};
pub use sink::{
    MessageProducer, MessageTopicSink, MockProducer, MockSearchClient, SearchClient,
    SearchIndexSink, Sink,
};
pub use source::{ChangeRow, MetadataFetcher, ObjectMetadata, NEWEST_HEADER, USER_META_PREFIX};
pub use version::{Operation, Timestamp, VersionToken, TICKS_PER_SECOND};
