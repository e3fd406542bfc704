//! End-to-end tests driving the engine the way a crawler does.

use metasync_engine::{
    document_id, BulkAction, ChangeRow, CheckpointStore, ClientProvider, EngineConfig,
    FactoryConfig, MemoryTimestampCache, MessageProducer, MessageTopicConfig, MessageTopicSink,
    MockProducer, MockSearchClient, ObjectMetadata, SearchClient, SearchIndexConfig,
    SearchIndexSink, SyncEngine, SyncEngineFactory, SyncError, SyncResult, SyncSettings,
    TimestampCache,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const ACCOUNT: &str = "test_account";
const CONTAINER: &str = "test_container";

/// Metadata backend with a fixed set of objects.
struct FakeStorage {
    objects: HashMap<String, ObjectMetadata>,
}

impl FakeStorage {
    fn new() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }

    fn with(mut self, object: &str, meta: ObjectMetadata) -> Self {
        self.objects.insert(object.to_string(), meta);
        self
    }

    fn fetch(
        &self,
    ) -> impl Fn(&str, &str, &str, &[(&str, &str)]) -> Result<ObjectMetadata, String> + '_ {
        move |account: &str, container: &str, object: &str, _: &[(&str, &str)]| -> Result<ObjectMetadata, String> {
            assert_eq!((account, container), (ACCOUNT, CONTAINER));
            self.objects
                .get(object)
                .cloned()
                .ok_or_else(|| format!("404 Not Found: {object}"))
        }
    }
}

fn object_meta(x_timestamp: &str) -> ObjectMetadata {
    ObjectMetadata::new()
        .with("content-length", "42")
        .with("content-type", "application/x-fake")
        .with("x-timestamp", x_timestamp)
        .with("x-object-meta-foo", "bar")
}

fn search_engine(
    status_dir: &Path,
    client: Arc<MockSearchClient>,
    cache: Option<Arc<dyn TimestampCache>>,
) -> SyncEngine<SearchIndexSink<Arc<MockSearchClient>>> {
    SyncEngine::new(
        EngineConfig::new(ACCOUNT, CONTAINER),
        SearchIndexSink::new(client, SearchIndexConfig::new(vec!["h".into()], "test_index")),
        CheckpointStore::new(status_dir, ACCOUNT, CONTAINER, "test_index"),
        cache,
    )
    .unwrap()
}

fn message_engine(
    status_dir: &Path,
    producer: Arc<MockProducer>,
    cache: Arc<dyn TimestampCache>,
) -> SyncEngine<MessageTopicSink<Arc<MockProducer>>> {
    SyncEngine::new(
        EngineConfig::new(ACCOUNT, CONTAINER),
        MessageTopicSink::new(
            producer,
            MessageTopicConfig::new(vec!["k:9092".into()], "changes", "cluster"),
        ),
        CheckpointStore::new(status_dir, ACCOUNT, CONTAINER, "changes"),
        Some(cache),
    )
    .unwrap()
}

#[test]
fn update_document_reaches_the_index() {
    let temp = tempdir().unwrap();
    let client = Arc::new(MockSearchClient::new("7.4.0"));
    let engine = search_engine(temp.path(), client.clone(), None);
    let storage = FakeStorage::new().with(
        "obj",
        ObjectMetadata::new()
            .with("content-length", "42")
            .with("last-modified", "Wed, 06 Jun 2018 22:24:19 GMT")
            .with("x-object-meta-foo", "bar"),
    );

    let report = engine
        .handle(&[ChangeRow::update("obj", "1528323859.00000")], &storage.fetch())
        .unwrap();
    assert_eq!(report.dispatched, 1);

    let id = document_id(ACCOUNT, CONTAINER, "obj");
    assert_eq!(
        client.document(&id).unwrap(),
        json!({
            "x-swift-account": ACCOUNT,
            "x-swift-container": CONTAINER,
            "x-swift-object": "obj",
            "content-length": 42,
            "last-modified": 1_528_323_859_000i64,
            "foo": "bar",
        })
    );
}

#[test]
fn ten_deletes_with_one_already_gone() {
    let temp = tempdir().unwrap();
    let client = Arc::new(MockSearchClient::new("7.4.0"));
    let engine = search_engine(temp.path(), client.clone(), None);

    let rows: Vec<_> = (0..10)
        .map(|i| ChangeRow::delete(format!("row {i}"), "1000000"))
        .collect();
    for i in (0..10).filter(|i| *i != 4) {
        client.insert_document(document_id(ACCOUNT, CONTAINER, &format!("row {i}")), json!({}));
    }

    let report = engine.handle(&rows, &FakeStorage::new().fetch()).unwrap();
    assert_eq!(report.dispatched, 10);
    assert_eq!(report.failed, 0);

    let requests = client.bulk_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].len(), 10);
    assert!(requests[0].iter().all(|op| op.action == BulkAction::Delete));
    assert_eq!(client.document_count(), 0);
}

#[test]
fn repeated_batch_sends_no_redundant_messages() {
    let temp = tempdir().unwrap();
    let producer = Arc::new(MockProducer::new());
    let cache: Arc<dyn TimestampCache> = Arc::new(MemoryTimestampCache::new());
    let engine = message_engine(temp.path(), producer.clone(), cache);
    let storage = FakeStorage::new()
        .with("a", object_meta("1000000"))
        .with("b", object_meta("1000000"));
    let rows = [
        ChangeRow::update("a", "1000000.00000"),
        ChangeRow::update("b", "1000000.00000+0+64"),
        ChangeRow::delete("c", "1000000.00000"),
    ];

    let first = engine.handle(&rows, &storage.fetch()).unwrap();
    assert_eq!(first.dispatched, 3);
    let second = engine.handle(&rows, &storage.fetch()).unwrap();
    assert_eq!(second.deduplicated, 3);
    assert_eq!(second.dispatched, 0);
    assert_eq!(producer.sent().len(), 3);

    // a newer metadata version goes through again
    let third = engine
        .handle(&[ChangeRow::update("b", "1000000.00000+0+65")], &storage.fetch())
        .unwrap();
    assert_eq!(third.dispatched, 1);
    assert_eq!(producer.sent().len(), 4);
}

#[test]
fn repeated_batch_sends_no_redundant_index_writes() {
    let temp = tempdir().unwrap();
    let client = Arc::new(MockSearchClient::new("6.8.0"));
    let cache: Arc<dyn TimestampCache> = Arc::new(MemoryTimestampCache::new());
    let engine = search_engine(temp.path(), client.clone(), Some(cache));
    let storage = FakeStorage::new().with("a", object_meta("1000000"));
    let rows = [ChangeRow::update("a", "1000000"), ChangeRow::delete("b", "1000000")];

    engine.handle(&rows, &storage.fetch()).unwrap();
    let writes = client.write_count();
    let report = engine.handle(&rows, &storage.fetch()).unwrap();

    assert_eq!(report.deduplicated, 2);
    assert_eq!(client.write_count(), writes);
    assert!(client.bulk_requests()[0]
        .iter()
        .all(|op| op.grouping.as_deref() == Some("_doc")));
}

#[test]
fn document_ids_do_not_depend_on_batching() {
    let temp = tempdir().unwrap();
    let storage = FakeStorage::new()
        .with("x", object_meta("1"))
        .with("y", object_meta("2"))
        .with("monkey-\u{1f435}", object_meta("3"));
    let rows = [
        ChangeRow::update("x", "1"),
        ChangeRow::update("y", "2"),
        ChangeRow::update("monkey-\u{1f435}", "3"),
    ];

    let together = Arc::new(MockSearchClient::new("7.4.0"));
    search_engine(temp.path(), together.clone(), None)
        .handle(&rows, &storage.fetch())
        .unwrap();

    let separately = Arc::new(MockSearchClient::new("7.4.0"));
    let engine = search_engine(temp.path(), separately.clone(), None);
    for row in rows.iter().rev() {
        engine.handle(std::slice::from_ref(row), &storage.fetch()).unwrap();
    }

    let mut ids_together: Vec<String> = together.bulk_requests().concat().into_iter().map(|op| op.id).collect();
    let mut ids_separately: Vec<String> = separately.bulk_requests().concat().into_iter().map(|op| op.id).collect();
    ids_together.sort();
    ids_separately.sort();
    assert_eq!(ids_together, ids_separately);
    assert!(ids_together.contains(&document_id(ACCOUNT, CONTAINER, "monkey-\u{1f435}")));
}

#[test]
fn crawler_only_advances_after_success() {
    let temp = tempdir().unwrap();
    let client = Arc::new(MockSearchClient::new("7.4.0"));
    let engine = search_engine(temp.path(), client.clone(), None);
    let storage = FakeStorage::new().with("ok", object_meta("1"));
    let partition = "db-1";

    // batch 1 succeeds
    let batch = [ChangeRow::update("ok", "1")];
    if engine.handle(&batch, &storage.fetch()).is_ok() {
        engine.save_last_processed_row(partition, 10).unwrap();
    }
    assert_eq!(engine.last_processed_row(partition).unwrap(), 10);

    // batch 2 hits a rejected row
    client.fail_item(
        document_id(ACCOUNT, CONTAINER, "bad"),
        400,
        Some(json!({"reason": "mapper_parsing_exception"})),
    );
    let batch = [ChangeRow::delete("bad", "2")];
    let result = engine.handle(&batch, &storage.fetch());
    assert!(matches!(result, Err(SyncError::BatchPartialFailure { failed: 1, total: 1 })));
    if result.is_ok() {
        engine.save_last_processed_row(partition, 20).unwrap();
    }
    assert_eq!(engine.last_processed_row(partition).unwrap(), 10);

    // batch 3 cannot fetch metadata
    let batch = [ChangeRow::update("missing", "3")];
    let err = engine.handle(&batch, &storage.fetch()).unwrap_err();
    assert!(matches!(err, SyncError::MetadataFetch { .. }));
    assert!(err.is_retryable());

    // verification lags behind processing
    assert_eq!(engine.last_verified_row(partition).unwrap(), 0);
    engine.save_last_verified_row(partition, 10).unwrap();
    assert_eq!(engine.last_verified_row(partition).unwrap(), 10);
}

#[test]
fn malformed_checkpoint_restarts_from_zero() {
    let temp = tempdir().unwrap();
    let store = CheckpointStore::new(temp.path(), ACCOUNT, CONTAINER, "test_index");
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(store.path(), b"").unwrap();
    assert_eq!(store.last_processed("any").unwrap(), 0);

    std::fs::write(store.path(), b"[1, 2").unwrap();
    assert_eq!(store.last_processed("any").unwrap(), 0);
    assert_eq!(store.last_verified("any").unwrap(), 0);
}

#[test]
fn verified_never_passes_processed() {
    let temp = tempdir().unwrap();
    let store = CheckpointStore::new(temp.path(), ACCOUNT, CONTAINER, "test_index");
    for row in [5u64, 9, 12, 40] {
        store.save_last_processed("p", row).unwrap();
        let verified = store.last_verified("p").unwrap();
        let processed = store.last_processed("p").unwrap();
        assert!(verified <= processed, "{verified} > {processed}");
    }
}

#[test]
fn ambiguous_schema_prevents_construction() {
    let temp = tempdir().unwrap();
    let client = Arc::new(MockSearchClient::new("6.8.0"));
    client.set_schema(json!({"mappings": {
        "first": {"properties": {"etag": {"type": "keyword"}}},
        "second": {"properties": {"content-type": {"type": "text"}}}
    }}));
    let result = SyncEngine::new(
        EngineConfig::new(ACCOUNT, CONTAINER),
        SearchIndexSink::new(client.clone(), SearchIndexConfig::new(vec!["h".into()], "test_index")),
        CheckpointStore::new(temp.path(), ACCOUNT, CONTAINER, "test_index"),
        None,
    );
    match result {
        Err(SyncError::SchemaAmbiguity { groupings, .. }) => {
            assert_eq!(groupings, vec!["first".to_string(), "second".to_string()]);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("engine built over an ambiguous schema"),
    }
    assert!(client.schema_puts().is_empty());
    assert!(client.bulk_requests().is_empty());
}

struct SharedProvider {
    client: Arc<MockSearchClient>,
    producer: Arc<MockProducer>,
}

impl ClientProvider for SharedProvider {
    fn search_client(&self, _config: &SearchIndexConfig) -> SyncResult<Box<dyn SearchClient>> {
        Ok(Box::new(self.client.clone()))
    }

    fn producer(&self, _config: &MessageTopicConfig) -> SyncResult<Box<dyn MessageProducer>> {
        Ok(Box::new(self.producer.clone()))
    }

    fn timestamp_cache(&self, _servers: &[String]) -> SyncResult<Arc<dyn TimestampCache>> {
        Ok(Arc::new(MemoryTimestampCache::new()))
    }
}

#[test]
fn factory_engine_handles_rows() {
    let temp = tempdir().unwrap();
    let provider = SharedProvider {
        client: Arc::new(MockSearchClient::new("5.4.0")),
        producer: Arc::new(MockProducer::new()),
    };
    let client = provider.client.clone();
    let factory = SyncEngineFactory::new(&FactoryConfig::new(temp.path()), provider).unwrap();
    let settings = SyncSettings::from_json(&json!({
        "es_hosts": "es.example.com",
        "index": "test_index",
        "account": ACCOUNT,
        "container": CONTAINER,
        "parse_json": true,
        "pipeline": "p"
    })
    .to_string())
    .unwrap();
    let engine = factory.instance(&settings, false).unwrap();

    let storage = FakeStorage::new().with(
        "object",
        ObjectMetadata::new()
            .with("x-timestamp", "0")
            .with("last-modified", "Wed, 06 Jun 2018 22:24:19 GMT")
            .with("x-object-meta-test", r#"{"bool": true, "number": 1234}"#),
    );
    engine
        .handle(&[ChangeRow::update("object", "0")], &storage.fetch())
        .unwrap();

    let op = &client.bulk_requests()[0][0];
    assert_eq!(op.grouping.as_deref(), Some("_doc"));
    assert_eq!(op.pipeline.as_deref(), Some("p"));
    let source = Value::Object(op.source.clone().unwrap());
    assert_eq!(
        source,
        json!({
            "test": {"bool": true, "number": 1234},
            "x-timestamp": 0,
            "last-modified": 1_528_323_859_000i64,
            "x-swift-account": ACCOUNT,
            "x-swift-container": CONTAINER,
            "x-swift-object": "object",
        })
    );
}
