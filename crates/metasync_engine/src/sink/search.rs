//! Search index sink.

use super::Sink;
use crate::config::SearchIndexConfig;
use crate::dispatch::{BatchOutcome, BulkAction, BulkItemResult, BulkOperation};
use crate::document::SinkDocument;
use crate::error::{SyncError, SyncResult};
use crate::mapping::{SinkGeneration, TIMESTAMP_FIELD};
use crate::schema::{reconcile, SchemaPlan, TargetSchema};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Client for a search cluster.
///
/// Mirrors the handful of calls the sink needs; errors are reported as
/// plain messages.
pub trait SearchClient: Send + Sync {
    /// Version number reported by the cluster, such as `"7.4.0"`.
    fn version(&self) -> Result<String, String>;

    /// Mapping entry of `index`: an object with a `mappings` key.
    fn get_schema(&self, index: &str) -> Result<Value, String>;

    /// Adds field declarations to `index`, under `grouping` when given.
    fn put_schema(&self, index: &str, grouping: Option<&str>, body: &Value) -> Result<(), String>;

    /// Multi-get of `fields` for `ids` after a refresh. Returns the raw
    /// response: `{"docs": [{"_id", "found", "_source"}]}`.
    fn fetch_fields(&self, index: &str, ids: &[String], fields: &[&str]) -> Result<Value, String>;

    /// Submits a bulk request and returns one result per operation, in order.
    fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemResult>, String>;
}

impl<C: SearchClient + ?Sized> SearchClient for Box<C> {
    fn version(&self) -> Result<String, String> {
        (**self).version()
    }

    fn get_schema(&self, index: &str) -> Result<Value, String> {
        (**self).get_schema(index)
    }

    fn put_schema(&self, index: &str, grouping: Option<&str>, body: &Value) -> Result<(), String> {
        (**self).put_schema(index, grouping, body)
    }

    fn fetch_fields(&self, index: &str, ids: &[String], fields: &[&str]) -> Result<Value, String> {
        (**self).fetch_fields(index, ids, fields)
    }

    fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemResult>, String> {
        (**self).bulk(operations)
    }
}

impl<C: SearchClient + ?Sized> SearchClient for std::sync::Arc<C> {
    fn version(&self) -> Result<String, String> {
        (**self).version()
    }

    fn get_schema(&self, index: &str) -> Result<Value, String> {
        (**self).get_schema(index)
    }

    fn put_schema(&self, index: &str, grouping: Option<&str>, body: &Value) -> Result<(), String> {
        (**self).put_schema(index, grouping, body)
    }

    fn fetch_fields(&self, index: &str, ids: &[String], fields: &[&str]) -> Result<Value, String> {
        (**self).fetch_fields(index, ids, fields)
    }

    fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemResult>, String> {
        (**self).bulk(operations)
    }
}

/// Writes documents into one search index.
pub struct SearchIndexSink<C: SearchClient> {
    client: C,
    config: SearchIndexConfig,
    generation: RwLock<Option<SinkGeneration>>,
    write_grouping: RwLock<Option<String>>,
}

impl<C: SearchClient> SearchIndexSink<C> {
    /// Creates a sink; the schema is reconciled by [`Sink::prepare`].
    pub fn new(client: C, config: SearchIndexConfig) -> Self {
        Self {
            client,
            config,
            generation: RwLock::new(None),
            write_grouping: RwLock::new(None),
        }
    }

    /// Destination settings.
    pub fn config(&self) -> &SearchIndexConfig {
        &self.config
    }

    /// Underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Detected generation of the cluster, queried once.
    pub fn generation(&self) -> SyncResult<SinkGeneration> {
        if let Some(generation) = *self.generation.read() {
            return Ok(generation);
        }
        let version = self.client.version().map_err(SyncError::sink)?;
        let generation = SinkGeneration::from_version(&version);
        debug!(%version, %generation, "detected search cluster generation");
        *self.generation.write() = Some(generation);
        Ok(generation)
    }

    /// Grouping named on bulk writes.
    pub fn write_grouping(&self) -> Option<String> {
        self.write_grouping.read().clone()
    }

    /// Fetches the index schema and adds any missing canonical fields.
    pub fn reconcile_schema(&self) -> SyncResult<SchemaPlan> {
        let index = &self.config.index;
        let generation = self.generation()?;
        let body = self.client.get_schema(index).map_err(SyncError::sink)?;
        let schema = TargetSchema::from_response(&body)?;
        let plan = reconcile(index, generation, &schema)?;

        if let Some(patch) = &plan.patch {
            info!(
                index = %index,
                grouping = ?patch.grouping,
                fields = patch.properties.len(),
                "extending index schema"
            );
            self.client
                .put_schema(index, patch.grouping.as_deref(), &patch.body())
                .map_err(SyncError::sink)?;
        }
        *self.write_grouping.write() = plan.write_grouping.clone();
        Ok(plan)
    }

    /// Stored `x-timestamp` of each found id.
    fn stored_timestamps(&self, ids: &[String]) -> SyncResult<HashMap<String, i64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let response = self
            .client
            .fetch_fields(&self.config.index, ids, &[TIMESTAMP_FIELD])
            .map_err(SyncError::sink)?;
        let docs = response
            .get("docs")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::sink("multi-get response has no docs"))?;

        Ok(docs
            .iter()
            .filter(|doc| doc.get("found").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|doc| {
                let id = doc.get("_id").and_then(Value::as_str)?;
                let stored = doc
                    .get("_source")
                    .and_then(|source| source.get(TIMESTAMP_FIELD))
                    .and_then(Value::as_i64)?;
                Some((id.to_string(), stored))
            })
            .collect())
    }
}

impl<C: SearchClient> Sink for SearchIndexSink<C> {
    fn destination_id(&self) -> &str {
        &self.config.index
    }

    fn dedup_namespace(&self) -> &str {
        &self.config.index
    }

    fn prepare(&self) -> SyncResult<()> {
        self.reconcile_schema().map(|_| ())
    }

    fn dispatch(&self, documents: &[SinkDocument]) -> SyncResult<BatchOutcome> {
        let grouping = self.write_grouping();
        let operations: Vec<BulkOperation> = documents
            .iter()
            .map(|doc| {
                BulkOperation::for_document(
                    doc,
                    &self.config.index,
                    grouping.as_deref(),
                    self.config.pipeline.as_deref(),
                )
            })
            .collect();

        let index_ids: Vec<String> = operations
            .iter()
            .filter(|op| op.action == BulkAction::Index)
            .map(|op| op.id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let stored = self.stored_timestamps(&index_ids)?;

        let mut outcome = BatchOutcome::new();
        let mut pending = Vec::with_capacity(operations.len());
        for (doc, op) in documents.iter().zip(operations) {
            let current = op.action == BulkAction::Index
                && doc.timestamp_millis().is_some()
                && stored.get(&op.id).copied() == doc.timestamp_millis();
            if current {
                debug!(id = %op.id, object = %doc.path(), "document already current");
                outcome.current.push(op.id);
            } else {
                pending.push(op);
            }
        }

        if pending.is_empty() {
            return Ok(outcome);
        }
        debug!(
            index = %self.config.index,
            operations = pending.len(),
            skipped = outcome.current.len(),
            "submitting bulk request"
        );
        let results = self.client.bulk(&pending).map_err(SyncError::sink)?;
        let classified = BatchOutcome::classify(&pending, &results)?;
        outcome.delivered = classified.delivered;
        outcome.failures = classified.failures;
        Ok(outcome)
    }
}

/// In-memory [`SearchClient`] that behaves like a single-node cluster.
///
/// Index writes store the document; deletes of unknown ids report
/// `not_found`. Individual ids can be scripted to fail.
#[derive(Debug)]
pub struct MockSearchClient {
    version: String,
    schema: Mutex<Value>,
    documents: Mutex<HashMap<String, Value>>,
    scripted: Mutex<HashMap<String, (u16, Option<Value>)>>,
    bulk_error: Mutex<Option<String>>,
    schema_puts: Mutex<Vec<(String, Option<String>, Value)>>,
    bulk_requests: Mutex<Vec<Vec<BulkOperation>>>,
    fetches: Mutex<Vec<Vec<String>>>,
}

impl MockSearchClient {
    /// Creates a client reporting `version` with an empty schema.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            schema: Mutex::new(json!({"mappings": {}})),
            documents: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            bulk_error: Mutex::new(None),
            schema_puts: Mutex::new(Vec::new()),
            bulk_requests: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the mapping entry returned by `get_schema`.
    pub fn set_schema(&self, schema: Value) {
        *self.schema.lock() = schema;
    }

    /// Makes every later write to `id` fail with `status` and `error`.
    pub fn fail_item(&self, id: impl Into<String>, status: u16, error: Option<Value>) {
        self.scripted.lock().insert(id.into(), (status, error));
    }

    /// Makes every later bulk request fail as a whole.
    pub fn fail_bulk(&self, message: impl Into<String>) {
        *self.bulk_error.lock() = Some(message.into());
    }

    /// Stores a document directly.
    pub fn insert_document(&self, id: impl Into<String>, source: Value) {
        self.documents.lock().insert(id.into(), source);
    }

    /// Stored document by id.
    pub fn document(&self, id: &str) -> Option<Value> {
        self.documents.lock().get(id).cloned()
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        self.documents.lock().len()
    }

    /// Schema extension requests received.
    pub fn schema_puts(&self) -> Vec<(String, Option<String>, Value)> {
        self.schema_puts.lock().clone()
    }

    /// Bulk requests received.
    pub fn bulk_requests(&self) -> Vec<Vec<BulkOperation>> {
        self.bulk_requests.lock().clone()
    }

    /// Ids of every multi-get request received.
    pub fn fetches(&self) -> Vec<Vec<String>> {
        self.fetches.lock().clone()
    }

    /// Total number of write operations received.
    pub fn write_count(&self) -> usize {
        self.bulk_requests.lock().iter().map(Vec::len).sum()
    }
}

impl SearchClient for MockSearchClient {
    fn version(&self) -> Result<String, String> {
        Ok(self.version.clone())
    }

    fn get_schema(&self, _index: &str) -> Result<Value, String> {
        Ok(self.schema.lock().clone())
    }

    fn put_schema(&self, index: &str, grouping: Option<&str>, body: &Value) -> Result<(), String> {
        self.schema_puts
            .lock()
            .push((index.to_string(), grouping.map(str::to_string), body.clone()));
        Ok(())
    }

    fn fetch_fields(&self, _index: &str, ids: &[String], fields: &[&str]) -> Result<Value, String> {
        self.fetches.lock().push(ids.to_vec());
        let documents = self.documents.lock();
        let docs: Vec<Value> = ids
            .iter()
            .map(|id| match documents.get(id) {
                Some(source) => {
                    let selected: serde_json::Map<String, Value> = fields
                        .iter()
                        .filter_map(|field| source.get(*field).map(|v| ((*field).to_string(), v.clone())))
                        .collect();
                    json!({"_id": id, "found": true, "_source": selected})
                }
                None => json!({"_id": id, "found": false}),
            })
            .collect();
        Ok(json!({ "docs": docs }))
    }

    fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemResult>, String> {
        self.bulk_requests.lock().push(operations.to_vec());
        if let Some(message) = self.bulk_error.lock().clone() {
            return Err(message);
        }

        let scripted = self.scripted.lock();
        let mut documents = self.documents.lock();
        let results = operations
            .iter()
            .map(|op| {
                if let Some((status, error)) = scripted.get(&op.id) {
                    return BulkItemResult::failed(op.action, op.id.clone(), *status, error.clone());
                }
                match op.action {
                    BulkAction::Index => {
                        let source = op.source.clone().map(Value::Object).unwrap_or(Value::Null);
                        documents.insert(op.id.clone(), source);
                        BulkItemResult::ok(BulkAction::Index, op.id.clone())
                    }
                    BulkAction::Delete => match documents.remove(&op.id) {
                        Some(_) => BulkItemResult::ok(BulkAction::Delete, op.id.clone()),
                        None => BulkItemResult {
                            action: BulkAction::Delete,
                            id: Some(op.id.clone()),
                            status: 404,
                            result: Some("not_found".into()),
                            error: None,
                        },
                    },
                }
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{document_id, DocumentBuilder};
    use crate::mapping::CANONICAL_FIELDS;
    use crate::source::{ChangeRow, ObjectMetadata};
    use crate::schema::DEFAULT_GROUPING;

    fn sink(version: &str) -> SearchIndexSink<MockSearchClient> {
        SearchIndexSink::new(
            MockSearchClient::new(version),
            SearchIndexConfig::new(vec!["es.example.com".into()], "test_index"),
        )
    }

    fn build(rows: &[ChangeRow], x_timestamp: &str) -> Vec<SinkDocument> {
        let builder = DocumentBuilder::new("test_account", "test_container");
        let meta = ObjectMetadata::new()
            .with("x-timestamp", x_timestamp)
            .with("content-type", "application/x-fake");
        let fetch = move |_: &str, _: &str, _: &str, _: &[(&str, &str)]| -> Result<ObjectMetadata, String> {
            Ok(meta.clone())
        };
        rows.iter().map(|row| builder.build(row, &fetch).unwrap()).collect()
    }

    #[test]
    fn prepare_extends_empty_schema() {
        let sink = sink("6.8.0");
        sink.prepare().unwrap();

        let puts = sink.client().schema_puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "test_index");
        assert_eq!(puts[0].1.as_deref(), Some(DEFAULT_GROUPING));
        assert_eq!(
            puts[0].2["properties"].as_object().unwrap().len(),
            CANONICAL_FIELDS.len()
        );
        assert_eq!(sink.write_grouping().as_deref(), Some(DEFAULT_GROUPING));
    }

    #[test]
    fn ambiguous_schema_stops_before_writing() {
        let sink = sink("6.8.0");
        sink.client().set_schema(json!({"mappings": {
            "a": {"properties": {}},
            "b": {"properties": {}}
        }}));
        let err = sink.prepare().unwrap_err();
        assert!(matches!(err, SyncError::SchemaAmbiguity { .. }));
        assert!(err.is_fatal());
        assert!(sink.client().schema_puts().is_empty());
    }

    #[test]
    fn typeless_writes_carry_pipeline_but_no_grouping() {
        let mut config = SearchIndexConfig::new(vec!["h".into()], "test_index");
        config.pipeline = Some("test-pipeline".into());
        let sink = SearchIndexSink::new(MockSearchClient::new("7.4.0"), config);
        sink.prepare().unwrap();

        let docs = build(&[ChangeRow::update("object", "1000000")], "1000000");
        let outcome = sink.dispatch(&docs).unwrap();
        assert_eq!(outcome.delivered.len(), 1);

        let requests = sink.client().bulk_requests();
        let op = &requests[0][0];
        assert_eq!(op.grouping, None);
        assert_eq!(op.pipeline.as_deref(), Some("test-pipeline"));
        assert_eq!(op.id, document_id("test_account", "test_container", "object"));
    }

    #[test]
    fn unchanged_documents_are_skipped() {
        let sink = sink("7.4.0");
        sink.prepare().unwrap();
        let rows: Vec<_> = (0..4)
            .map(|i| ChangeRow::update(format!("object_{i}"), "1000000"))
            .collect();
        let docs = build(&rows, "1000000");

        // objects 0 and 2 already hold the same x-timestamp
        for i in [0, 2] {
            sink.client().insert_document(
                document_id("test_account", "test_container", &format!("object_{i}")),
                json!({"x-timestamp": 1_000_000_000i64}),
            );
        }
        sink.client().insert_document(
            document_id("test_account", "test_container", "object_1"),
            json!({"x-timestamp": 999_999_999i64}),
        );

        let outcome = sink.dispatch(&docs).unwrap();
        assert_eq!(outcome.current.len(), 2);
        assert_eq!(outcome.delivered.len(), 2);
        assert_eq!(sink.client().write_count(), 2);
        assert_eq!(sink.client().fetches()[0].len(), 4);
    }

    #[test]
    fn deletes_skip_the_freshness_check() {
        let sink = sink("7.4.0");
        sink.prepare().unwrap();
        let docs = build(&[ChangeRow::delete("gone", "1000000")], "1000000");
        let outcome = sink.dispatch(&docs).unwrap();
        assert_eq!(outcome.delivered.len(), 1);
        assert!(sink.client().fetches().is_empty());
    }

    #[test]
    fn bulk_transport_failure_is_a_sink_error() {
        let sink = sink("7.4.0");
        sink.prepare().unwrap();
        sink.client().fail_bulk("connection reset");
        let docs = build(&[ChangeRow::delete("gone", "1")], "1");
        let err = sink.dispatch(&docs).unwrap_err();
        assert!(err.is_retryable());
    }
}
