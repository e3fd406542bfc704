//! Bulk operations and per-item result classification.

use crate::document::SinkDocument;
use crate::error::{SyncError, SyncResult};
use serde_json::{Map, Value};
use tracing::error;

/// Write operation kind in a bulk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkAction {
    /// Create or replace a document.
    Index,
    /// Remove a document.
    Delete,
}

impl BulkAction {
    /// Bulk API name of the action.
    pub const fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Delete => "delete",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "index" | "create" | "update" => Some(BulkAction::Index),
            "delete" => Some(BulkAction::Delete),
            _ => None,
        }
    }
}

/// One write in a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    /// Write kind.
    pub action: BulkAction,
    /// Destination index.
    pub index: String,
    /// Grouping, on sinks that require one.
    pub grouping: Option<String>,
    /// Document id.
    pub id: String,
    /// Ingest pipeline applied to index writes.
    pub pipeline: Option<String>,
    /// Document body for index writes.
    pub source: Option<Map<String, Value>>,
}

impl BulkOperation {
    /// Creates the write for one document.
    pub fn for_document(
        document: &SinkDocument,
        index: &str,
        grouping: Option<&str>,
        pipeline: Option<&str>,
    ) -> Self {
        let (action, pipeline, source) = if document.is_delete() {
            (BulkAction::Delete, None, None)
        } else {
            (
                BulkAction::Index,
                pipeline.map(str::to_string),
                Some(document.fields.to_json()),
            )
        };
        Self {
            action,
            index: index.to_string(),
            grouping: grouping.map(str::to_string),
            id: document.id(),
            pipeline,
            source,
        }
    }

    /// Action metadata line of the bulk body.
    pub fn header(&self) -> Value {
        let mut meta = Map::new();
        meta.insert("_index".into(), Value::from(self.index.as_str()));
        if let Some(grouping) = &self.grouping {
            meta.insert("_type".into(), Value::from(grouping.as_str()));
        }
        meta.insert("_id".into(), Value::from(self.id.as_str()));
        if let Some(pipeline) = &self.pipeline {
            meta.insert("pipeline".into(), Value::from(pipeline.as_str()));
        }
        let mut header = Map::new();
        header.insert(self.action.as_str().into(), Value::Object(meta));
        Value::Object(header)
    }
}

/// Renders operations as a newline-delimited bulk body.
pub fn to_ndjson(operations: &[BulkOperation]) -> String {
    let mut body = String::new();
    for op in operations {
        body.push_str(&op.header().to_string());
        body.push('\n');
        if let Some(source) = &op.source {
            body.push_str(&Value::Object(source.clone()).to_string());
            body.push('\n');
        }
    }
    body
}

/// Result of one bulk item as reported by the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    /// Write kind.
    pub action: BulkAction,
    /// Document id, when reported.
    pub id: Option<String>,
    /// HTTP-style status code.
    pub status: u16,
    /// `result` field (`created`, `deleted`, `not_found`, ...).
    pub result: Option<String>,
    /// Error structure, when the item failed.
    pub error: Option<Value>,
}

impl BulkItemResult {
    /// Successful result for `id`.
    pub fn ok(action: BulkAction, id: impl Into<String>) -> Self {
        Self {
            action,
            id: Some(id.into()),
            status: if action == BulkAction::Index { 201 } else { 200 },
            result: None,
            error: None,
        }
    }

    /// Failed result for `id`.
    pub fn failed(action: BulkAction, id: impl Into<String>, status: u16, error: Option<Value>) -> Self {
        Self {
            action,
            id: Some(id.into()),
            status,
            result: None,
            error,
        }
    }

    /// Parses one entry of a bulk response `items` array, such as
    /// `{"delete": {"_id": "...", "status": 404, "result": "not_found"}}`.
    pub fn from_response_item(item: &Value) -> SyncResult<Self> {
        let malformed = || SyncError::sink(format!("malformed bulk response item: {item}"));
        let (name, body) = item
            .as_object()
            .and_then(|entries| entries.iter().next())
            .ok_or_else(malformed)?;
        let action = BulkAction::from_name(name).ok_or_else(malformed)?;
        let status = body
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
            .ok_or_else(malformed)?;

        Ok(Self {
            action,
            id: body.get("_id").and_then(Value::as_str).map(str::to_string),
            status,
            result: body.get("result").and_then(Value::as_str).map(str::to_string),
            error: body.get("error").cloned(),
        })
    }

    /// Parses the `items` array of a bulk response body.
    pub fn from_response(body: &Value) -> SyncResult<Vec<Self>> {
        body.get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::sink("bulk response has no items"))?
            .iter()
            .map(Self::from_response_item)
            .collect()
    }

    /// Returns true for a delete of a document that does not exist.
    pub fn is_not_found_delete(&self) -> bool {
        self.action == BulkAction::Delete
            && (self.status == 404 || self.result.as_deref() == Some("not_found"))
    }

    /// Returns true if the item needs no further attention.
    pub fn is_success(&self) -> bool {
        (self.status < 300 && self.error.is_none()) || self.is_not_found_delete()
    }
}

/// Builds the most useful human-readable reason for a failed item.
pub fn extract_reason(status: u16, error: Option<&Value>) -> String {
    let Some(error) = error else {
        return status.to_string();
    };
    let text = |value: &Value| match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .first()
            .and_then(|first| first.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Object(_) => value.get("reason").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    let primary = error
        .get("root_cause")
        .and_then(text)
        .or_else(|| error.get("reason").and_then(text));
    let Some(primary) = primary else {
        return format!("Unspecified error: {status}");
    };
    match error
        .get("caused_by")
        .and_then(|cause| cause.get("reason"))
        .and_then(Value::as_str)
    {
        Some(cause) => format!("{primary}: {cause}"),
        None => primary,
    }
}

/// A row the sink rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Document id (or message key) of the row.
    pub id: String,
    /// Best available reason.
    pub reason: String,
}

impl ItemFailure {
    /// Creates a failure.
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Classified result of one dispatched batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Ids of rows the sink accepted.
    pub delivered: Vec<String>,
    /// Ids of rows skipped because the sink already holds them.
    pub current: Vec<String>,
    /// Rows the sink rejected.
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    /// Creates an empty outcome.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies bulk item results against the operations that produced them.
    ///
    /// Items are matched by position; the operation id is used when the sink
    /// omits `_id` from an item.
    pub fn classify(operations: &[BulkOperation], results: &[BulkItemResult]) -> SyncResult<Self> {
        if operations.len() != results.len() {
            return Err(SyncError::sink(format!(
                "bulk response has {} items for {} operations",
                results.len(),
                operations.len()
            )));
        }

        let mut outcome = Self::new();
        for (op, item) in operations.iter().zip(results) {
            let id = item.id.clone().unwrap_or_else(|| op.id.clone());
            if item.is_success() {
                outcome.delivered.push(id);
            } else {
                outcome
                    .failures
                    .push(ItemFailure::new(id, extract_reason(item.status, item.error.as_ref())));
            }
        }
        Ok(outcome)
    }

    /// Number of rows accounted for.
    pub fn total(&self) -> usize {
        self.delivered.len() + self.current.len() + self.failures.len()
    }

    /// Returns true if no row was rejected.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Logs every failure as `<id>: <reason>`.
    pub fn log_failures(&self) {
        for failure in &self.failures {
            error!("{}: {}", failure.id, failure.reason);
        }
    }

    /// Logs failures and converts a partial failure into an error.
    pub fn into_result(self, total: usize) -> SyncResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        self.log_failures();
        Err(SyncError::BatchPartialFailure {
            failed: self.failures.len(),
            total,
        })
    }
}
