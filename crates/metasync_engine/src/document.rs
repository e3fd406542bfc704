//! Translation of change rows and object metadata into sink documents.
//!
//! A document is assembled from four field layers. Layers are merged in
//! precedence order and the first layer to set a field wins:
//!
//! 1. identity (`x-swift-account`, `x-swift-container`, `x-swift-object`)
//! 2. timestamps (`last-modified`, `x-timestamp`, epoch milliseconds)
//! 3. system fields listed in the canonical mapping
//! 4. user metadata, with the `x-object-meta-` prefix stripped

use crate::error::{SyncError, SyncResult};
use crate::mapping::{
    FieldType, ACCOUNT_FIELD, CANONICAL_FIELDS, CONTAINER_FIELD, LAST_MODIFIED_FIELD,
    OBJECT_FIELD, TIMESTAMP_FIELD,
};
use crate::source::{decode_text, ChangeRow, MetadataFetcher, ObjectMetadata, NEWEST_HEADER};
use crate::version::{Operation, Timestamp, VersionToken};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Layer a document field came from, in decreasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldSource {
    /// Account, container and object name.
    Identity,
    /// Times derived from metadata headers.
    Timestamp,
    /// System metadata named by the canonical mapping.
    System,
    /// User-defined metadata.
    User,
}

/// Document fields with first-write-wins semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    fields: BTreeMap<String, (FieldSource, Value)>,
}

impl FieldMap {
    /// Creates an empty field map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field unless it is already present.
    ///
    /// Returns true if the value was stored.
    pub fn offer(&mut self, source: FieldSource, name: impl Into<String>, value: Value) -> bool {
        match self.fields.entry(name.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert((source, value));
                true
            }
        }
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(|(_, value)| value)
    }

    /// Returns the layer a field came from.
    pub fn source(&self, name: &str) -> Option<FieldSource> {
        self.fields.get(name).map(|(source, _)| *source)
    }

    /// Returns true if the field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .map(|(name, (_, value))| (name.as_str(), value))
    }

    /// Renders the fields as a JSON object.
    pub fn to_json(&self) -> Map<String, Value> {
        self.iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }
}

/// A translated change, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkDocument {
    /// Kind of change.
    pub operation: Operation,
    /// Account holding the object.
    pub account: String,
    /// Container holding the object.
    pub container: String,
    /// Object name.
    pub object: String,
    /// Decoded version token of the row.
    pub version: VersionToken,
    /// Version token exactly as received, recorded in the dedup cache.
    pub created_at: String,
    /// Document body.
    pub fields: FieldMap,
}

impl SinkDocument {
    /// Content-addressed id of the sink record.
    pub fn id(&self) -> String {
        document_id(&self.account, &self.container, &self.object)
    }

    /// `account/container/object` path, for log messages.
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.account, self.container, self.object)
    }

    /// Returns true for deletion markers.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// The `x-timestamp` field in epoch milliseconds, if present.
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.fields.get(TIMESTAMP_FIELD).and_then(Value::as_i64)
    }
}

/// Computes the sink record id of an object.
///
/// The id is the hex SHA-256 of `account/container/object`, so it only
/// depends on the object's identity.
pub fn document_id(account: &str, container: &str, object: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account.as_bytes());
    hasher.update(b"/");
    hasher.update(container.as_bytes());
    hasher.update(b"/");
    hasher.update(object.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Converts an HTTP date (RFC 2822) into epoch milliseconds.
pub fn http_date_millis(value: &str) -> SyncResult<i64> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .map(|date| date.timestamp_millis())
        .map_err(|e| SyncError::invalid_metadata(LAST_MODIFIED_FIELD, format!("{value:?}: {e}")))
}

/// Builds sink documents for one container.
#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    account: String,
    container: String,
    parse_json: bool,
}

impl DocumentBuilder {
    /// Creates a builder for `account/container`.
    pub fn new(account: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            parse_json: false,
        }
    }

    /// Attempts JSON decoding of user metadata values.
    #[must_use]
    pub fn with_parse_json(mut self, parse_json: bool) -> Self {
        self.parse_json = parse_json;
        self
    }

    /// Account the builder writes for.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Container the builder writes for.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Translates one change row.
    ///
    /// Deletions need no metadata; every other row fetches the newest
    /// metadata of the object through `fetcher`.
    pub fn build(&self, row: &ChangeRow, fetcher: &dyn MetadataFetcher) -> SyncResult<SinkDocument> {
        let object = row.object_name()?;
        let version = row.version()?;
        let operation = version.operation(row.deleted);

        let mut fields = self.identity_fields(object);
        if row.deleted {
            fields.offer(
                FieldSource::Timestamp,
                LAST_MODIFIED_FIELD,
                Value::from(version.meta_time().as_millis()),
            );
        } else {
            let meta = fetcher
                .fetch_metadata(&self.account, &self.container, object, &[NEWEST_HEADER])
                .map_err(|message| SyncError::MetadataFetch {
                    object: format!("{}/{}/{}", self.account, self.container, object),
                    message,
                })?;
            self.add_timestamps(&mut fields, &meta, &version)?;
            add_system_fields(&mut fields, &meta)?;
            self.add_user_fields(&mut fields, &meta)?;
        }

        Ok(SinkDocument {
            operation,
            account: self.account.clone(),
            container: self.container.clone(),
            object: object.to_string(),
            version,
            created_at: row.created_at.clone(),
            fields,
        })
    }

    fn identity_fields(&self, object: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.offer(FieldSource::Identity, ACCOUNT_FIELD, Value::from(self.account.as_str()));
        fields.offer(FieldSource::Identity, CONTAINER_FIELD, Value::from(self.container.as_str()));
        fields.offer(FieldSource::Identity, OBJECT_FIELD, Value::from(object));
        fields
    }

    fn add_timestamps(
        &self,
        fields: &mut FieldMap,
        meta: &ObjectMetadata,
        version: &VersionToken,
    ) -> SyncResult<()> {
        let x_timestamp = meta
            .get_str(TIMESTAMP_FIELD)?
            .map(|raw| {
                raw.parse::<Timestamp>()
                    .map(|ts| ts.as_millis())
                    .map_err(|e| SyncError::invalid_metadata(TIMESTAMP_FIELD, e.to_string()))
            })
            .transpose()?;

        let last_modified = match meta.get_str(LAST_MODIFIED_FIELD)? {
            Some(raw) => http_date_millis(raw)?,
            None => x_timestamp.unwrap_or_else(|| version.data_time().as_millis()),
        };

        fields.offer(FieldSource::Timestamp, LAST_MODIFIED_FIELD, Value::from(last_modified));
        if let Some(millis) = x_timestamp {
            fields.offer(FieldSource::Timestamp, TIMESTAMP_FIELD, Value::from(millis));
        }
        Ok(())
    }

    fn add_user_fields(&self, fields: &mut FieldMap, meta: &ObjectMetadata) -> SyncResult<()> {
        for (name, value) in meta.user_metadata() {
            let name = decode_text("user metadata name", name)?;
            let text = decode_text(name, value)?;
            let value = if self.parse_json {
                serde_json::from_str(text).unwrap_or_else(|_| Value::from(text))
            } else {
                Value::from(text)
            };
            fields.offer(FieldSource::User, name, value);
        }
        Ok(())
    }
}

fn add_system_fields(fields: &mut FieldMap, meta: &ObjectMetadata) -> SyncResult<()> {
    for (name, ty) in CANONICAL_FIELDS {
        if fields.contains(name) {
            continue;
        }
        if let Some(raw) = meta.get_str(name)? {
            fields.offer(FieldSource::System, *name, system_value(*ty, raw));
        }
    }
    Ok(())
}

fn system_value(ty: FieldType, raw: &str) -> Value {
    match ty {
        FieldType::Long => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(raw)),
        FieldType::Boolean => {
            let lowered = raw.trim().to_ascii_lowercase();
            match lowered.as_str() {
                "true" | "1" | "yes" | "on" | "t" | "y" => Value::from("true"),
                "false" | "0" | "no" | "off" | "f" | "n" => Value::from("false"),
                _ => Value::from(lowered),
            }
        }
        FieldType::Date => raw
            .parse::<Timestamp>()
            .map(|ts| Value::from(ts.as_millis()))
            .unwrap_or_else(|_| Value::from(raw)),
        FieldType::Text | FieldType::Keyword => Value::from(raw),
    }
}
