//! Canonical field mapping and per-generation schema translation.

use serde_json::{json, Map, Value};
use std::fmt;

/// Account identity field.
pub const ACCOUNT_FIELD: &str = "x-swift-account";
/// Container identity field.
pub const CONTAINER_FIELD: &str = "x-swift-container";
/// Object identity field.
pub const OBJECT_FIELD: &str = "x-swift-object";
/// Last modification time in epoch milliseconds.
pub const LAST_MODIFIED_FIELD: &str = "last-modified";
/// Storage timestamp in epoch milliseconds.
pub const TIMESTAMP_FIELD: &str = "x-timestamp";
/// Operation type field in message payloads.
pub const OP_TYPE_FIELD: &str = "op-type";

/// Declared type of a canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Integer.
    Long,
    /// Date, stored as epoch milliseconds.
    Date,
    /// Boolean, stored as `"true"` / `"false"`.
    Boolean,
    /// String searchable as free text and by exact match.
    Text,
    /// String searchable by exact match only.
    Keyword,
}

impl FieldType {
    /// Returns true for the string types.
    #[must_use]
    pub const fn is_string(&self) -> bool {
        matches!(self, FieldType::Text | FieldType::Keyword)
    }
}

/// The fields every destination schema must eventually declare.
pub const CANONICAL_FIELDS: &[(&str, FieldType)] = &[
    ("content-length", FieldType::Long),
    ("content-type", FieldType::Text),
    ("etag", FieldType::Keyword),
    (LAST_MODIFIED_FIELD, FieldType::Date),
    ("x-object-manifest", FieldType::Text),
    ("x-static-large-object", FieldType::Boolean),
    (CONTAINER_FIELD, FieldType::Text),
    (ACCOUNT_FIELD, FieldType::Text),
    (OBJECT_FIELD, FieldType::Text),
    (TIMESTAMP_FIELD, FieldType::Date),
    ("x-trans-id", FieldType::Keyword),
];

/// Returns the declared type of a canonical field.
#[must_use]
pub fn canonical_type(name: &str) -> Option<FieldType> {
    CANONICAL_FIELDS
        .iter()
        .find(|(field, _)| *field == name)
        .map(|(_, ty)| *ty)
}

/// Schema generation of the search sink.
///
/// Each generation declares string fields differently and handles field
/// groupings (mapping types) differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SinkGeneration {
    /// Before 5.x: a single `string` type, groupings required.
    Legacy,
    /// 5.x and 6.x: `text` / `keyword`, groupings required.
    Typed,
    /// 7.x and later: `text` / `keyword`, no groupings.
    Typeless,
}

impl SinkGeneration {
    /// Detects the generation from a reported version number such as `"6.8.0"`.
    ///
    /// Unparsable versions are treated as the newest generation.
    #[must_use]
    pub fn from_version(version: &str) -> Self {
        let major = version
            .trim()
            .split('.')
            .next()
            .and_then(|major| major.parse::<u32>().ok());
        match major {
            Some(major) if major < 5 => SinkGeneration::Legacy,
            Some(major) if major < 7 => SinkGeneration::Typed,
            _ => SinkGeneration::Typeless,
        }
    }

    /// Returns true if writes and schema updates name a grouping.
    #[must_use]
    pub const fn uses_groupings(&self) -> bool {
        !matches!(self, SinkGeneration::Typeless)
    }

    /// Returns the schema translation used for this generation.
    #[must_use]
    pub const fn compat(&self) -> SchemaCompat {
        match self {
            SinkGeneration::Legacy => SchemaCompat::LegacyString,
            SinkGeneration::Typed | SinkGeneration::Typeless => SchemaCompat::TextKeyword,
        }
    }
}

impl fmt::Display for SinkGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkGeneration::Legacy => "legacy",
            SinkGeneration::Typed => "typed",
            SinkGeneration::Typeless => "typeless",
        };
        f.write_str(name)
    }
}

/// How canonical field types are declared on a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaCompat {
    /// Strings declared as `string`; exact-only strings are `not_analyzed`.
    LegacyString,
    /// Text becomes `text` with a `keyword` sub-field; exact-only strings
    /// become `keyword`.
    TextKeyword,
}

impl SchemaCompat {
    /// Declares one field type.
    #[must_use]
    pub fn declare(&self, ty: FieldType) -> Value {
        match (self, ty) {
            (_, FieldType::Long) => json!({"type": "long"}),
            (_, FieldType::Date) => json!({"type": "date"}),
            (_, FieldType::Boolean) => json!({"type": "boolean"}),
            (SchemaCompat::LegacyString, FieldType::Text) => json!({"type": "string"}),
            (SchemaCompat::LegacyString, FieldType::Keyword) => {
                json!({"type": "string", "index": "not_analyzed"})
            }
            (SchemaCompat::TextKeyword, FieldType::Text) => json!({
                "type": "text",
                "fields": {"keyword": {"type": "keyword"}}
            }),
            (SchemaCompat::TextKeyword, FieldType::Keyword) => json!({"type": "keyword"}),
        }
    }

    /// Declares a set of canonical fields as a `properties` body.
    #[must_use]
    pub fn declare_all(&self, fields: &[(&str, FieldType)]) -> Map<String, Value> {
        fields
            .iter()
            .map(|(name, ty)| ((*name).to_string(), self.declare(*ty)))
            .collect()
    }
}
