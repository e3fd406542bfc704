//! Target schema inspection and additive reconciliation.
//!
//! The reconciler never alters or removes an existing declaration. It only
//! computes the canonical fields the destination lacks and the grouping the
//! extension must be applied to.

use crate::error::{SyncError, SyncResult};
use crate::mapping::{FieldType, SinkGeneration, CANONICAL_FIELDS};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Grouping written to by this engine on sinks that require one.
pub const DEFAULT_GROUPING: &str = "_doc";

/// Grouping name used by earlier releases of this engine.
pub const LEGACY_GROUPING: &str = "object";

/// Field declarations currently held by the destination collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TargetSchema {
    /// Nothing declared yet.
    #[default]
    Empty,
    /// Fields declared directly under `properties`.
    Typeless(Map<String, Value>),
    /// Fields declared per named grouping.
    Grouped(BTreeMap<String, Map<String, Value>>),
}

impl TargetSchema {
    /// Parses the schema of one collection.
    ///
    /// `body` is the collection entry of a mapping response, i.e. an object
    /// with a `mappings` key. A missing or empty `mappings` is an empty schema.
    pub fn from_response(body: &Value) -> SyncResult<Self> {
        let mappings = match body.get("mappings") {
            None | Some(Value::Null) => return Ok(TargetSchema::Empty),
            Some(Value::Object(mappings)) => mappings,
            Some(other) => {
                return Err(SyncError::sink(format!(
                    "unexpected mappings in schema response: {other}"
                )))
            }
        };
        if mappings.is_empty() {
            return Ok(TargetSchema::Empty);
        }
        if let Some(properties) = mappings.get("properties") {
            return Ok(TargetSchema::Typeless(properties_of(properties)));
        }

        let groupings = mappings
            .iter()
            .map(|(name, grouping)| {
                let properties = grouping
                    .get("properties")
                    .map(properties_of)
                    .unwrap_or_default();
                (name.clone(), properties)
            })
            .collect();
        Ok(TargetSchema::Grouped(groupings))
    }

    /// Names of the groupings present, in sorted order.
    pub fn groupings(&self) -> Vec<String> {
        match self {
            TargetSchema::Grouped(groupings) => groupings.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Returns true if `field` is declared under any grouping.
    pub fn declares(&self, field: &str) -> bool {
        match self {
            TargetSchema::Empty => false,
            TargetSchema::Typeless(properties) => properties.contains_key(field),
            TargetSchema::Grouped(groupings) => groupings
                .values()
                .any(|properties| properties.contains_key(field)),
        }
    }

    /// Canonical fields with no declaration.
    pub fn missing_fields(&self) -> Vec<(&'static str, FieldType)> {
        CANONICAL_FIELDS
            .iter()
            .filter(|(name, _)| !self.declares(name))
            .copied()
            .collect()
    }
}

fn properties_of(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// A schema-extension request.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaPatch {
    /// Grouping to extend, or `None` for a typeless request.
    pub grouping: Option<String>,
    /// New field declarations.
    pub properties: Map<String, Value>,
}

impl SchemaPatch {
    /// Request body: `{"properties": {...}}`.
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("properties".into(), Value::Object(self.properties.clone()));
        Value::Object(body)
    }
}

/// Outcome of reconciling a destination schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaPlan {
    /// Grouping named on every bulk write, if the generation needs one.
    pub write_grouping: Option<String>,
    /// Extension to apply, if any canonical field is missing.
    pub patch: Option<SchemaPatch>,
}

/// Reconciles the current schema of `index` against the canonical mapping.
///
/// Fails with [`SyncError::SchemaAmbiguity`] when the destination holds
/// several groupings or a single grouping this engine did not create.
pub fn reconcile(
    index: &str,
    generation: SinkGeneration,
    schema: &TargetSchema,
) -> SyncResult<SchemaPlan> {
    let groupings = schema.groupings();
    let existing = match groupings.as_slice() {
        [] => None,
        [only] if only == DEFAULT_GROUPING || only == LEGACY_GROUPING => Some(only.clone()),
        _ => {
            return Err(SyncError::SchemaAmbiguity {
                index: index.to_string(),
                groupings,
            })
        }
    };

    let write_grouping = generation
        .uses_groupings()
        .then(|| existing.clone().unwrap_or_else(|| DEFAULT_GROUPING.to_string()));

    let missing = schema.missing_fields();
    let patch = if missing.is_empty() {
        None
    } else {
        let grouping = match (schema, &existing) {
            (_, Some(existing)) => Some(existing.clone()),
            (TargetSchema::Empty, None) if generation.uses_groupings() => {
                Some(DEFAULT_GROUPING.to_string())
            }
            _ => None,
        };
        Some(SchemaPatch {
            grouping,
            properties: generation.compat().declare_all(&missing),
        })
    };

    Ok(SchemaPlan {
        write_grouping,
        patch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::SchemaCompat;
    use serde_json::json;

    fn full_mapping(compat: SchemaCompat) -> Value {
        Value::Object(compat.declare_all(CANONICAL_FIELDS))
    }

    #[test]
    fn parse_schema_shapes() {
        assert_eq!(
            TargetSchema::from_response(&json!({"mappings": {}})).unwrap(),
            TargetSchema::Empty
        );
        assert_eq!(TargetSchema::from_response(&json!({})).unwrap(), TargetSchema::Empty);

        let typeless = TargetSchema::from_response(&json!({
            "mappings": {"properties": {"etag": {"type": "keyword"}}}
        }))
        .unwrap();
        assert!(typeless.declares("etag"));
        assert!(typeless.groupings().is_empty());

        let grouped = TargetSchema::from_response(&json!({
            "mappings": {"object": {}}
        }))
        .unwrap();
        assert_eq!(grouped.groupings(), vec!["object".to_string()]);
        assert_eq!(grouped.missing_fields().len(), CANONICAL_FIELDS.len());
    }

    #[test]
    fn empty_schema_gets_everything() {
        let plan = reconcile("idx", SinkGeneration::Typeless, &TargetSchema::Empty).unwrap();
        let patch = plan.patch.unwrap();
        assert_eq!(patch.grouping, None);
        assert_eq!(Value::Object(patch.properties), full_mapping(SchemaCompat::TextKeyword));
        assert_eq!(plan.write_grouping, None);

        let plan = reconcile("idx", SinkGeneration::Typed, &TargetSchema::Empty).unwrap();
        assert_eq!(plan.patch.unwrap().grouping.as_deref(), Some(DEFAULT_GROUPING));
        assert_eq!(plan.write_grouping.as_deref(), Some(DEFAULT_GROUPING));
    }

    #[test]
    fn only_missing_fields_are_added() {
        let schema = TargetSchema::from_response(&json!({
            "mappings": {"properties": {
                "content-length": {"type": "string"},
                "x-timestamp": {"type": "string"},
                "x-trans-id": {"type": "string"}
            }}
        }))
        .unwrap();

        let patch = reconcile("idx", SinkGeneration::Legacy, &schema)
            .unwrap()
            .patch
            .unwrap();
        assert_eq!(patch.grouping, None);
        assert_eq!(
            patch.body(),
            json!({"properties": {
                "content-type": {"type": "string"},
                "last-modified": {"type": "date"},
                "etag": {"type": "string", "index": "not_analyzed"},
                "x-object-manifest": {"type": "string"},
                "x-static-large-object": {"type": "boolean"},
                "x-swift-container": {"type": "string"},
                "x-swift-account": {"type": "string"},
                "x-swift-object": {"type": "string"},
            }})
        );
    }

    #[test]
    fn complete_schema_needs_no_patch() {
        let schema = TargetSchema::from_response(&json!({
            "mappings": {"properties": full_mapping(SchemaCompat::TextKeyword)}
        }))
        .unwrap();
        let plan = reconcile("idx", SinkGeneration::Typeless, &schema).unwrap();
        assert_eq!(plan.patch, None);
    }

    #[test]
    fn existing_grouping_is_extended() {
        let current: Map<String, Value> = CANONICAL_FIELDS
            .iter()
            .filter(|(_, ty)| !ty.is_string())
            .map(|(name, ty)| ((*name).to_string(), SchemaCompat::LegacyString.declare(*ty)))
            .collect();
        let schema = TargetSchema::from_response(&json!({
            "mappings": {LEGACY_GROUPING: {"properties": current}}
        }))
        .unwrap();

        let plan = reconcile("idx", SinkGeneration::Typed, &schema).unwrap();
        assert_eq!(plan.write_grouping.as_deref(), Some(LEGACY_GROUPING));
        let patch = plan.patch.unwrap();
        assert_eq!(patch.grouping.as_deref(), Some(LEGACY_GROUPING));

        let text_and_keyword = json!({"type": "text", "fields": {"keyword": {"type": "keyword"}}});
        assert_eq!(
            Value::Object(patch.properties),
            json!({
                "content-type": text_and_keyword,
                "etag": {"type": "keyword"},
                "x-object-manifest": text_and_keyword,
                "x-swift-container": text_and_keyword,
                "x-swift-account": text_and_keyword,
                "x-swift-object": text_and_keyword,
                "x-trans-id": {"type": "keyword"},
            })
        );
    }

    #[test]
    fn field_in_any_grouping_counts_as_present() {
        let mut groupings = BTreeMap::new();
        groupings.insert(
            DEFAULT_GROUPING.to_string(),
            SchemaCompat::TextKeyword.declare_all(CANONICAL_FIELDS),
        );
        let schema = TargetSchema::Grouped(groupings);
        assert!(schema.missing_fields().is_empty());
    }

    #[test]
    fn foreign_grouping_is_ambiguous() {
        let schema = TargetSchema::from_response(&json!({
            "mappings": {"bogus_type": {"properties": full_mapping(SchemaCompat::TextKeyword)}}
        }))
        .unwrap();
        let err = reconcile("test_index", SinkGeneration::Typed, &schema).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot set more than one mapping type for index test_index. Known types: [\"bogus_type\"]"
        );
    }

    #[test]
    fn two_groupings_are_ambiguous() {
        let schema = TargetSchema::from_response(&json!({
            "mappings": {
                "_doc": {"properties": {"etag": {"type": "keyword"}}},
                "object": {"properties": {"content-type": {"type": "text"}}}
            }
        }))
        .unwrap();
        match reconcile("idx", SinkGeneration::Typed, &schema) {
            Err(SyncError::SchemaAmbiguity { index, groupings }) => {
                assert_eq!(index, "idx");
                assert_eq!(groupings, vec!["_doc".to_string(), "object".to_string()]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }
}
