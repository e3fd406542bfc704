//! Mapping command implementation.

use metasync_engine::{reconcile, SinkGeneration, SyncResult, TargetSchema};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Canonical mapping as a fresh index of this generation receives it.
#[derive(Debug, Serialize)]
pub struct MappingReport {
    /// Version the report was built for.
    pub version: String,
    /// Detected sink generation.
    pub generation: String,
    /// Grouping named on writes and schema updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouping: Option<String>,
    /// Field declarations.
    pub properties: Map<String, Value>,
}

/// Builds the mapping report for a cluster `version`.
pub fn mapping(version: &str) -> SyncResult<MappingReport> {
    let generation = SinkGeneration::from_version(version);
    debug!(version, %generation, "translating canonical mapping");

    let plan = reconcile("<new index>", generation, &TargetSchema::Empty)?;
    let properties = plan.patch.map(|patch| patch.properties).unwrap_or_default();

    Ok(MappingReport {
        version: version.to_string(),
        generation: generation.to_string(),
        grouping: plan.write_grouping,
        properties,
    })
}

/// Runs the mapping command.
pub fn run(version: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = mapping(version)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metasync_engine::{CANONICAL_FIELDS, DEFAULT_GROUPING};
    use serde_json::json;

    #[test]
    fn legacy_uses_string_fields() {
        let report = mapping("2.4.6").unwrap();
        assert_eq!(report.generation, "legacy");
        assert_eq!(report.grouping.as_deref(), Some(DEFAULT_GROUPING));
        assert_eq!(report.properties.len(), CANONICAL_FIELDS.len());
        assert_eq!(report.properties["content-type"]["type"], json!("string"));
    }

    #[test]
    fn typeless_has_no_grouping() {
        let report = mapping("7.10.2").unwrap();
        assert_eq!(report.generation, "typeless");
        assert!(report.grouping.is_none());
        assert_eq!(report.properties["content-length"], json!({"type": "long"}));

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("grouping").is_none());
    }

    #[test]
    fn typed_generation() {
        let report = mapping("6.8.0").unwrap();
        assert_eq!(report.generation, "typed");
        assert_eq!(report.grouping.as_deref(), Some(DEFAULT_GROUPING));
    }
}
