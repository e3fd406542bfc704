//! Validate-config command implementation.

use super::OutputFormat;
use metasync_engine::{record_path, DestinationConfig, FactoryConfig, SyncSettings};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Resolved settings of one sync mapping.
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    /// Source account.
    pub account: String,
    /// Source container.
    pub container: String,
    /// Whether user metadata values are decoded as JSON.
    pub parse_json: bool,
    /// Dedup record lifetime in seconds.
    pub cache_ttl: u64,
    /// Resolved destination.
    pub destination: DestinationConfig,
    /// Checkpoint file the engine would use.
    pub checkpoint: String,
}

/// Parses and resolves the settings in `settings_path`.
pub fn validate(
    settings_path: &Path,
    status_dir: Option<&Path>,
    per_account: bool,
) -> Result<ValidationReport, Box<dyn std::error::Error>> {
    let factory = FactoryConfig {
        status_dir: status_dir.map(Path::to_path_buf),
    };
    let status_dir = factory.require_status_dir()?;

    debug!(path = %settings_path.display(), "reading settings");
    let text = fs::read_to_string(settings_path)?;
    let settings = SyncSettings::from_json(&text)?;
    let (engine, destination) = settings.resolve(per_account)?;
    info!(
        account = %engine.account,
        container = %engine.container,
        destination = %destination.destination_id(),
        "settings are valid"
    );

    let checkpoint = record_path(status_dir, &engine.account, Some(engine.container.as_str()), per_account);
    Ok(ValidationReport {
        account: engine.account,
        container: engine.container,
        parse_json: engine.parse_json,
        cache_ttl: engine.cache_ttl,
        destination,
        checkpoint: checkpoint.display().to_string(),
    })
}

/// Runs the validate-config command.
pub fn run(
    settings_path: &Path,
    status_dir: Option<&Path>,
    per_account: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format: OutputFormat = format.parse()?;
    let report = validate(settings_path, status_dir, per_account)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Source:      {}/{}", report.account, report.container);
            match &report.destination {
                DestinationConfig::SearchIndex(search) => {
                    println!("Destination: index {} on {}", search.index, search.hosts.join(", "));
                    if let Some(pipeline) = &search.pipeline {
                        println!("Pipeline:    {pipeline}");
                    }
                }
                DestinationConfig::MessageTopic(topic) => {
                    println!("Destination: topic {} on {}", topic.topic, topic.servers.join(", "));
                    println!("Cluster id:  {}", topic.cluster_id);
                    println!("Dedup cache: {}", topic.cache_servers.join(", "));
                }
            }
            println!("Parse JSON:  {}", report.parse_json);
            println!("Cache TTL:   {}s", report.cache_ttl);
            println!("Checkpoint:  {}", report.checkpoint);
        }
    }
    Ok(())
}
