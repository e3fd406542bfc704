//! Inspect command implementation.

use super::OutputFormat;
use metasync_engine::{load_record, record_path, CheckpointRecord};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Checkpoint inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Checkpoint file path.
    pub path: String,
    /// Whether the file exists.
    pub exists: bool,
    /// Cursors per partition.
    pub partitions: Vec<PartitionCursor>,
}

/// Cursors of a single partition.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PartitionCursor {
    /// Partition id.
    pub partition: String,
    /// Index or topic the cursors belong to.
    pub destination: String,
    /// Last processed row.
    pub last_row: u64,
    /// Last verified row.
    pub last_verified_row: u64,
}

/// Reads the checkpoint record of `account` (and `container`).
///
/// Without a container the per-account record is read.
pub fn inspect(
    status_dir: &Path,
    account: &str,
    container: Option<&str>,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let path = record_path(status_dir, account, container, container.is_none());
    debug!(path = %path.display(), "reading checkpoint record");

    let exists = path.exists();
    let record: CheckpointRecord = if exists {
        load_record(&path)?
    } else {
        CheckpointRecord::new()
    };

    let partitions = record
        .into_iter()
        .map(|(partition, entry)| PartitionCursor {
            partition,
            last_row: entry.last_processed,
            last_verified_row: entry.verified(),
            destination: entry.destination,
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        exists,
        partitions,
    })
}

/// Runs the inspect command.
pub fn run(
    status_dir: &Path,
    account: &str,
    container: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format: OutputFormat = format.parse()?;
    let result = inspect(status_dir, account, container)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Checkpoint: {}", result.path);
    if !result.exists {
        println!("  (no record yet)");
        return;
    }
    if result.partitions.is_empty() {
        println!("  (empty)");
    }
    for cursor in &result.partitions {
        println!(
            "  {:<24} {:<24} processed={:<10} verified={}",
            cursor.partition, cursor.destination, cursor.last_row, cursor.last_verified_row
        );
    }
}
