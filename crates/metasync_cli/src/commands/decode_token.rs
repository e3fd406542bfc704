//! Decode-token command implementation.

use super::OutputFormat;
use metasync_engine::{Timestamp, VersionToken};
use serde::Serialize;

/// Decoded components of a version token.
#[derive(Debug, Serialize)]
pub struct TokenReport {
    /// Token as given.
    pub token: String,
    /// Creation time.
    pub data_time: TimeReport,
    /// Content modification time.
    pub content_time: TimeReport,
    /// Metadata modification time.
    pub meta_time: TimeReport,
    /// Operation a row with this token maps to.
    pub operation: String,
}

/// One decoded time.
#[derive(Debug, Serialize)]
pub struct TimeReport {
    /// Normalized textual form.
    pub normal: String,
    /// Milliseconds since the epoch.
    pub millis: i64,
}

impl From<Timestamp> for TimeReport {
    fn from(ts: Timestamp) -> Self {
        Self {
            normal: ts.to_string(),
            millis: ts.as_millis(),
        }
    }
}

/// Decodes `token` for a row that is (or is not) a delete.
pub fn decode(token: &str, deleted: bool) -> Result<TokenReport, Box<dyn std::error::Error>> {
    let version: VersionToken = token.parse()?;
    Ok(TokenReport {
        token: token.trim().to_string(),
        data_time: version.data_time().into(),
        content_time: version.content_time().into(),
        meta_time: version.meta_time().into(),
        operation: version.operation(deleted).to_string(),
    })
}

/// Runs the decode-token command.
pub fn run(token: &str, deleted: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let format: OutputFormat = format.parse()?;
    let report = decode(token, deleted)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Token:     {}", report.token);
            println!("Data:      {} ({} ms)", report.data_time.normal, report.data_time.millis);
            println!(
                "Content:   {} ({} ms)",
                report.content_time.normal, report.content_time.millis
            );
            println!("Metadata:  {} ({} ms)", report.meta_time.normal, report.meta_time.millis);
            println!("Operation: {}", report.operation);
        }
    }
    Ok(())
}
