//! File-backed progress cursors per source partition.
//!
//! Layout under the status directory:
//!
//! ```text
//! <status_dir>/
//! ├─ <account>/
//! │  ├─ <container>.json        # one record per container
//! │  └─ <container>.json.lock   # advisory lock for read-modify-write
//! └─ <account>.json             # per-account mode
//! ```
//!
//! A record maps partition ids to their cursors and the destination they were
//! computed against. Cursors recorded for another destination read as zero.

use crate::error::SyncResult;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "json";

/// Cursors of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Index or topic the cursors are valid for.
    #[serde(alias = "index", alias = "topic")]
    pub destination: String,
    /// Last row handed to the sink.
    #[serde(rename = "last_row", default)]
    pub last_processed: u64,
    /// Last row confirmed by verification.
    #[serde(
        rename = "last_verified_row",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_verified: Option<u64>,
}

impl CheckpointEntry {
    fn fresh(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            last_processed: 0,
            last_verified: Some(0),
        }
    }

    /// Verified cursor, defaulting to the processed one.
    pub fn verified(&self) -> u64 {
        self.last_verified.unwrap_or(self.last_processed)
    }
}

/// Whole contents of one checkpoint file.
pub type CheckpointRecord = BTreeMap<String, CheckpointEntry>;

type RawRecord = Map<String, Value>;

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Processed,
    Verified,
}

/// Durable cursor storage for one account or container.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    status_dir: PathBuf,
    account: String,
    container: String,
    per_account: bool,
    destination: String,
}

impl CheckpointStore {
    /// Creates a store for `account/container` whose cursors are valid for
    /// `destination`.
    pub fn new(
        status_dir: impl Into<PathBuf>,
        account: impl Into<String>,
        container: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            status_dir: status_dir.into(),
            account: account.into(),
            container: container.into(),
            per_account: false,
            destination: destination.into(),
        }
    }

    /// Keeps one record per account instead of one per container.
    #[must_use]
    pub fn with_per_account(mut self, per_account: bool) -> Self {
        self.per_account = per_account;
        self
    }

    /// Destination the cursors are valid for.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Path of the record file.
    pub fn path(&self) -> PathBuf {
        record_path(&self.status_dir, &self.account, Some(&self.container), self.per_account)
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path().into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.path().into_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }

    /// Last processed row of `partition`, or 0.
    pub fn last_processed(&self, partition: &str) -> SyncResult<u64> {
        self.read_cursor(partition, Cursor::Processed)
    }

    /// Last verified row of `partition`, or 0.
    ///
    /// Falls back to the processed row when no verified row was recorded.
    pub fn last_verified(&self, partition: &str) -> SyncResult<u64> {
        self.read_cursor(partition, Cursor::Verified)
    }

    /// Records the last processed row of `partition`.
    pub fn save_last_processed(&self, partition: &str, row: u64) -> SyncResult<()> {
        self.save_cursor(partition, row, Cursor::Processed)
    }

    /// Records the last verified row of `partition`.
    pub fn save_last_verified(&self, partition: &str, row: u64) -> SyncResult<()> {
        self.save_cursor(partition, row, Cursor::Verified)
    }

    /// Loads the whole record.
    pub fn inspect(&self) -> SyncResult<CheckpointRecord> {
        load_record(&self.path())
    }

    fn read_cursor(&self, partition: &str, cursor: Cursor) -> SyncResult<u64> {
        let raw = load_raw_record(&self.path())?;
        let value = match raw.get(partition).and_then(|value| decode_entry(partition, value)) {
            Some(entry) if entry.destination == self.destination => match cursor {
                Cursor::Processed => entry.last_processed,
                Cursor::Verified => entry.verified(),
            },
            _ => 0,
        };
        Ok(value)
    }

    fn save_cursor(&self, partition: &str, row: u64, cursor: Cursor) -> SyncResult<()> {
        let path = self.path();
        let dir = path.parent().unwrap_or(self.status_dir.as_path()).to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        lock.lock_exclusive()?;

        let mut raw = load_raw_record(&path)?;
        let existing = raw.get(partition).and_then(|value| decode_entry(partition, value));
        let mut entry = match existing {
            Some(old) if old.destination == self.destination => CheckpointEntry {
                last_verified: Some(old.verified()),
                ..old
            },
            Some(old) => {
                info!(
                    partition,
                    old = %old.destination,
                    new = %self.destination,
                    "destination changed, resetting checkpoint"
                );
                CheckpointEntry::fresh(&self.destination)
            }
            None => {
                info!(partition, destination = %self.destination, "creating checkpoint");
                CheckpointEntry::fresh(&self.destination)
            }
        };
        match cursor {
            Cursor::Processed => entry.last_processed = row,
            Cursor::Verified => entry.last_verified = Some(row),
        }
        raw.insert(partition.to_string(), serde_json::to_value(&entry)?);

        self.write_record(&raw, &path, &dir)?;
        debug!(partition, row, ?cursor, "saved checkpoint");

        fs2::FileExt::unlock(&lock)?;
        Ok(())
    }

    fn write_record(&self, record: &RawRecord, path: &Path, dir: &Path) -> SyncResult<()> {
        let temp_path = self.temp_path();
        let data = serde_json::to_vec(record)?;

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        sync_directory(dir)
    }
}

/// Path of the record file for an account, or one of its containers.
pub fn record_path(status_dir: &Path, account: &str, container: Option<&str>, per_account: bool) -> PathBuf {
    match container {
        Some(container) if !per_account => status_dir
            .join(account)
            .join(format!("{container}.{RECORD_EXTENSION}")),
        _ => status_dir.join(format!("{account}.{RECORD_EXTENSION}")),
    }
}

/// Reads a record file.
///
/// A missing, empty or malformed file reads as an empty record. Entries that
/// cannot be decoded are left out.
pub fn load_record(path: &Path) -> SyncResult<CheckpointRecord> {
    let raw = load_raw_record(path)?;
    Ok(raw
        .iter()
        .filter_map(|(partition, value)| {
            decode_entry(partition, value).map(|entry| (partition.clone(), entry))
        })
        .collect())
}

/// Record as stored, with every entry kept undecoded.
///
/// Saves only replace the saved partition, so entries this store cannot
/// decode are written back untouched.
fn load_raw_record(path: &Path) -> SyncResult<RawRecord> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RawRecord::new()),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(RawRecord::new());
    }
    match serde_json::from_slice::<Value>(&data) {
        Ok(Value::Object(raw)) => Ok(raw),
        Ok(_) => {
            warn!(path = %path.display(), "ignoring checkpoint record that is not an object");
            Ok(RawRecord::new())
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed checkpoint record");
            Ok(RawRecord::new())
        }
    }
}

fn decode_entry(partition: &str, value: &Value) -> Option<CheckpointEntry> {
    match CheckpointEntry::deserialize(value) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(partition, error = %e, "ignoring malformed checkpoint entry");
            None
        }
    }
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> SyncResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> SyncResult<()> {
    Ok(())
}
