//! Storage-side inputs: change rows and object metadata.

use crate::error::{SyncError, SyncResult};
use crate::version::VersionToken;
use std::collections::BTreeMap;

/// Prefix of user-defined object metadata headers.
pub const USER_META_PREFIX: &str = "x-object-meta-";

/// Header asking the storage backend for the most recent replica.
pub const NEWEST_HEADER: (&str, &str) = ("X-Newest", "true");

/// One observed mutation of an object, as discovered by the crawler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    /// Object key as stored; may hold any UTF-8 text.
    pub name: Vec<u8>,
    /// Whether the row records a deletion.
    pub deleted: bool,
    /// Encoded version token.
    pub created_at: String,
}

impl ChangeRow {
    /// Creates a row for a created or updated object.
    pub fn update(name: impl Into<Vec<u8>>, created_at: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deleted: false,
            created_at: created_at.into(),
        }
    }

    /// Creates a row for a deleted object.
    pub fn delete(name: impl Into<Vec<u8>>, created_at: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deleted: true,
            created_at: created_at.into(),
        }
    }

    /// Decodes the object name as text.
    pub fn object_name(&self) -> SyncResult<&str> {
        std::str::from_utf8(&self.name)
            .map_err(|e| SyncError::invalid_metadata("name", format!("object name is not UTF-8: {e}")))
    }

    /// Decodes the version token.
    pub fn version(&self) -> SyncResult<VersionToken> {
        self.created_at.parse()
    }
}

/// Object metadata as returned by the storage backend.
///
/// Header names are stored lowercased. Names and values are kept as raw
/// bytes; decoding to text happens when a document is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    headers: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ObjectMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header, builder style.
    #[must_use]
    pub fn with(mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts or replaces a header.
    pub fn insert(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.as_ref().to_vec());
    }

    /// Looks up a header by name.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .get(name.to_ascii_lowercase().as_bytes())
            .map(Vec::as_slice)
    }

    /// Looks up a header and decodes it as text.
    pub fn get_str(&self, name: &str) -> SyncResult<Option<&str>> {
        self.get(name)
            .map(|value| decode_text(name, value))
            .transpose()
    }

    /// Iterates user metadata as `(name without prefix, value)` pairs.
    pub fn user_metadata(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers.iter().filter_map(|(name, value)| {
            name.strip_prefix(USER_META_PREFIX.as_bytes())
                .map(|stripped| (stripped, value.as_slice()))
        })
    }

    /// Returns the number of headers.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Returns true if no headers are present.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl<K: AsRef<[u8]>, V: AsRef<[u8]>> FromIterator<(K, V)> for ObjectMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut meta = Self::new();
        for (name, value) in iter {
            meta.insert(name, value);
        }
        meta
    }
}

/// Decodes a header name or value as UTF-8 text without loss.
pub(crate) fn decode_text<'a>(field: &str, bytes: &'a [u8]) -> SyncResult<&'a str> {
    std::str::from_utf8(bytes)
        .map_err(|e| SyncError::invalid_metadata(field, format!("not valid UTF-8: {e}")))
}

/// Fetches current object metadata from the storage backend.
///
/// Implementations are expected to honour [`NEWEST_HEADER`] by reading the
/// most recent replica.
pub trait MetadataFetcher {
    /// Returns the metadata of `account/container/object`.
    fn fetch_metadata(
        &self,
        account: &str,
        container: &str,
        object: &str,
        headers: &[(&str, &str)],
    ) -> Result<ObjectMetadata, String>;
}

impl<F> MetadataFetcher for F
where
    F: Fn(&str, &str, &str, &[(&str, &str)]) -> Result<ObjectMetadata, String>,
{
    fn fetch_metadata(
        &self,
        account: &str,
        container: &str,
        object: &str,
        headers: &[(&str, &str)],
    ) -> Result<ObjectMetadata, String> {
        self(account, container, object, headers)
    }
}
