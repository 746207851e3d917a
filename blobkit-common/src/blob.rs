//! Blob identifiers, metadata and read-range rules.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque identifier of a blob, relative to the backend prefix.
///
/// Identifiers are passed through as-is; forward slashes are ordinary
/// characters and are never reinterpreted by the caller-facing API.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Reject identifiers no backend can store.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidRequest("blob id must not be empty".into()));
        }
        Ok(())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for BlobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for BlobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Metadata about a stored blob, as reported by listing or `get_metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub id: BlobId,
    /// Size in bytes
    pub length: u64,
    /// Time the current version was written
    pub timestamp: DateTime<Utc>,
}

/// Resolve a `(offset, length)` read request against a blob of `size` bytes.
///
/// `length == None` means "from `offset` to the end"; `Some(0)` is an
/// explicit empty read. The range must lie within `[0, size]`, so reading
/// at `offset == size` is allowed and yields nothing, while any byte past
/// the end is an [`Error::InvalidRange`].
pub fn resolve_range(id: &BlobId, offset: u64, length: Option<u64>, size: u64) -> Result<Range<u64>> {
    let invalid = || Error::InvalidRange {
        id: id.clone(),
        offset,
        length,
        size,
    };

    if offset > size {
        return Err(invalid());
    }
    let end = match length {
        None => size,
        Some(len) => offset.checked_add(len).ok_or_else(invalid)?,
    };
    if end > size {
        return Err(invalid());
    }
    Ok(offset..end)
}

/// Join the backend prefix and a caller-relative id into a storage key.
pub fn prefixed_key(prefix: &str, id: &BlobId) -> String {
    format!("{}{}", prefix, id.as_str())
}

/// Strip the backend prefix off a storage key. Returns `None` for keys
/// outside the prefix.
pub fn strip_key_prefix(prefix: &str, key: &str) -> Option<BlobId> {
    key.strip_prefix(prefix).map(BlobId::from)
}
