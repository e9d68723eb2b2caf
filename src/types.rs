//! Core types for the query cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix for identifiers the cache generates itself.
pub const CLIENT_ID_PREFIX: &str = "client:";

/// Opaque stable identifier for a normalized record.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataId(pub String);

impl DataId {
    pub fn new(id: impl Into<String>) -> Self {
        DataId(id.into())
    }

    /// Identifier for an object nested under `parent` that has no id of its own.
    pub fn client(parent: &DataId, storage_key: &str) -> Self {
        DataId(format!("{}{}:{}", CLIENT_ID_PREFIX, parent.0, storage_key))
    }

    /// Identifier for the edge linking `connection` to `node`.
    ///
    /// The brackets keep it apart from [`DataId::client`] ids, whose last
    /// segment is a storage key and never contains `[`.
    pub fn edge(connection: &DataId, node: &DataId) -> Self {
        DataId(format!("{}{}:edge[{}]", CLIENT_ID_PREFIX, connection.0, node.0))
    }

    pub fn is_client_generated(&self) -> bool {
        self.0.starts_with(CLIENT_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataId({})", self.0)
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataId {
    fn from(s: &str) -> Self {
        DataId(s.to_string())
    }
}

impl From<String> for DataId {
    fn from(s: String) -> Self {
        DataId(s)
    }
}

/// Whether the cache knows anything about a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// The record is cached.
    Existent,
    /// The server confirmed the record does not exist.
    Nonexistent,
    /// Never fetched, or evicted.
    Unknown,
}

/// A single stored field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Scalar(serde_json::Value),
    /// Server-confirmed null.
    Null,
    Link(DataId),
    Links(Vec<DataId>),
}

/// Result of reading a field: undefined, null, or a value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldRead<T> {
    /// Not fetched (or the record itself is unknown).
    Unknown,
    /// Known to be null.
    Null,
    Value(T),
}

impl<T> FieldRead<T> {
    pub fn is_unknown(&self) -> bool {
        matches!(self, FieldRead::Unknown)
    }

    pub fn value(self) -> Option<T> {
        match self {
            FieldRead::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// A normalized record: scalar fields plus references by [`DataId`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub typename: Option<String>,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Identifier of an in-flight fetch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FetchId(pub u64);

impl fmt::Debug for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FetchId({})", self.0)
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Cache statistics.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub records: usize,
    pub ranges: usize,
    pub pending_fetches: usize,
    pub subscriptions: usize,
    pub tracked_references: usize,
}
