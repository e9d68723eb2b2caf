//! Types shared by range reads and writes.

use crate::error::{CacheError, Result};
use crate::query::{find_call, Call, CallValue};
use crate::types::DataId;
use serde::{Deserialize, Serialize};

/// An edge stored in a range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeEdge {
    pub edge_id: DataId,
    pub cursor: String,
}

impl RangeEdge {
    pub fn new(edge_id: impl Into<DataId>, cursor: impl Into<String>) -> Self {
        Self {
            edge_id: edge_id.into(),
            cursor: cursor.into(),
        }
    }
}

/// Connection page info, as reported by the server or computed for a read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

/// What the range can answer for a set of calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeInfo {
    /// Edges available locally, in connection order.
    pub requested_edge_ids: Vec<DataId>,
    /// Range calls still needed from the server (empty when covered).
    pub diff_calls: Vec<Call>,
    pub page_info: PageInfo,
}

impl RangeInfo {
    pub fn is_covered(&self) -> bool {
        self.diff_calls.is_empty()
    }
}

/// Membership change caused by a write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RangeUpdate {
    pub added: Vec<DataId>,
    pub removed: Vec<DataId>,
}

impl RangeUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Parsed range arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RangeCalls {
    First { count: usize, after: Option<String> },
    Last { count: usize, before: Option<String> },
}

impl RangeCalls {
    pub fn parse(calls: &[Call]) -> Result<Self> {
        let cursor = |name: &str| -> Result<Option<String>> {
            match find_call(calls, name) {
                None => Ok(None),
                Some(call) => match &call.value {
                    CallValue::Literal(serde_json::Value::String(s)) => Ok(Some(s.clone())),
                    CallValue::Literal(other) => Err(CacheError::MalformedQuery(format!(
                        "cursor `{}` must be a string, got {}",
                        name, other
                    ))),
                    CallValue::EdgeOffset { .. } => Err(CacheError::MalformedQuery(format!(
                        "cursor `{}` is an unresolved edge offset",
                        name
                    ))),
                },
            }
        };
        let count = |call: &Call| -> Result<usize> {
            call.as_u64().map(|n| usize::try_from(n).unwrap_or(usize::MAX)).ok_or_else(|| {
                CacheError::MalformedQuery(format!("`{}` must be a non-negative integer", call.name))
            })
        };

        match (find_call(calls, "first"), find_call(calls, "last")) {
            (Some(first), None) => Ok(RangeCalls::First {
                count: count(first)?,
                after: cursor("after")?,
            }),
            (None, Some(last)) => Ok(RangeCalls::Last {
                count: count(last)?,
                before: cursor("before")?,
            }),
            _ => Err(CacheError::MalformedQuery(
                "range requires exactly one of `first` or `last`".to_string(),
            )),
        }
    }
}

/// Where an edge offset lands in the stored range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OffsetCursor {
    /// The cursor of the edge at the offset.
    At(String),
    /// Fewer edges are stored than the offset but more exist on the server.
    Beyond { cursor: String, shortfall: u64 },
    /// The connection ends before the offset.
    Exhausted,
    /// Nothing is known from that end.
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_after() {
        let calls = vec![Call::new("first", 10), Call::new("after", "c3")];
        assert_eq!(
            RangeCalls::parse(&calls).unwrap(),
            RangeCalls::First {
                count: 10,
                after: Some("c3".to_string())
            }
        );
    }

    #[test]
    fn test_parse_rejects_edge_offset() {
        let calls = vec![Call::new("first", 10), Call::edge_offset("after", 10, false)];
        assert!(matches!(
            RangeCalls::parse(&calls),
            Err(CacheError::MalformedQuery(_))
        ));
    }

    #[test]
    fn test_parse_requires_one_bound() {
        assert!(RangeCalls::parse(&[]).is_err());
        assert!(RangeCalls::parse(&[Call::new("first", 1), Call::new("last", 1)]).is_err());
    }
}
