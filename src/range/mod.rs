//! Connection ranges.
//!
//! A connection field stores its edges in a [`Range`] keyed by the
//! connection record. Reads ask the range which edges it can serve for a
//! set of `first`/`after`/`last`/`before` calls and which calls still have
//! to go to the server; writes splice fetched pages in.

mod tracker;
mod types;

pub use tracker::Range;
pub use types::{OffsetCursor, PageInfo, RangeCalls, RangeEdge, RangeInfo, RangeUpdate};
