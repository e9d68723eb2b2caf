//! Ordered edge segments for one connection.

use super::types::{OffsetCursor, PageInfo, RangeCalls, RangeEdge, RangeInfo, RangeUpdate};
use crate::error::Result;
use crate::query::Call;
use crate::types::DataId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Known edges of a connection.
///
/// Pages fetched with `first` grow the `head` segment from the start of the
/// connection; pages fetched with `last` grow the `tail` segment back from
/// the end. Once the head reaches the end (or the tail reaches the start,
/// or the two segments overlap) the whole list lives in `head` and the
/// range is complete.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    head: Vec<RangeEdge>,
    tail: Vec<RangeEdge>,
    head_loaded: bool,
    tail_loaded: bool,
    head_has_next: bool,
    tail_has_previous: bool,
}

fn position(edges: &[RangeEdge], cursor: &str) -> Option<usize> {
    edges.iter().position(|e| e.cursor == cursor)
}

fn continuation(size: &str, cursor: &str, remaining: usize, edge: Option<&RangeEdge>) -> Vec<Call> {
    let mut calls = vec![Call::new(size, remaining as u64)];
    if let Some(edge) = edge {
        calls.push(Call::new(cursor, edge.cursor.clone()));
    }
    calls
}

fn slice_info(edges: &[RangeEdge], has_previous: bool, has_next: bool, diff_calls: Vec<Call>) -> RangeInfo {
    RangeInfo {
        requested_edge_ids: edges.iter().map(|e| e.edge_id.clone()).collect(),
        diff_calls,
        page_info: PageInfo {
            has_next_page: has_next,
            has_previous_page: has_previous,
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
        },
    }
}

fn uncovered(calls: &[Call]) -> RangeInfo {
    RangeInfo {
        requested_edge_ids: Vec::new(),
        diff_calls: calls.iter().filter(|c| c.is_range_call()).cloned().collect(),
        page_info: PageInfo::default(),
    }
}

fn dedupe(edges: &mut Vec<RangeEdge>) {
    let mut seen = HashSet::new();
    edges.retain(|e| seen.insert(e.edge_id.clone()));
}

impl Range {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once every edge of the connection is known.
    pub fn is_complete(&self) -> bool {
        self.head_loaded && !self.head_has_next
    }

    /// All stored edge ids, head first.
    pub fn edge_ids(&self) -> Vec<DataId> {
        self.head
            .iter()
            .chain(self.tail.iter())
            .map(|e| e.edge_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.tail.is_empty()
    }

    /// Answer `calls` from stored edges.
    pub fn retrieve(&self, calls: &[Call]) -> Result<RangeInfo> {
        let info = match RangeCalls::parse(calls)? {
            RangeCalls::First { count, after } => self.retrieve_first(count, after.as_deref(), calls),
            RangeCalls::Last { count, before } => self.retrieve_last(count, before.as_deref(), calls),
        };
        Ok(info)
    }

    fn retrieve_first(&self, count: usize, after: Option<&str>, calls: &[Call]) -> RangeInfo {
        let head = &self.head;
        if self.is_complete() {
            let start = match after {
                None => 0,
                Some(cursor) => match position(head, cursor) {
                    Some(p) => p + 1,
                    None => return uncovered(calls),
                },
            };
            let end = start.saturating_add(count).min(head.len());
            return slice_info(&head[start..end], start > 0, end < head.len(), Vec::new());
        }

        match after {
            None => {
                if !self.head_loaded {
                    return uncovered(calls);
                }
                if count <= head.len() {
                    slice_info(&head[..count], false, true, Vec::new())
                } else {
                    let diff = continuation("first", "after", count - head.len(), head.last());
                    slice_info(head, false, true, diff)
                }
            }
            Some(cursor) => {
                if let Some(p) = position(head, cursor) {
                    let rest = &head[p + 1..];
                    if count <= rest.len() {
                        slice_info(&rest[..count], true, true, Vec::new())
                    } else {
                        let diff = continuation("first", "after", count - rest.len(), head.last());
                        slice_info(rest, true, true, diff)
                    }
                } else if let Some(p) = position(&self.tail, cursor) {
                    let rest = &self.tail[p + 1..];
                    let n = count.min(rest.len());
                    slice_info(&rest[..n], true, n < rest.len(), Vec::new())
                } else {
                    uncovered(calls)
                }
            }
        }
    }

    fn retrieve_last(&self, count: usize, before: Option<&str>, calls: &[Call]) -> RangeInfo {
        if self.is_complete() {
            let list = &self.head;
            let end = match before {
                None => list.len(),
                Some(cursor) => match position(list, cursor) {
                    Some(p) => p,
                    None => return uncovered(calls),
                },
            };
            let start = end.saturating_sub(count);
            return slice_info(&list[start..end], start > 0, end < list.len(), Vec::new());
        }

        let tail = &self.tail;
        match before {
            None => {
                if !self.tail_loaded {
                    return uncovered(calls);
                }
                if count <= tail.len() {
                    slice_info(&tail[tail.len() - count..], true, false, Vec::new())
                } else {
                    let diff = continuation("last", "before", count - tail.len(), tail.first());
                    slice_info(tail, true, false, diff)
                }
            }
            Some(cursor) => {
                if let Some(p) = position(tail, cursor) {
                    let rest = &tail[..p];
                    if count <= rest.len() {
                        slice_info(&rest[rest.len() - count..], true, true, Vec::new())
                    } else {
                        let diff = continuation("last", "before", count - rest.len(), tail.first());
                        slice_info(rest, true, true, diff)
                    }
                } else if let Some(p) = position(&self.head, cursor) {
                    let rest = &self.head[..p];
                    let n = count.min(rest.len());
                    slice_info(&rest[rest.len() - n..], rest.len() > n, true, Vec::new())
                } else {
                    uncovered(calls)
                }
            }
        }
    }

    /// Splice a fetched page into the range.
    pub fn add_items(&mut self, calls: &[Call], edges: Vec<RangeEdge>, page_info: &PageInfo) -> Result<RangeUpdate> {
        let parsed = RangeCalls::parse(calls)?;
        let before = self.edge_ids();

        match parsed {
            RangeCalls::First { after: None, .. } => self.add_first_page(edges, page_info),
            RangeCalls::First { after: Some(cursor), .. } => self.add_after(&cursor, edges, page_info),
            RangeCalls::Last { before: None, .. } => self.add_last_page(edges, page_info),
            RangeCalls::Last { before: Some(cursor), .. } => self.add_before(&cursor, edges, page_info),
        }
        self.normalize();

        let after = self.edge_ids();
        let before_set: HashSet<&DataId> = before.iter().collect();
        let after_set: HashSet<&DataId> = after.iter().collect();
        Ok(RangeUpdate {
            added: after.iter().filter(|id| !before_set.contains(id)).cloned().collect(),
            removed: before.iter().filter(|id| !after_set.contains(id)).cloned().collect(),
        })
    }

    fn add_first_page(&mut self, edges: Vec<RangeEdge>, page_info: &PageInfo) {
        let old = std::mem::take(&mut self.head);
        let rest = edges
            .last()
            .and_then(|e| position(&old, &e.cursor))
            .map(|q| old[q + 1..].to_vec())
            .unwrap_or_default();

        self.head = edges;
        if rest.is_empty() {
            self.head_has_next = page_info.has_next_page;
        } else {
            self.head.extend(rest);
        }
        self.head_loaded = true;
    }

    fn add_after(&mut self, cursor: &str, edges: Vec<RangeEdge>, page_info: &PageInfo) {
        if let Some(p) = position(&self.head, cursor) {
            let old_rest = self.head.split_off(p + 1);
            let rest = edges
                .last()
                .and_then(|e| position(&old_rest, &e.cursor))
                .map(|q| old_rest[q + 1..].to_vec())
                .unwrap_or_default();
            self.head.extend(edges);
            if rest.is_empty() {
                self.head_has_next = page_info.has_next_page;
            } else {
                self.head.extend(rest);
            }
        } else if let Some(p) = position(&self.tail, cursor) {
            let old_rest = self.tail.split_off(p + 1);
            let rest = match edges.last().and_then(|e| position(&old_rest, &e.cursor)) {
                Some(q) => old_rest[q + 1..].to_vec(),
                None if !page_info.has_next_page => Vec::new(),
                None => old_rest[edges.len().min(old_rest.len())..].to_vec(),
            };
            self.tail.extend(edges);
            self.tail.extend(rest);
        } else {
            tracing::warn!(cursor, "`after` cursor not in range, dropping page");
        }
    }

    fn add_last_page(&mut self, edges: Vec<RangeEdge>, page_info: &PageInfo) {
        if self.is_complete() {
            self.move_head_to_tail();
        }
        let old = std::mem::take(&mut self.tail);
        let front = edges
            .first()
            .and_then(|e| position(&old, &e.cursor))
            .map(|q| old[..q].to_vec())
            .unwrap_or_default();

        if front.is_empty() {
            self.tail = edges;
            self.tail_has_previous = page_info.has_previous_page;
        } else {
            self.tail = front;
            self.tail.extend(edges);
        }
        self.tail_loaded = true;
    }

    fn add_before(&mut self, cursor: &str, edges: Vec<RangeEdge>, page_info: &PageInfo) {
        if self.is_complete() {
            self.move_head_to_tail();
        }
        if let Some(p) = position(&self.tail, cursor) {
            let suffix = self.tail.split_off(p);
            let old_front = std::mem::take(&mut self.tail);
            let front = edges
                .first()
                .and_then(|e| position(&old_front, &e.cursor))
                .map(|q| old_front[..q].to_vec())
                .unwrap_or_default();
            if front.is_empty() {
                self.tail_has_previous = page_info.has_previous_page;
            }
            self.tail = front;
            self.tail.extend(edges);
            self.tail.extend(suffix);
        } else if let Some(p) = position(&self.head, cursor) {
            let suffix = self.head.split_off(p);
            let old_front = std::mem::take(&mut self.head);
            self.head = match edges.first().and_then(|e| position(&old_front, &e.cursor)) {
                Some(q) => old_front[..q].to_vec(),
                None if !page_info.has_previous_page => Vec::new(),
                None => old_front[..old_front.len().saturating_sub(edges.len())].to_vec(),
            };
            self.head.extend(edges);
            self.head.extend(suffix);
        } else {
            tracing::warn!(cursor, "`before` cursor not in range, dropping page");
        }
    }

    fn move_head_to_tail(&mut self) {
        self.tail = std::mem::take(&mut self.head);
        self.tail_loaded = true;
        self.tail_has_previous = false;
        self.head_loaded = false;
        self.head_has_next = true;
    }

    /// Restore the segment invariants after a splice.
    fn normalize(&mut self) {
        dedupe(&mut self.head);
        dedupe(&mut self.tail);

        if self.tail_loaded && !self.tail_has_previous {
            // The tail reaches the start, so it holds every edge.
            self.head = std::mem::take(&mut self.tail);
            self.head_loaded = true;
            self.head_has_next = false;
        }

        if !self.is_complete() && self.head_loaded && self.tail_loaded {
            let overlap = self.tail.iter().enumerate().find_map(|(t, edge)| {
                self.head
                    .iter()
                    .position(|h| h.edge_id == edge.edge_id)
                    .map(|h| (h, t))
            });
            if let Some((h, t)) = overlap {
                tracing::trace!(head = h, tail = t, "range segments joined");
                self.head.truncate(h);
                let joined = self.tail.split_off(t);
                self.head.extend(joined);
                self.head_has_next = false;
            }
        }

        if self.is_complete() {
            self.tail.clear();
            self.tail_loaded = false;
            self.tail_has_previous = true;
        }
    }

    /// Cursor for an edge offset placeholder.
    pub fn cursor_for_offset(&self, count: u64, from_end: bool) -> OffsetCursor {
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        if count == 0 {
            return OffsetCursor::Unavailable;
        }
        let complete = self.is_complete();
        if !from_end {
            if !self.head_loaded {
                return OffsetCursor::Unavailable;
            }
            if self.head.len() >= count {
                return OffsetCursor::At(self.head[count - 1].cursor.clone());
            }
            if complete {
                return OffsetCursor::Exhausted;
            }
            return match self.head.last() {
                Some(edge) => OffsetCursor::Beyond {
                    cursor: edge.cursor.clone(),
                    shortfall: (count - self.head.len()) as u64,
                },
                None => OffsetCursor::Unavailable,
            };
        }

        let (list, loaded) = if complete {
            (&self.head, true)
        } else {
            (&self.tail, self.tail_loaded)
        };
        if !loaded {
            return OffsetCursor::Unavailable;
        }
        if list.len() >= count {
            return OffsetCursor::At(list[list.len() - count].cursor.clone());
        }
        if complete {
            return OffsetCursor::Exhausted;
        }
        match list.first() {
            Some(edge) => OffsetCursor::Beyond {
                cursor: edge.cursor.clone(),
                shortfall: (count - list.len()) as u64,
            },
            None => OffsetCursor::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(n: u32) -> RangeEdge {
        RangeEdge::new(format!("e{}", n), format!("c{}", n))
    }

    fn edges(ns: impl IntoIterator<Item = u32>) -> Vec<RangeEdge> {
        ns.into_iter().map(edge).collect()
    }

    fn ids(ns: impl IntoIterator<Item = u32>) -> Vec<DataId> {
        ns.into_iter().map(|n| DataId::new(format!("e{}", n))).collect()
    }

    fn page(has_next: bool, has_previous: bool) -> PageInfo {
        PageInfo {
            has_next_page: has_next,
            has_previous_page: has_previous,
            ..Default::default()
        }
    }

    fn first(n: u64) -> Vec<Call> {
        vec![Call::new("first", n)]
    }

    fn first_after(n: u64, cursor: &str) -> Vec<Call> {
        vec![Call::new("first", n), Call::new("after", cursor)]
    }

    fn last(n: u64) -> Vec<Call> {
        vec![Call::new("last", n)]
    }

    fn last_before(n: u64, cursor: &str) -> Vec<Call> {
        vec![Call::new("last", n), Call::new("before", cursor)]
    }

    #[test]
    fn test_empty_range_covers_nothing() {
        let range = Range::new();
        let info = range.retrieve(&first(10)).unwrap();
        assert!(info.requested_edge_ids.is_empty());
        assert_eq!(info.diff_calls, first(10));
    }

    #[test]
    fn test_maximal_page_size_on_complete_range() {
        let mut range = Range::new();
        range.add_items(&first(2), edges(1..=2), &page(false, false)).unwrap();
        assert!(range.is_complete());

        let info = range.retrieve(&first_after(u64::MAX, "c1")).unwrap();
        assert_eq!(info.requested_edge_ids, ids(2..=2));
        assert!(info.is_covered());
        assert!(!info.page_info.has_next_page);

        let info = range.retrieve(&first(u64::MAX)).unwrap();
        assert_eq!(info.requested_edge_ids, ids(1..=2));
        assert_eq!(
            range.cursor_for_offset(u64::MAX, false),
            OffsetCursor::Exhausted
        );
    }

    #[test]
    fn test_append_after_cursor() {
        let mut range = Range::new();
        let update = range.add_items(&first(3), edges(1..=3), &page(true, false)).unwrap();
        assert_eq!(update.added, ids(1..=3));

        range
            .add_items(&first_after(3, "c3"), edges(4..=6), &page(true, false))
            .unwrap();
        assert_eq!(range.edge_ids(), ids(1..=6));

        let info = range.retrieve(&first(5)).unwrap();
        assert_eq!(info.requested_edge_ids, ids(1..=5));
        assert!(info.is_covered());
        assert!(info.page_info.has_next_page);

        let info = range.retrieve(&first(10)).unwrap();
        assert_eq!(info.requested_edge_ids, ids(1..=6));
        assert_eq!(info.diff_calls, first_after(4, "c6"));
    }

    #[test]
    fn test_prepend_before_cursor() {
        let mut range = Range::new();
        range.add_items(&last(2), edges(9..=10), &page(false, true)).unwrap();
        range
            .add_items(&last_before(3, "c9"), edges(6..=8), &page(false, true))
            .unwrap();
        assert_eq!(range.edge_ids(), ids(6..=10));

        let info = range.retrieve(&last(4)).unwrap();
        assert_eq!(info.requested_edge_ids, ids(7..=10));
        assert!(info.is_covered());
        assert!(info.page_info.has_previous_page);

        let info = range.retrieve(&last(8)).unwrap();
        assert_eq!(info.diff_calls, last_before(3, "c6"));
    }

    #[test]
    fn test_gap_fill_joins_segments() {
        let mut range = Range::new();
        range.add_items(&first(3), edges(1..=3), &page(true, false)).unwrap();
        range.add_items(&last(3), edges(6..=8), &page(false, true)).unwrap();
        assert!(!range.is_complete());

        let info = range.retrieve(&first_after(10, "c3")).unwrap();
        assert!(info.requested_edge_ids.is_empty());
        assert_eq!(info.diff_calls, first_after(10, "c3"));

        range
            .add_items(&first_after(4, "c3"), edges(4..=7), &page(true, true))
            .unwrap();
        assert!(range.is_complete());
        assert_eq!(range.edge_ids(), ids(1..=8));

        let info = range.retrieve(&first(100)).unwrap();
        assert_eq!(info.requested_edge_ids, ids(1..=8));
        assert!(info.is_covered());
        assert!(!info.page_info.has_next_page);
    }

    #[test]
    fn test_first_page_without_next_completes_range() {
        let mut range = Range::new();
        range.add_items(&first(10), edges(1..=4), &page(false, false)).unwrap();
        assert!(range.is_complete());

        let info = range.retrieve(&last(2)).unwrap();
        assert_eq!(info.requested_edge_ids, ids(3..=4));
        assert!(info.is_covered());
    }

    #[test]
    fn test_refetched_first_page_splices_out_stale_edges() {
        let mut range = Range::new();
        range.add_items(&first(3), edges(1..=3), &page(true, false)).unwrap();

        let fresh = vec![edge(1), edge(4), edge(5)];
        let update = range.add_items(&first(3), fresh, &page(true, false)).unwrap();
        assert_eq!(update.added, ids([4, 5]));
        assert_eq!(update.removed, ids([2, 3]));
        assert_eq!(range.edge_ids(), ids([1, 4, 5]));
    }

    #[test]
    fn test_refetched_first_page_keeps_overlapping_remainder() {
        let mut range = Range::new();
        range.add_items(&first(5), edges(1..=5), &page(true, false)).unwrap();
        let update = range.add_items(&first(2), edges(1..=2), &page(true, false)).unwrap();
        assert!(update.is_empty());
        assert_eq!(range.edge_ids(), ids(1..=5));
    }

    #[test]
    fn test_unknown_cursor_drops_page() {
        let mut range = Range::new();
        range.add_items(&first(2), edges(1..=2), &page(true, false)).unwrap();
        let update = range
            .add_items(&first_after(2, "nope"), edges(3..=4), &page(true, false))
            .unwrap();
        assert!(update.is_empty());
        assert_eq!(range.edge_ids(), ids(1..=2));
    }

    #[test]
    fn test_cursor_for_offset() {
        let mut range = Range::new();
        assert_eq!(range.cursor_for_offset(2, false), OffsetCursor::Unavailable);

        range.add_items(&first(3), edges(1..=3), &page(true, false)).unwrap();
        assert_eq!(range.cursor_for_offset(2, false), OffsetCursor::At("c2".to_string()));
        assert_eq!(
            range.cursor_for_offset(5, false),
            OffsetCursor::Beyond {
                cursor: "c3".to_string(),
                shortfall: 2
            }
        );

        range
            .add_items(&first_after(3, "c3"), edges(4..=4), &page(false, false))
            .unwrap();
        assert_eq!(range.cursor_for_offset(5, false), OffsetCursor::Exhausted);
        assert_eq!(range.cursor_for_offset(1, true), OffsetCursor::At("c4".to_string()));
    }
}
