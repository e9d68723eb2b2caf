//! Replacing edge offset placeholders with real cursors.

use crate::error::Result;
use crate::query::{has_non_identity, Call, CallValue, Field, FieldKind, QueryNode};
use crate::range::OffsetCursor;
use crate::records::RecordStore;
use crate::types::{DataId, FieldRead};

/// Resolve every [`CallValue::EdgeOffset`] in `query` against the store.
///
/// Offsets become the cursor of the edge at that position once the earlier
/// page is stored. A slice beyond the end of a finished connection is
/// dropped; returns `None` if nothing is left to fetch.
pub fn resolve_edge_offsets(query: &QueryNode, root_id: Option<&DataId>, store: &RecordStore) -> Result<Option<QueryNode>> {
    let rest = resolve_children(query.children(), root_id, store)?;
    if has_non_identity(&rest) {
        Ok(Some(query.with_children(rest)))
    } else {
        Ok(None)
    }
}

fn resolve_children(children: &[QueryNode], parent: Option<&DataId>, store: &RecordStore) -> Result<Vec<QueryNode>> {
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        if !child.contains_edge_offsets() {
            out.push(child.clone());
            continue;
        }
        match child {
            QueryNode::Field(field) => {
                if let Some(field) = resolve_field(field, parent, store)? {
                    out.push(QueryNode::Field(field));
                }
            }
            other => {
                let rest = resolve_children(other.children(), parent, store)?;
                if has_non_identity(&rest) {
                    out.push(other.with_children(rest));
                }
            }
        }
    }
    Ok(out)
}

fn resolve_field(field: &Field, parent: Option<&DataId>, store: &RecordStore) -> Result<Option<Field>> {
    let key = field.storage_key();
    let target = parent.and_then(|p| store.get_linked_record_id(p, &key).value());
    match field.kind {
        FieldKind::Connection => {
            let mut field = field.clone();
            if let Some(offset) = edge_offset(&field.calls) {
                let cursor = match &target {
                    Some(connection) => store
                        .range(connection)
                        .map(|range| range.cursor_for_offset(offset.0, offset.1))
                        .unwrap_or(OffsetCursor::Unavailable),
                    None => OffsetCursor::Unavailable,
                };
                match cursor {
                    OffsetCursor::At(cursor) => set_cursor(&mut field.calls, cursor, 0),
                    OffsetCursor::Beyond { cursor, shortfall } => set_cursor(&mut field.calls, cursor, shortfall),
                    OffsetCursor::Exhausted => {
                        tracing::debug!(field = %field.name, "offset slice past end of connection, dropped");
                        return Ok(None);
                    }
                    OffsetCursor::Unavailable => strip_offsets(&mut field.calls),
                }
            }
            field.children = resolve_children(&field.children, None, store)?;
            Ok(Some(field))
        }
        FieldKind::Linked => {
            let children = resolve_children(&field.children, target.as_ref(), store)?;
            Ok(Some(Field {
                children,
                ..field.clone()
            }))
        }
        // Elements cannot be addressed one by one; fall back to offsets from the start.
        FieldKind::Plural | FieldKind::Scalar => Ok(Some(strip_all(field))),
    }
}

fn edge_offset(calls: &[Call]) -> Option<(u64, bool)> {
    calls.iter().find_map(|c| match c.value {
        CallValue::EdgeOffset { count, from_end } => Some((count, from_end)),
        CallValue::Literal(_) => None,
    })
}

fn size_call_name(from_end: bool) -> &'static str {
    if from_end {
        "last"
    } else {
        "first"
    }
}

/// Swap the placeholder for `cursor` and grow the page by `shortfall`.
fn set_cursor(calls: &mut [Call], cursor: String, shortfall: u64) {
    let mut from_end = false;
    for call in calls.iter_mut() {
        if let CallValue::EdgeOffset { from_end: end, .. } = call.value {
            from_end = end;
            call.value = CallValue::Literal(serde_json::Value::String(cursor.clone()));
        }
    }
    if shortfall > 0 {
        grow(calls, size_call_name(from_end), shortfall);
    }
}

/// Drop the placeholder and widen the page to start at the connection end.
fn strip_offsets(calls: &mut Vec<Call>) {
    if let Some((count, from_end)) = edge_offset(calls) {
        calls.retain(|c| !matches!(c.value, CallValue::EdgeOffset { .. }));
        grow(calls, size_call_name(from_end), count);
    }
}

fn grow(calls: &mut [Call], name: &str, by: u64) {
    for call in calls.iter_mut().filter(|c| c.name == name) {
        if let Some(n) = call.as_u64() {
            call.value = CallValue::Literal(serde_json::Value::from(n.saturating_add(by)));
        }
    }
}

fn strip_all(field: &Field) -> Field {
    let mut field = field.clone();
    strip_offsets(&mut field.calls);
    field.children = field
        .children
        .iter()
        .map(|child| match child {
            QueryNode::Field(f) => QueryNode::Field(strip_all(f)),
            other => other.with_children(
                other
                    .children()
                    .iter()
                    .map(|c| match c {
                        QueryNode::Field(f) => QueryNode::Field(strip_all(f)),
                        c => c.clone(),
                    })
                    .collect(),
            ),
        })
        .collect();
    field
}
