//! Query subtraction.
//!
//! `subtract_query(a, b)` is the part of `a` that fetching `b` does not
//! already fetch. Used to strip outstanding requests from new ones.

use super::node::{
    find_call, has_non_identity, with_connection_essentials, Call, CallValue, Field, FieldKind,
    QueryNode,
};

/// A subtrahend field, guarded by the type condition it was selected under.
struct Covering<'a> {
    field: &'a Field,
    guard: Option<&'a str>,
}

impl Covering<'_> {
    fn applies(&self, guard: Option<&str>) -> bool {
        self.guard.is_none() || self.guard == guard
    }
}

fn collect_covering<'a>(nodes: &'a [QueryNode], guard: Option<&'a str>, out: &mut Vec<Covering<'a>>) {
    for node in nodes {
        match node {
            QueryNode::Field(field) => out.push(Covering { field, guard }),
            QueryNode::Fragment(f) => collect_covering(&f.children, Some(&f.type_condition), out),
            QueryNode::InlineFragment(f) => {
                collect_covering(&f.children, Some(&f.type_condition), out)
            }
            QueryNode::Root(_) => {}
        }
    }
}

/// The part of `minuend` not covered by `subtrahend`, or `None` if nothing remains.
///
/// Queries on different roots, or with different variables, are disjoint, so
/// `minuend` comes back whole.
pub fn subtract_query(minuend: &QueryNode, subtrahend: &QueryNode) -> Option<QueryNode> {
    match (minuend, subtrahend) {
        (QueryNode::Root(a), QueryNode::Root(b))
            if a.storage_key() == b.storage_key() && a.variables == b.variables =>
        {
            let mut covering = Vec::new();
            collect_covering(&b.children, None, &mut covering);
            let remaining = subtract_children(&a.children, &covering, None);
            if has_non_identity(&remaining) {
                Some(minuend.with_children(remaining))
            } else {
                None
            }
        }
        _ => Some(minuend.clone()),
    }
}

fn subtract_children(children: &[QueryNode], covering: &[Covering<'_>], guard: Option<&str>) -> Vec<QueryNode> {
    let mut remaining = Vec::new();
    for child in children {
        match child {
            QueryNode::Root(_) => remaining.push(child.clone()),
            QueryNode::Fragment(f) => {
                let rest = subtract_children(&f.children, covering, Some(&f.type_condition));
                if has_non_identity(&rest) {
                    remaining.push(child.with_children(rest));
                }
            }
            QueryNode::InlineFragment(f) => {
                let rest = subtract_children(&f.children, covering, Some(&f.type_condition));
                if has_non_identity(&rest) {
                    remaining.push(child.with_children(rest));
                }
            }
            QueryNode::Field(field) => {
                if field.is_identity() {
                    remaining.push(child.clone());
                    continue;
                }
                let key = field.storage_key();
                let matches: Vec<&Field> = covering
                    .iter()
                    .filter(|c| c.applies(guard) && c.field.kind == field.kind && c.field.storage_key() == key)
                    .map(|c| c.field)
                    .collect();
                if matches.is_empty() {
                    remaining.push(child.clone());
                    continue;
                }
                let rest = match field.kind {
                    FieldKind::Scalar => None,
                    FieldKind::Linked | FieldKind::Plural => subtract_nested(field, &matches),
                    FieldKind::Connection => subtract_connection(field, &matches),
                };
                if let Some(rest) = rest {
                    remaining.push(QueryNode::Field(rest));
                }
            }
        }
    }
    remaining
}

fn subtract_nested(field: &Field, matches: &[&Field]) -> Option<Field> {
    let mut covering = Vec::new();
    for m in matches {
        collect_covering(&m.children, None, &mut covering);
    }
    let rest = subtract_children(&field.children, &covering, None);
    if has_non_identity(&rest) {
        Some(Field {
            children: rest,
            ..field.clone()
        })
    } else {
        None
    }
}

/// Page direction, size and starting cursor of a connection field.
struct RangeShape {
    forward: bool,
    count: u64,
    cursor: Option<CallValue>,
}

impl RangeShape {
    fn of(field: &Field) -> Option<Self> {
        if let Some(first) = find_call(&field.calls, "first") {
            return Some(Self {
                forward: true,
                count: first.as_u64()?,
                cursor: find_call(&field.calls, "after").map(|c| c.value.clone()),
            });
        }
        let last = find_call(&field.calls, "last")?;
        Some(Self {
            forward: false,
            count: last.as_u64()?,
            cursor: find_call(&field.calls, "before").map(|c| c.value.clone()),
        })
    }
}

enum RangeSubtraction {
    Covered,
    Shrunk(Field),
    Unchanged,
}

fn subtract_connection(field: &Field, matches: &[&Field]) -> Option<Field> {
    let mut current = field.clone();
    for m in matches {
        match subtract_range(&current, m) {
            RangeSubtraction::Covered => return None,
            RangeSubtraction::Shrunk(rest) => current = rest,
            RangeSubtraction::Unchanged => {}
        }
    }
    Some(current)
}

fn subtract_range(field: &Field, pending: &Field) -> RangeSubtraction {
    let (wanted, fetching) = match (RangeShape::of(field), RangeShape::of(pending)) {
        (Some(w), Some(f)) => (w, f),
        _ => return RangeSubtraction::Unchanged,
    };
    if wanted.forward != fetching.forward || wanted.cursor != fetching.cursor {
        return RangeSubtraction::Unchanged;
    }

    let mut covering = Vec::new();
    collect_covering(&pending.children, None, &mut covering);
    let rest = subtract_children(&field.children, &covering, None);

    if fetching.count >= wanted.count {
        if !has_non_identity(&rest) {
            return RangeSubtraction::Covered;
        }
        return RangeSubtraction::Shrunk(Field {
            children: with_connection_essentials(&field.children, rest),
            ..field.clone()
        });
    }

    // A shorter page only helps when it fetches everything we select.
    if has_non_identity(&rest) {
        return RangeSubtraction::Unchanged;
    }
    let skipped = match &wanted.cursor {
        None => fetching.count,
        Some(CallValue::EdgeOffset { count, .. }) => count.saturating_add(fetching.count),
        Some(CallValue::Literal(_)) => return RangeSubtraction::Unchanged,
    };
    let (size_call, cursor_call) = if wanted.forward {
        ("first", "after")
    } else {
        ("last", "before")
    };
    let mut calls = field.non_range_calls();
    calls.push(Call::new(size_call, wanted.count - fetching.count));
    calls.push(Call::edge_offset(cursor_call, skipped, !wanted.forward));
    RangeSubtraction::Shrunk(Field {
        calls,
        ..field.clone()
    })
}
