//! Query diffing.
//!
//! Computes the smallest query that, once fetched, lets the store answer
//! the original query entirely.

use crate::error::Result;
use crate::query::{
    has_non_identity, is_compatible_type, with_connection_essentials, Field, FieldKind, QueryNode,
};
use crate::records::RecordStore;
use crate::types::{DataId, FieldRead, RecordState};

/// The part of `query` (rooted at `root_id`) the store cannot answer.
///
/// `None` means the store holds everything the query selects.
pub fn diff_query(query: &QueryNode, root_id: &DataId, store: &RecordStore) -> Result<Option<QueryNode>> {
    QueryDiffer::new(store).diff(query, root_id)
}

/// Walks a query against a store, pruning what is already cached.
pub struct QueryDiffer<'a> {
    store: &'a RecordStore,
}

impl<'a> QueryDiffer<'a> {
    pub fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    pub fn diff(&self, query: &QueryNode, root_id: &DataId) -> Result<Option<QueryNode>> {
        query.validate()?;
        let root = query.expect_root()?;
        match self.store.get_record_state(root_id) {
            RecordState::Unknown => Ok(Some(query.clone())),
            RecordState::Nonexistent => Ok(None),
            RecordState::Existent => {
                let rest = self.diff_children(&root.children, root_id)?;
                if rest.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(query.with_children(rest)))
                }
            }
        }
    }

    /// Missing selections of `children` on record `id`.
    ///
    /// Identity fields stay in place when anything else is kept and are
    /// dropped otherwise, so the result is empty on a full hit.
    fn diff_children(&self, children: &[QueryNode], id: &DataId) -> Result<Vec<QueryNode>> {
        let record_type = self.store.get_type(id);
        let mut out = Vec::new();
        for child in children {
            match child {
                QueryNode::Root(_) => out.push(child.clone()),
                QueryNode::Fragment(f) => {
                    if !is_compatible_type(&f.type_condition, f.is_abstract, record_type) {
                        continue;
                    }
                    let rest = self.diff_children(&f.children, id)?;
                    if !rest.is_empty() {
                        out.push(child.with_children(rest));
                    }
                }
                QueryNode::InlineFragment(f) => {
                    if !is_compatible_type(&f.type_condition, f.is_abstract, record_type) {
                        continue;
                    }
                    let rest = self.diff_children(&f.children, id)?;
                    if !rest.is_empty() {
                        out.push(child.with_children(rest));
                    }
                }
                QueryNode::Field(field) if field.is_identity() => out.push(child.clone()),
                QueryNode::Field(field) => {
                    if let Some(kept) = self.diff_field(field, id)? {
                        out.push(QueryNode::Field(kept));
                    }
                }
            }
        }
        if !has_non_identity(&out) {
            out.clear();
        }
        Ok(out)
    }

    fn diff_field(&self, field: &Field, id: &DataId) -> Result<Option<Field>> {
        let key = field.storage_key();
        match field.kind {
            FieldKind::Scalar => {
                if self.store.get_field(id, &key).is_unknown() {
                    Ok(Some(field.clone()))
                } else {
                    Ok(None)
                }
            }
            FieldKind::Linked => match self.store.get_linked_record_id(id, &key) {
                FieldRead::Unknown => Ok(Some(field.clone())),
                FieldRead::Null => Ok(None),
                FieldRead::Value(target) => self.diff_linked(field, &target),
            },
            FieldKind::Plural => match self.store.get_linked_record_ids(id, &key) {
                FieldRead::Unknown => Ok(Some(field.clone())),
                FieldRead::Null => Ok(None),
                FieldRead::Value(targets) => match self.diff_plural(&field.children, &targets)? {
                    None => Ok(Some(field.clone())),
                    Some(rest) if rest.is_empty() => Ok(None),
                    Some(rest) => Ok(Some(Field {
                        children: rest,
                        ..field.clone()
                    })),
                },
            },
            FieldKind::Connection => match self.store.get_linked_record_id(id, &key) {
                FieldRead::Unknown => Ok(Some(field.clone())),
                FieldRead::Null => Ok(None),
                FieldRead::Value(connection) => match self.store.get_record_state(&connection) {
                    RecordState::Unknown => Ok(Some(field.clone())),
                    RecordState::Nonexistent => Ok(None),
                    RecordState::Existent => self.diff_connection(field, &connection),
                },
            },
        }
    }

    fn diff_linked(&self, field: &Field, target: &DataId) -> Result<Option<Field>> {
        match self.store.get_record_state(target) {
            RecordState::Unknown => Ok(Some(field.clone())),
            RecordState::Nonexistent => Ok(None),
            RecordState::Existent => {
                let rest = self.diff_children(&field.children, target)?;
                if rest.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Field {
                        children: rest,
                        ..field.clone()
                    }))
                }
            }
        }
    }

    /// Merged missing selections over every element, or `None` if some
    /// element is unknown and the whole list has to be refetched.
    fn diff_plural(&self, children: &[QueryNode], targets: &[DataId]) -> Result<Option<Vec<QueryNode>>> {
        let mut merged = Vec::new();
        for target in targets {
            match self.store.get_record_state(target) {
                RecordState::Unknown => return Ok(None),
                RecordState::Nonexistent => {}
                RecordState::Existent => {
                    let rest = self.diff_children(children, target)?;
                    merge_selections(&mut merged, rest);
                }
            }
        }
        Ok(Some(merged))
    }

    fn diff_connection(&self, field: &Field, connection: &DataId) -> Result<Option<Field>> {
        let edges = field
            .children
            .iter()
            .filter_map(QueryNode::as_field)
            .find(|f| f.name == "edges");
        let page_info = field
            .children
            .iter()
            .filter_map(QueryNode::as_field)
            .find(|f| f.name == "pageInfo");
        let others: Vec<QueryNode> = field
            .children
            .iter()
            .filter(|c| !matches!(c, QueryNode::Field(f) if f.name == "edges" || f.name == "pageInfo"))
            .cloned()
            .collect();
        let other_missing = self.diff_children(&others, connection)?;

        let edges = match edges {
            Some(edges) => edges,
            None => {
                // Nothing to page through, only connection-level fields.
                return Ok(if other_missing.is_empty() {
                    None
                } else {
                    Some(Field {
                        children: other_missing,
                        ..field.clone()
                    })
                });
            }
        };

        let info = self.store.range_info(connection, &field.range_calls())?;
        let edges_missing = self.diff_plural(&edges.children, &info.requested_edge_ids)?;

        if !info.is_covered() {
            let stored_edges_complete = matches!(&edges_missing, Some(rest) if rest.is_empty());
            if !stored_edges_complete {
                return Ok(Some(field.clone()));
            }
            let mut calls = field.non_range_calls();
            calls.extend(info.diff_calls);
            let mut children = vec![QueryNode::Field(edges.clone())];
            if let Some(page_info) = page_info {
                children.push(QueryNode::Field(page_info.clone()));
            }
            children.extend(other_missing);
            return Ok(Some(Field {
                calls,
                children,
                ..field.clone()
            }));
        }

        let mut remaining = other_missing;
        match edges_missing {
            None => remaining.push(QueryNode::Field(edges.clone())),
            Some(rest) if rest.is_empty() => {}
            Some(rest) => remaining.push(QueryNode::Field(Field {
                children: rest,
                ..edges.clone()
            })),
        }
        if !has_non_identity(&remaining) {
            return Ok(None);
        }
        Ok(Some(Field {
            children: with_connection_essentials(&field.children, remaining),
            ..field.clone()
        }))
    }
}

fn same_selection(a: &QueryNode, b: &QueryNode) -> bool {
    match (a, b) {
        (QueryNode::Field(x), QueryNode::Field(y)) => {
            x.response_key() == y.response_key() && x.name == y.name && x.kind == y.kind
        }
        (QueryNode::Fragment(x), QueryNode::Fragment(y)) => x.name == y.name,
        (QueryNode::InlineFragment(x), QueryNode::InlineFragment(y)) => x.type_condition == y.type_condition,
        _ => false,
    }
}

/// Union `more` into `acc`, merging children of matching selections.
fn merge_selections(acc: &mut Vec<QueryNode>, more: Vec<QueryNode>) {
    for node in more {
        match acc.iter_mut().find(|existing| same_selection(existing, &node)) {
            Some(existing) => {
                if node.children().is_empty() {
                    continue;
                }
                let mut children = existing.children().to_vec();
                merge_selections(&mut children, node.children().to_vec());
                *existing = existing.with_children(children);
            }
            None => acc.push(node),
        }
    }
}
