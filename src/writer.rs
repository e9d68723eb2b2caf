//! Payload normalization.
//!
//! A server payload for a query is flattened into a [`WriteBatch`] of store
//! mutations. The whole payload is checked against the query shape while
//! the batch is built, so a malformed payload never reaches the store.

use crate::error::{CacheError, Result};
use crate::query::{is_compatible_type, Call, Field, FieldKind, QueryNode, Root};
use crate::range::{PageInfo, RangeCalls, RangeEdge};
use crate::records::RecordStore;
use crate::types::DataId;
use serde_json::{Map, Value};

/// A single store mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    PutRecord { id: DataId, typename: Option<String> },
    DeleteRecord(DataId),
    PutField { id: DataId, key: String, value: Value },
    PutLink { id: DataId, key: String, target: Option<DataId> },
    PutLinks { id: DataId, key: String, targets: Vec<DataId> },
    AddRangeItems {
        id: DataId,
        calls: Vec<Call>,
        edges: Vec<RangeEdge>,
        page_info: PageInfo,
    },
    PutRootCall { storage_key: String, id: DataId },
}

/// Mutations for one payload, in application order.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    /// Record the root call resolved to, if the payload named one.
    pub root_id: Option<DataId>,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Apply every mutation to `store`.
    pub fn apply(self, store: &mut RecordStore) -> Result<()> {
        for mutation in self.mutations {
            match mutation {
                Mutation::PutRecord { id, typename } => store.put_record(&id, typename.as_deref()),
                Mutation::DeleteRecord(id) => store.delete_record(&id),
                Mutation::PutField { id, key, value } => store.put_field(&id, &key, value)?,
                Mutation::PutLink { id, key, target } => store.put_linked_record(&id, &key, target)?,
                Mutation::PutLinks { id, key, targets } => store.put_linked_records(&id, &key, targets)?,
                Mutation::AddRangeItems {
                    id,
                    calls,
                    edges,
                    page_info,
                } => {
                    store.add_range_items(&id, &calls, edges, &page_info)?;
                }
                Mutation::PutRootCall { storage_key, id } => store.put_root_call_id(&storage_key, &id),
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> CacheError {
    CacheError::InvalidPayload(message)
}

/// The id an object names for itself.
fn object_id(object: &Map<String, Value>) -> Option<DataId> {
    match object.get("id") {
        Some(Value::String(s)) => Some(DataId::new(s.clone())),
        Some(Value::Number(n)) => Some(DataId::new(n.to_string())),
        _ => None,
    }
}

/// Record id for the root call of `root`, before any payload is known.
pub fn root_record_id(root: &Root, store: &RecordStore) -> DataId {
    root.identifying_id()
        .or_else(|| store.get_root_call_id(&root.storage_key()).cloned())
        .unwrap_or_else(|| root_placeholder_id(root))
}

/// Client id standing in for a root call that names no record.
fn root_placeholder_id(root: &Root) -> DataId {
    DataId::client(&DataId::new("root"), &root.storage_key())
}

/// Build the mutations that store `payload` as the result of `query`.
///
/// `payload` is the value of the root field: an object, or `null` when the
/// root record does not exist.
pub fn write_payload(store: &RecordStore, query: &QueryNode, payload: &Value) -> Result<WriteBatch> {
    let root = query.expect_root()?;
    let storage_key = root.storage_key();
    let mut writer = PayloadWriter {
        store,
        batch: WriteBatch::default(),
    };

    match payload {
        Value::Null => {
            // A root call without an id argument remembers its null through the placeholder.
            let id = root.identifying_id().unwrap_or_else(|| root_placeholder_id(root));
            writer.batch.push(Mutation::DeleteRecord(id.clone()));
            writer.batch.push(Mutation::PutRootCall {
                storage_key,
                id: id.clone(),
            });
            writer.batch.root_id = Some(id);
        }
        Value::Object(object) => {
            let id = object_id(object).unwrap_or_else(|| root_record_id(root, store));
            writer.write_record(&id, &root.children, object)?;
            writer.batch.push(Mutation::PutRootCall {
                storage_key,
                id: id.clone(),
            });
            writer.batch.root_id = Some(id);
        }
        other => {
            return Err(invalid(format!(
                "root `{}` expects an object or null, got {}",
                root.field, other
            )))
        }
    }

    tracing::trace!(root = %root.field, mutations = writer.batch.len(), "payload normalized");
    Ok(writer.batch)
}

struct PayloadWriter<'a> {
    store: &'a RecordStore,
    batch: WriteBatch,
}

impl PayloadWriter<'_> {
    fn write_record(&mut self, id: &DataId, selections: &[QueryNode], object: &Map<String, Value>) -> Result<()> {
        let typename = object
            .get("__typename")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.batch.push(Mutation::PutRecord {
            id: id.clone(),
            typename: typename.clone(),
        });
        let store = self.store;
        let record_type = typename.as_deref().or_else(|| store.get_type(id));
        self.write_selections(id, record_type, selections, object)
    }

    fn write_selections(
        &mut self,
        id: &DataId,
        record_type: Option<&str>,
        selections: &[QueryNode],
        object: &Map<String, Value>,
    ) -> Result<()> {
        for node in selections {
            match node {
                QueryNode::Root(_) => {
                    return Err(CacheError::MalformedQuery("nested root in query".to_string()))
                }
                QueryNode::Fragment(f) => {
                    if is_compatible_type(&f.type_condition, f.is_abstract, record_type) {
                        self.write_selections(id, record_type, &f.children, object)?;
                    }
                }
                QueryNode::InlineFragment(f) => {
                    if is_compatible_type(&f.type_condition, f.is_abstract, record_type) {
                        self.write_selections(id, record_type, &f.children, object)?;
                    }
                }
                QueryNode::Field(field) => {
                    if field.is_identity() {
                        continue;
                    }
                    // Absent fields stay unknown.
                    if let Some(value) = object.get(field.response_key()) {
                        self.write_field(id, field, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_field(&mut self, id: &DataId, field: &Field, value: &Value) -> Result<()> {
        let key = field.storage_key();
        match (field.kind, value) {
            (FieldKind::Scalar, value) => self.batch.push(Mutation::PutField {
                id: id.clone(),
                key,
                value: value.clone(),
            }),
            (_, Value::Null) => self.batch.push(Mutation::PutLink {
                id: id.clone(),
                key,
                target: None,
            }),
            (FieldKind::Linked, Value::Object(object)) => {
                let target = object_id(object).unwrap_or_else(|| DataId::client(id, &key));
                self.write_record(&target, &field.children, object)?;
                self.batch.push(Mutation::PutLink {
                    id: id.clone(),
                    key,
                    target: Some(target),
                });
            }
            (FieldKind::Plural, Value::Array(items)) => {
                let mut targets = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let object = item.as_object().ok_or_else(|| {
                        invalid(format!("`{}`[{}] on `{}` must be an object", field.name, i, id))
                    })?;
                    let target =
                        object_id(object).unwrap_or_else(|| DataId::client(id, &format!("{}:{}", key, i)));
                    self.write_record(&target, &field.children, object)?;
                    targets.push(target);
                }
                self.batch.push(Mutation::PutLinks {
                    id: id.clone(),
                    key,
                    targets,
                });
            }
            (FieldKind::Connection, Value::Object(object)) => {
                let connection = DataId::client(id, &key);
                self.write_connection(&connection, field, object)?;
                self.batch.push(Mutation::PutLink {
                    id: id.clone(),
                    key,
                    target: Some(connection),
                });
            }
            (kind, other) => {
                return Err(invalid(format!(
                    "{:?} field `{}` on `{}` cannot hold {}",
                    kind, field.name, id, other
                )))
            }
        }
        Ok(())
    }

    fn write_connection(&mut self, connection: &DataId, field: &Field, object: &Map<String, Value>) -> Result<()> {
        let others: Vec<QueryNode> = field
            .children
            .iter()
            .filter(|c| !matches!(c, QueryNode::Field(f) if f.name == "edges" || f.name == "pageInfo"))
            .cloned()
            .collect();
        self.write_record(connection, &others, object)?;

        let edges_field = field
            .children
            .iter()
            .filter_map(QueryNode::as_field)
            .find(|f| f.name == "edges");
        let (edges_field, items) = match (edges_field, object.get("edges")) {
            (Some(f), Some(Value::Array(items))) => (f, items),
            (Some(_), Some(other)) => {
                return Err(invalid(format!("`edges` of `{}` must be a list, got {}", connection, other)))
            }
            _ => return Ok(()),
        };

        let calls = field.range_calls();
        let shape = RangeCalls::parse(&calls).map_err(|e| invalid(e.to_string()))?;

        let mut edges = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let edge = item
                .as_object()
                .ok_or_else(|| invalid(format!("edge {} of `{}` must be an object", i, connection)))?;
            let cursor = edge
                .get("cursor")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(format!("edge {} of `{}` has no cursor", i, connection)))?;
            let node_id = edge.get("node").and_then(Value::as_object).and_then(object_id);
            let edge_id = match &node_id {
                Some(node) => DataId::edge(connection, node),
                None => DataId::client(connection, &format!("edge:{}", cursor)),
            };
            self.write_record(&edge_id, &edges_field.children, edge)?;
            edges.push(RangeEdge::new(edge_id, cursor));
        }

        let page_info = match object.get("pageInfo") {
            Some(Value::Object(info)) => PageInfo {
                has_next_page: info.get("hasNextPage").and_then(Value::as_bool).unwrap_or(false),
                has_previous_page: info.get("hasPreviousPage").and_then(Value::as_bool).unwrap_or(false),
                start_cursor: info.get("startCursor").and_then(Value::as_str).map(str::to_string),
                end_cursor: info.get("endCursor").and_then(Value::as_str).map(str::to_string),
            },
            // Without page info, a full page means there may be more.
            _ => {
                let full = match shape {
                    RangeCalls::First { count, .. } | RangeCalls::Last { count, .. } => edges.len() >= count,
                };
                PageInfo {
                    has_next_page: full,
                    has_previous_page: full,
                    ..Default::default()
                }
            }
        };

        self.batch.push(Mutation::AddRangeItems {
            id: connection.clone(),
            calls,
            edges,
            page_info,
        });
        Ok(())
    }
}
