//! Reading queries out of the store.

use super::data::{Data, DataObject};
use crate::error::Result;
use crate::query::{is_compatible_type, Field, FieldKind, QueryNode};
use crate::range::RangeInfo;
use crate::records::RecordStore;
use crate::types::{DataId, FieldRead, RecordState};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of reading a query.
#[derive(Clone, Debug)]
pub struct Resolution {
    /// `None` when the root record is unknown.
    pub data: Option<Data>,
    /// Every record consulted, in first-read order.
    pub observed: Vec<DataId>,
    /// True if some selected data was not in the store.
    pub missing: bool,
}

/// Read `query` rooted at `root_id`.
pub fn read_query(store: &RecordStore, query: &QueryNode, root_id: &DataId) -> Result<Resolution> {
    query.validate()?;
    let root = query.expect_root()?;
    let mut reader = QueryResolver {
        store,
        observed: Vec::new(),
        seen: HashSet::new(),
        missing: false,
    };
    reader.observe(root_id);
    let data = match store.get_record_state(root_id) {
        RecordState::Unknown => {
            reader.missing = true;
            None
        }
        RecordState::Nonexistent => Some(Data::Null),
        RecordState::Existent => Some(reader.read_object(root_id, &root.children, None)?),
    };
    Ok(Resolution {
        data,
        observed: reader.observed,
        missing: reader.missing,
    })
}

impl Resolution {
    /// The data, or `None` if any selected part of it is missing.
    pub fn into_complete(self) -> Option<Data> {
        if self.missing {
            None
        } else {
            self.data
        }
    }
}

/// Read `query` and return the data only if the store holds all of it.
pub fn resolve_query(store: &RecordStore, query: &QueryNode, root_id: &DataId) -> Result<Option<Data>> {
    Ok(read_query(store, query, root_id)?.into_complete())
}

struct QueryResolver<'a> {
    store: &'a RecordStore,
    observed: Vec<DataId>,
    seen: HashSet<DataId>,
    missing: bool,
}

impl QueryResolver<'_> {
    fn observe(&mut self, id: &DataId) {
        if self.seen.insert(id.clone()) {
            self.observed.push(id.clone());
        }
    }

    fn read_object(&mut self, id: &DataId, selections: &[QueryNode], range: Option<&RangeInfo>) -> Result<Data> {
        let mut fields = Vec::new();
        self.read_selections(id, selections, range, &mut fields)?;
        Ok(Data::Object(Arc::new(DataObject {
            data_id: Some(id.clone()),
            fields,
        })))
    }

    fn read_selections(
        &mut self,
        id: &DataId,
        selections: &[QueryNode],
        range: Option<&RangeInfo>,
        fields: &mut Vec<(String, Data)>,
    ) -> Result<()> {
        let store = self.store;
        let record_type = store.get_type(id);
        for node in selections {
            match node {
                QueryNode::Root(_) => {}
                QueryNode::Fragment(f) => {
                    if is_compatible_type(&f.type_condition, f.is_abstract, record_type) {
                        self.read_selections(id, &f.children, range, fields)?;
                    }
                }
                QueryNode::InlineFragment(f) => {
                    if is_compatible_type(&f.type_condition, f.is_abstract, record_type) {
                        self.read_selections(id, &f.children, range, fields)?;
                    }
                }
                QueryNode::Field(field) => {
                    let value = match range {
                        Some(info) if field.name == "edges" => Some(self.read_edges(field, info)?),
                        Some(info) if field.name == "pageInfo" => Some(page_info_object(field, info)),
                        _ => self.read_field(id, field)?,
                    };
                    if let Some(value) = value {
                        insert_field(fields, field.response_key(), value);
                    }
                }
            }
        }
        Ok(())
    }

    /// `None` means the value is not in the store.
    fn read_field(&mut self, id: &DataId, field: &Field) -> Result<Option<Data>> {
        let key = field.storage_key();
        let value = match field.kind {
            FieldKind::Scalar => match self.store.get_field(id, &key) {
                FieldRead::Unknown => None,
                FieldRead::Null => Some(Data::Null),
                FieldRead::Value(v) => Some(Data::Scalar(v)),
            },
            FieldKind::Linked => match self.store.get_linked_record_id(id, &key) {
                FieldRead::Unknown => None,
                FieldRead::Null => Some(Data::Null),
                FieldRead::Value(target) => self.read_linked(&target, &field.children)?,
            },
            FieldKind::Plural => match self.store.get_linked_record_ids(id, &key) {
                FieldRead::Unknown => None,
                FieldRead::Null => Some(Data::Null),
                FieldRead::Value(targets) => {
                    let mut items = Vec::with_capacity(targets.len());
                    for target in &targets {
                        if let Some(item) = self.read_linked(target, &field.children)? {
                            items.push(item);
                        }
                    }
                    Some(Data::List(Arc::new(items)))
                }
            },
            FieldKind::Connection => match self.store.get_linked_record_id(id, &key) {
                FieldRead::Unknown => None,
                FieldRead::Null => Some(Data::Null),
                FieldRead::Value(connection) => {
                    self.observe(&connection);
                    match self.store.get_record_state(&connection) {
                        RecordState::Unknown => None,
                        RecordState::Nonexistent => Some(Data::Null),
                        RecordState::Existent => {
                            let info = self.store.range_info(&connection, &field.range_calls())?;
                            let reads_edges = field
                                .children
                                .iter()
                                .any(|c| matches!(c, QueryNode::Field(f) if f.name == "edges"));
                            if reads_edges && !info.is_covered() {
                                self.missing = true;
                            }
                            Some(self.read_object(&connection, &field.children, Some(&info))?)
                        }
                    }
                }
            },
        };
        if value.is_none() {
            self.missing = true;
        }
        Ok(value)
    }

    fn read_linked(&mut self, target: &DataId, selections: &[QueryNode]) -> Result<Option<Data>> {
        self.observe(target);
        match self.store.get_record_state(target) {
            RecordState::Unknown => {
                self.missing = true;
                Ok(None)
            }
            RecordState::Nonexistent => Ok(Some(Data::Null)),
            RecordState::Existent => Ok(Some(self.read_object(target, selections, None)?)),
        }
    }

    fn read_edges(&mut self, field: &Field, info: &RangeInfo) -> Result<Data> {
        let mut items = Vec::with_capacity(info.requested_edge_ids.len());
        for edge in &info.requested_edge_ids {
            if let Some(item) = self.read_linked(edge, &field.children)? {
                items.push(item);
            }
        }
        Ok(Data::List(Arc::new(items)))
    }
}

fn page_info_object(field: &Field, info: &RangeInfo) -> Data {
    let page = &info.page_info;
    let cursor = |c: &Option<String>| c.clone().map_or(Data::Null, |c| Data::Scalar(Value::String(c)));
    let mut fields = Vec::new();
    for child in field.children.iter().filter_map(QueryNode::as_field) {
        let value = match child.name.as_str() {
            "hasNextPage" => Data::Scalar(Value::Bool(page.has_next_page)),
            "hasPreviousPage" => Data::Scalar(Value::Bool(page.has_previous_page)),
            "startCursor" => cursor(&page.start_cursor),
            "endCursor" => cursor(&page.end_cursor),
            _ => Data::Null,
        };
        fields.push((child.response_key().to_string(), value));
    }
    Data::Object(Arc::new(DataObject { data_id: None, fields }))
}

/// Add a field, merging objects selected more than once (e.g. through fragments).
fn insert_field(fields: &mut Vec<(String, Data)>, key: &str, value: Data) {
    match fields.iter_mut().find(|(k, _)| k == key) {
        None => fields.push((key.to_string(), value)),
        Some((_, existing)) => {
            if let (Data::Object(old), Data::Object(new)) = (&*existing, &value) {
                if old.data_id == new.data_id {
                    let data_id = old.data_id.clone();
                    let mut merged = old.fields.clone();
                    for (k, v) in new.fields.iter() {
                        insert_field(&mut merged, k, v.clone());
                    }
                    *existing = Data::Object(Arc::new(DataObject { data_id, fields: merged }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Call, Fragment, Root};
    use crate::range::{PageInfo, RangeEdge};
    use serde_json::json;

    fn id(s: &str) -> DataId {
        DataId::new(s)
    }

    fn node(children: Vec<QueryNode>) -> QueryNode {
        Root::new("node").with_call("id", "1").with_children(children).into()
    }

    #[test]
    fn test_unknown_root_resolves_to_none() {
        let store = RecordStore::new();
        let res = read_query(&store, &node(vec![Field::scalar("name").into()]), &id("1")).unwrap();
        assert!(res.data.is_none());
        assert!(res.missing);
        assert_eq!(res.observed, vec![id("1")]);
    }

    #[test]
    fn test_resolves_nested_records() {
        let mut store = RecordStore::new();
        store.put_record(&id("1"), Some("User"));
        store.put_field(&id("1"), "name", json!("Zuck")).unwrap();
        store.put_record(&id("2"), Some("User"));
        store.put_field(&id("2"), "name", json!("Chan")).unwrap();
        store.put_linked_records(&id("1"), "friends", vec![id("2")]).unwrap();
        store.put_linked_record(&id("1"), "boss", None).unwrap();

        let query = node(vec![
            Field::scalar("id").into(),
            Field::scalar("name").into(),
            Field::linked("boss", vec![Field::scalar("name").into()]).into(),
            Field::plural("friends", vec![Field::scalar("name").into()]).into(),
        ]);
        let res = read_query(&store, &query, &id("1")).unwrap();
        assert!(!res.missing);
        assert_eq!(res.observed, vec![id("1"), id("2")]);
        assert_eq!(
            res.data.unwrap().to_json(),
            json!({"id": "1", "name": "Zuck", "boss": null, "friends": [{"name": "Chan"}]})
        );
    }

    #[test]
    fn test_missing_fields_are_flagged() {
        let mut store = RecordStore::new();
        store.put_record(&id("1"), None);
        let res = read_query(&store, &node(vec![Field::scalar("name").into()]), &id("1")).unwrap();
        assert!(res.missing);
        assert_eq!(res.data.unwrap().to_json(), json!({}));
    }

    #[test]
    fn test_partial_read_is_not_returned() {
        let mut store = RecordStore::new();
        store.put_record(&id("1"), Some("User"));
        store.put_field(&id("1"), "name", json!("Zuck")).unwrap();
        let query = node(vec![Field::scalar("name").into(), Field::scalar("birthday").into()]);

        let res = read_query(&store, &query, &id("1")).unwrap();
        assert!(res.missing);
        assert_eq!(res.data.as_ref().unwrap().to_json(), json!({"name": "Zuck"}));
        assert!(res.into_complete().is_none());
        assert!(resolve_query(&store, &query, &id("1")).unwrap().is_none());

        store.put_field(&id("1"), "birthday", json!(null)).unwrap();
        let data = resolve_query(&store, &query, &id("1")).unwrap().unwrap();
        assert_eq!(data.to_json(), json!({"name": "Zuck", "birthday": null}));
    }

    #[test]
    fn test_fragments_merge_into_one_object() {
        let mut store = RecordStore::new();
        store.put_record(&id("1"), Some("User"));
        store.put_field(&id("1"), "name", json!("Zuck")).unwrap();
        store.put_field(&id("1"), "photo", json!("z.png")).unwrap();

        let query = node(vec![
            Field::scalar("name").into(),
            Fragment::new("UserPhoto", "User", vec![Field::scalar("photo").into()]).into(),
            Fragment::new("PagePhoto", "Page", vec![Field::scalar("cover").into()]).into(),
        ]);
        let data = resolve_query(&store, &query, &id("1")).unwrap().unwrap();
        assert_eq!(data.to_json(), json!({"name": "Zuck", "photo": "z.png"}));
    }

    #[test]
    fn test_connection_reads_range() {
        let mut store = RecordStore::new();
        store.put_record(&id("1"), None);
        let conn = DataId::client(&id("1"), "friends");
        store.put_record(&conn, None);
        store.put_field(&conn, "count", json!(3)).unwrap();
        store.put_linked_record(&id("1"), "friends", Some(conn.clone())).unwrap();
        let mut edges = Vec::new();
        for n in ["a", "b", "c"] {
            store.put_record(&id(n), None);
            store.put_field(&id(n), "name", json!(n)).unwrap();
            let edge = DataId::edge(&conn, &id(n));
            store.put_record(&edge, None);
            store.put_field(&edge, "cursor", json!(format!("c-{}", n))).unwrap();
            store.put_linked_record(&edge, "node", Some(id(n))).unwrap();
            edges.push(RangeEdge::new(edge, format!("c-{}", n)));
        }
        store
            .add_range_items(&conn, &[Call::new("first", 3)], edges, &PageInfo::default())
            .unwrap();

        let query = node(vec![Field::connection(
            "friends",
            vec![
                Field::scalar("count").into(),
                Field::plural(
                    "edges",
                    vec![Field::linked("node", vec![Field::scalar("name").into()]).into()],
                )
                .into(),
                Field::linked("pageInfo", vec![Field::scalar("hasNextPage").into()]).into(),
            ],
        )
        .with_call("first", 2)
        .into()]);
        let res = read_query(&store, &query, &id("1")).unwrap();
        assert!(!res.missing);
        assert_eq!(
            res.data.unwrap().to_json(),
            json!({"friends": {
                "count": 3,
                "edges": [{"node": {"name": "a"}}, {"node": {"name": "b"}}],
                "pageInfo": {"hasNextPage": true}
            }})
        );
        assert!(res.observed.contains(&conn));
    }
}
