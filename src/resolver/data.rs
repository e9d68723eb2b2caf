//! Denormalized results.

use crate::types::DataId;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A tree-shaped read of a query.
///
/// Objects and lists are shared through `Arc`, so an unchanged subtree can
/// be handed out again without copying. See [`recycle`].
#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    Null,
    Scalar(Value),
    Object(Arc<DataObject>),
    List(Arc<Vec<Data>>),
}

/// Fields of a resolved record, in selection order.
#[derive(Clone, Debug, PartialEq)]
pub struct DataObject {
    /// Record the object was read from (`None` for computed objects such as `pageInfo`).
    pub data_id: Option<DataId>,
    pub fields: Vec<(String, Data)>,
}

impl DataObject {
    pub fn get(&self, key: &str) -> Option<&Data> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl Data {
    /// Field `key` of an object.
    pub fn get(&self, key: &str) -> Option<&Data> {
        match self {
            Data::Object(object) => object.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::Scalar(v) => v.as_str(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Data]> {
        match self {
            Data::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&DataObject> {
        match self {
            Data::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null)
    }

    /// Identity comparison: shared subtrees are the same allocation.
    pub fn ptr_eq(&self, other: &Data) -> bool {
        match (self, other) {
            (Data::Null, Data::Null) => true,
            (Data::Scalar(a), Data::Scalar(b)) => a == b,
            (Data::Object(a), Data::Object(b)) => Arc::ptr_eq(a, b),
            (Data::List(a), Data::List(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Plain JSON rendering.
    pub fn to_json(&self) -> Value {
        match self {
            Data::Null => Value::Null,
            Data::Scalar(v) => v.clone(),
            Data::Object(object) => {
                let map: Map<String, Value> = object
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                Value::Object(map)
            }
            Data::List(items) => Value::Array(items.iter().map(Data::to_json).collect()),
        }
    }
}

/// Reuse the parts of `prev` that `next` did not change.
///
/// The result equals `next`; every subtree that is structurally equal to
/// its counterpart in `prev` is `prev`'s allocation. If nothing changed the
/// result is pointer-equal to `prev`.
pub fn recycle(prev: &Data, next: Data) -> Data {
    match (prev, next) {
        (Data::Object(old), Data::Object(new)) => {
            if Arc::ptr_eq(old, &new) {
                return prev.clone();
            }
            let new = Arc::try_unwrap(new).unwrap_or_else(|shared| (*shared).clone());
            let mut unchanged = old.data_id == new.data_id && old.fields.len() == new.fields.len();
            let mut fields = Vec::with_capacity(new.fields.len());
            for (i, (key, value)) in new.fields.into_iter().enumerate() {
                match old.fields.get(i) {
                    Some((old_key, old_value)) if *old_key == key => {
                        let value = recycle(old_value, value);
                        unchanged &= value.ptr_eq(old_value);
                        fields.push((key, value));
                    }
                    _ => {
                        unchanged = false;
                        fields.push((key, value));
                    }
                }
            }
            if unchanged {
                prev.clone()
            } else {
                Data::Object(Arc::new(DataObject {
                    data_id: new.data_id,
                    fields,
                }))
            }
        }
        (Data::List(old), Data::List(new)) => {
            if Arc::ptr_eq(old, &new) {
                return prev.clone();
            }
            let new = Arc::try_unwrap(new).unwrap_or_else(|shared| (*shared).clone());
            let mut unchanged = old.len() == new.len();
            let mut items = Vec::with_capacity(new.len());
            for (i, item) in new.into_iter().enumerate() {
                match old.get(i) {
                    Some(old_item) => {
                        let item = recycle(old_item, item);
                        unchanged &= item.ptr_eq(old_item);
                        items.push(item);
                    }
                    None => {
                        unchanged = false;
                        items.push(item);
                    }
                }
            }
            if unchanged {
                prev.clone()
            } else {
                Data::List(Arc::new(items))
            }
        }
        (old, new) => {
            if *old == new {
                old.clone()
            } else {
                new
            }
        }
    }
}
