//! Normalized record storage.

use crate::error::{CacheError, Result};
use crate::query::Call;
use crate::range::{PageInfo, Range, RangeEdge, RangeInfo, RangeUpdate};
use crate::types::{DataId, FieldRead, FieldValue, Record, RecordState};
use std::collections::{HashMap, HashSet};

/// A range gained or lost an edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    Retained(DataId),
    Released(DataId),
}

/// Map from [`DataId`] to record, plus connection ranges and root calls.
///
/// A missing entry is `Unknown`; an entry holding `None` is `Nonexistent`.
/// Mutations that change anything add the id to a change set, drained by
/// [`RecordStore::take_changes`] once per write batch.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<DataId, Option<Record>>,
    ranges: HashMap<DataId, Range>,
    root_calls: HashMap<String, DataId>,
    changed: Vec<DataId>,
    changed_set: HashSet<DataId>,
    membership: Vec<MembershipChange>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Reads ---

    pub fn get_record_state(&self, id: &DataId) -> RecordState {
        match self.records.get(id) {
            None => RecordState::Unknown,
            Some(None) => RecordState::Nonexistent,
            Some(Some(_)) => RecordState::Existent,
        }
    }

    pub fn get_record(&self, id: &DataId) -> Option<&Record> {
        self.records.get(id).and_then(Option::as_ref)
    }

    /// The record's `__typename`, if known.
    pub fn get_type(&self, id: &DataId) -> Option<&str> {
        self.get_record(id).and_then(|r| r.typename.as_deref())
    }

    fn read(&self, id: &DataId, key: &str) -> Option<&FieldValue> {
        self.get_record(id).and_then(|r| r.fields.get(key))
    }

    /// Read a scalar field.
    ///
    /// `__typename` comes from the record type and `id` from the record's
    /// own identifier, so neither has to be stored as a field.
    pub fn get_field(&self, id: &DataId, key: &str) -> FieldRead<serde_json::Value> {
        let record = match self.get_record(id) {
            Some(record) => record,
            None => return FieldRead::Unknown,
        };
        match key {
            "__typename" => {
                if let Some(t) = &record.typename {
                    return FieldRead::Value(serde_json::Value::String(t.clone()));
                }
            }
            "id" if !id.is_client_generated() => {
                return FieldRead::Value(serde_json::Value::String(id.0.clone()));
            }
            _ => {}
        }
        match record.fields.get(key) {
            None if key == "id" => FieldRead::Null,
            None => FieldRead::Unknown,
            Some(FieldValue::Null) => FieldRead::Null,
            Some(FieldValue::Scalar(v)) => FieldRead::Value(v.clone()),
            Some(FieldValue::Link(_)) | Some(FieldValue::Links(_)) => FieldRead::Unknown,
        }
    }

    pub fn get_linked_record_id(&self, id: &DataId, key: &str) -> FieldRead<DataId> {
        match self.read(id, key) {
            Some(FieldValue::Link(target)) => FieldRead::Value(target.clone()),
            Some(FieldValue::Null) => FieldRead::Null,
            _ => FieldRead::Unknown,
        }
    }

    pub fn get_linked_record_ids(&self, id: &DataId, key: &str) -> FieldRead<Vec<DataId>> {
        match self.read(id, key) {
            Some(FieldValue::Links(targets)) => FieldRead::Value(targets.clone()),
            Some(FieldValue::Null) => FieldRead::Null,
            _ => FieldRead::Unknown,
        }
    }

    pub fn range(&self, id: &DataId) -> Option<&Range> {
        self.ranges.get(id)
    }

    /// What the connection `id` can serve for `calls`.
    ///
    /// A connection without a range covers nothing.
    pub fn range_info(&self, id: &DataId, calls: &[Call]) -> Result<RangeInfo> {
        match self.ranges.get(id) {
            Some(range) => range.retrieve(calls),
            None => Range::default().retrieve(calls),
        }
    }

    pub fn get_root_call_id(&self, storage_key: &str) -> Option<&DataId> {
        self.root_calls.get(storage_key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn record_ids(&self) -> impl Iterator<Item = &DataId> {
        self.records.keys()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&DataId, &Option<Record>)> {
        self.records.iter()
    }

    pub(crate) fn ranges(&self) -> impl Iterator<Item = (&DataId, &Range)> {
        self.ranges.iter()
    }

    pub(crate) fn root_calls(&self) -> impl Iterator<Item = (&String, &DataId)> {
        self.root_calls.iter()
    }

    // --- Writes ---

    fn mark_changed(&mut self, id: &DataId) {
        if self.changed_set.insert(id.clone()) {
            self.changed.push(id.clone());
        }
    }

    fn record_mut(&mut self, id: &DataId) -> Result<&mut Record> {
        match self.records.get_mut(id) {
            Some(Some(record)) => Ok(record),
            _ => Err(CacheError::inconsistent(format!(
                "write to record `{}` which is not in the store",
                id
            ))),
        }
    }

    /// Create the record if needed and set its type.
    pub fn put_record(&mut self, id: &DataId, typename: Option<&str>) {
        let entry = self.records.entry(id.clone()).or_insert(None);
        let mut changed = entry.is_none();
        let record = entry.get_or_insert_with(Record::default);
        if let Some(t) = typename {
            if record.typename.as_deref() != Some(t) {
                record.typename = Some(t.to_string());
                changed = true;
            }
        }
        if changed {
            self.mark_changed(id);
        }
    }

    /// Mark a record as known not to exist.
    pub fn delete_record(&mut self, id: &DataId) {
        if let Some(None) = self.records.get(id) {
            return;
        }
        self.records.insert(id.clone(), None);
        self.drop_range(id);
        self.mark_changed(id);
    }

    /// Forget a record entirely. Its state becomes `Unknown`.
    ///
    /// Returns the edge ids released by the dropped range.
    pub fn evict_record(&mut self, id: &DataId) -> Vec<DataId> {
        let known = self.records.remove(id).is_some();
        let released = self.drop_range(id);
        if known {
            self.mark_changed(id);
        }
        released
    }

    fn drop_range(&mut self, id: &DataId) -> Vec<DataId> {
        let released = self
            .ranges
            .remove(id)
            .map(|range| range.edge_ids())
            .unwrap_or_default();
        for edge in &released {
            self.membership.push(MembershipChange::Released(edge.clone()));
        }
        released
    }

    fn put_value(&mut self, id: &DataId, key: &str, value: FieldValue) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.fields.get(key) == Some(&value) {
            return Ok(());
        }
        record.fields.insert(key.to_string(), value);
        self.mark_changed(id);
        Ok(())
    }

    /// Store a scalar. JSON `null` is stored as a confirmed null.
    pub fn put_field(&mut self, id: &DataId, key: &str, value: serde_json::Value) -> Result<()> {
        let value = match value {
            serde_json::Value::Null => FieldValue::Null,
            other => FieldValue::Scalar(other),
        };
        self.put_value(id, key, value)
    }

    pub fn put_linked_record(&mut self, id: &DataId, key: &str, target: Option<DataId>) -> Result<()> {
        let value = target.map_or(FieldValue::Null, FieldValue::Link);
        self.put_value(id, key, value)
    }

    pub fn put_linked_records(&mut self, id: &DataId, key: &str, targets: Vec<DataId>) -> Result<()> {
        self.put_value(id, key, FieldValue::Links(targets))
    }

    /// Splice a page of edges into the connection `id`.
    pub fn add_range_items(
        &mut self,
        id: &DataId,
        calls: &[Call],
        edges: Vec<RangeEdge>,
        page_info: &PageInfo,
    ) -> Result<RangeUpdate> {
        self.record_mut(id)?;
        let range = self.ranges.entry(id.clone()).or_default();
        let before = range.clone();
        let update = range.add_items(calls, edges, page_info)?;
        let changed = *range != before;

        for edge in &update.added {
            self.membership.push(MembershipChange::Retained(edge.clone()));
        }
        for edge in &update.removed {
            self.membership.push(MembershipChange::Released(edge.clone()));
        }
        if changed {
            tracing::trace!(connection = %id, added = update.added.len(), removed = update.removed.len(), "range updated");
            self.mark_changed(id);
        }
        Ok(update)
    }

    /// Replace a connection's range wholesale (snapshot restore).
    pub fn put_range(&mut self, id: &DataId, range: Range) -> Result<()> {
        self.record_mut(id)?;
        let old = self.ranges.insert(id.clone(), range.clone());
        let old_ids: HashSet<DataId> = old.map(|r| r.edge_ids()).unwrap_or_default().into_iter().collect();
        let new_ids: HashSet<DataId> = range.edge_ids().into_iter().collect();
        for edge in new_ids.difference(&old_ids) {
            self.membership.push(MembershipChange::Retained(edge.clone()));
        }
        for edge in old_ids.difference(&new_ids) {
            self.membership.push(MembershipChange::Released(edge.clone()));
        }
        self.mark_changed(id);
        Ok(())
    }

    pub fn put_root_call_id(&mut self, storage_key: &str, id: &DataId) {
        if self.root_calls.get(storage_key) == Some(id) {
            return;
        }
        self.root_calls.insert(storage_key.to_string(), id.clone());
        self.mark_changed(id);
    }

    /// Drain the ids changed since the last call, in first-change order.
    pub fn take_changes(&mut self) -> Vec<DataId> {
        self.changed_set.clear();
        std::mem::take(&mut self.changed)
    }

    /// Drain range membership changes since the last call.
    pub fn take_membership(&mut self) -> Vec<MembershipChange> {
        std::mem::take(&mut self.membership)
    }
}
