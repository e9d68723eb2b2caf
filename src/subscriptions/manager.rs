//! Subscription manager for re-resolving live queries.

use crate::error::{CacheError, Result};
use crate::query::QueryNode;
use crate::records::RecordStore;
use crate::resolver::{read_query, recycle, Data};
use crate::types::{DataId, SubscriptionId};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::collections::{BTreeMap, HashSet};

use super::types::{DropReason, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle};

/// Internal subscription state.
struct Subscription {
    query: QueryNode,
    root_id: DataId,
    /// Records read by the last resolution.
    observed: HashSet<DataId>,
    last: Option<Data>,
    sender: Sender<SubscriptionEvent>,
}

/// Reference-count changes caused by subscription activity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedDelta {
    pub retained: Vec<DataId>,
    pub released: Vec<DataId>,
}

impl ObservedDelta {
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty() && self.released.is_empty()
    }
}

/// Tracks live queries and pushes new results when their records change.
///
/// Not synchronized on its own: it lives inside the cache state lock.
pub struct SubscriptionManager {
    config: SubscriptionConfig,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl SubscriptionManager {
    pub fn new(config: SubscriptionConfig) -> Self {
        Self {
            config,
            subscriptions: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Resolve `query` and start watching the records it read.
    ///
    /// Returns the handle and the observed ids, which the caller retains.
    pub fn subscribe(
        &mut self,
        store: &RecordStore,
        query: QueryNode,
        root_id: DataId,
    ) -> Result<(SubscriptionHandle, Vec<DataId>)> {
        let resolution = read_query(store, &query, &root_id)?;
        let observed = resolution.observed.clone();
        let data = resolution.into_complete();
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (sender, receiver) = bounded(self.config.buffer_size);

        let subscription = Subscription {
            query,
            root_id,
            observed: observed.iter().cloned().collect(),
            last: data.clone(),
            sender,
        };
        self.subscriptions.insert(id, subscription);
        tracing::debug!(subscription = id.0, observed = observed.len(), "subscribed");

        let handle = SubscriptionHandle {
            id,
            initial: data,
            receiver,
        };
        Ok((handle, observed))
    }

    /// Stop a subscription. Returns the ids it no longer observes.
    pub fn dispose(&mut self, id: SubscriptionId) -> Result<Vec<DataId>> {
        let sub = self
            .subscriptions
            .remove(&id)
            .ok_or(CacheError::SubscriptionDisposed(id))?;
        // Best effort; the receiver may already be gone.
        let _ = sub.sender.try_send(SubscriptionEvent::Dropped {
            reason: DropReason::Disposed,
        });
        Ok(sub.observed.into_iter().collect())
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Re-resolve every subscription that read one of `changed`.
    ///
    /// Subscribers whose buffer is full or whose receiver is gone are
    /// dropped; their observed ids are released.
    pub fn notify(&mut self, changed: &[DataId], store: &RecordStore) -> Result<ObservedDelta> {
        let mut delta = ObservedDelta::default();
        if changed.is_empty() {
            return Ok(delta);
        }
        let mut to_remove = Vec::new();

        for (id, sub) in self.subscriptions.iter_mut() {
            if !changed.iter().any(|c| sub.observed.contains(c)) {
                continue;
            }
            let resolution = read_query(store, &sub.query, &sub.root_id)?;
            let observed: HashSet<DataId> = resolution.observed.iter().cloned().collect();
            delta
                .retained
                .extend(resolution.observed.iter().filter(|o| !sub.observed.contains(*o)).cloned());
            delta
                .released
                .extend(sub.observed.iter().filter(|o| !observed.contains(*o)).cloned());
            sub.observed = observed;

            let (data, updated) = match (&sub.last, resolution.into_complete()) {
                (Some(prev), Some(next)) => {
                    let data = recycle(prev, next);
                    let updated = !data.ptr_eq(prev);
                    (Some(data), updated)
                }
                (None, None) => (None, false),
                (_, next) => (next, true),
            };
            if !updated {
                continue;
            }
            sub.last = data.clone();
            match sub.sender.try_send(SubscriptionEvent::Updated { data }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => to_remove.push((*id, DropReason::BufferOverflow)),
                Err(TrySendError::Disconnected(_)) => to_remove.push((*id, DropReason::Disconnected)),
            }
        }

        for (id, reason) in to_remove {
            if let Some(sub) = self.subscriptions.remove(&id) {
                tracing::warn!(subscription = id.0, ?reason, "dropping subscriber");
                // Try to notify about the drop (might fail, that's ok)
                let _ = sub.sender.try_send(SubscriptionEvent::Dropped { reason });
                delta.released.extend(sub.observed);
            }
        }
        Ok(delta)
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(SubscriptionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Field, Root};
    use serde_json::json;
    use std::time::Duration;

    fn id(s: &str) -> DataId {
        DataId::new(s)
    }

    fn name_query() -> QueryNode {
        Root::new("node")
            .with_call("id", "1")
            .with_children(vec![Field::scalar("name").into()])
            .into()
    }

    fn store_with_name(name: &str) -> RecordStore {
        let mut store = RecordStore::new();
        store.put_record(&id("1"), Some("User"));
        store.put_field(&id("1"), "name", json!(name)).unwrap();
        store.take_changes();
        store
    }

    #[test]
    fn test_subscribe_dispose() {
        let store = store_with_name("Zuck");
        let mut manager = SubscriptionManager::default();

        let (handle, observed) = manager.subscribe(&store, name_query(), id("1")).unwrap();
        assert_eq!(observed, vec![id("1")]);
        assert_eq!(handle.initial.as_ref().unwrap().to_json(), json!({"name": "Zuck"}));
        assert_eq!(manager.subscription_count(), 1);

        let released = manager.dispose(handle.id).unwrap();
        assert_eq!(released, vec![id("1")]);
        assert_eq!(manager.subscription_count(), 0);
        assert!(matches!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Dropped {
                reason: DropReason::Disposed
            }
        ));
        assert!(matches!(
            manager.dispose(handle.id),
            Err(CacheError::SubscriptionDisposed(_))
        ));
    }

    #[test]
    fn test_update_only_on_change() {
        let mut store = store_with_name("Zuck");
        let mut manager = SubscriptionManager::default();
        let (handle, _) = manager.subscribe(&store, name_query(), id("1")).unwrap();

        store.put_field(&id("1"), "name", json!("Mark")).unwrap();
        let changed = store.take_changes();
        manager.notify(&changed, &store).unwrap();
        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SubscriptionEvent::Updated { data } => {
                assert_eq!(data.unwrap().to_json(), json!({"name": "Mark"}));
            }
            other => panic!("Expected Updated event, got {:?}", other),
        }

        // Same id reported changed, same result: nothing is sent.
        manager.notify(&[id("1")], &store).unwrap();
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_partial_result_is_reported_as_missing() {
        let mut store = store_with_name("Zuck");
        let query: QueryNode = Root::new("node")
            .with_call("id", "1")
            .with_children(vec![Field::scalar("name").into(), Field::scalar("birthday").into()])
            .into();
        let mut manager = SubscriptionManager::default();
        let (handle, observed) = manager.subscribe(&store, query, id("1")).unwrap();
        assert!(handle.initial.is_none());
        assert_eq!(observed, vec![id("1")]);

        // Still partial after an unrelated write: no event.
        store.put_field(&id("1"), "name", json!("Mark")).unwrap();
        let changed = store.take_changes();
        manager.notify(&changed, &store).unwrap();
        assert!(handle.try_recv().is_err());

        store.put_field(&id("1"), "birthday", json!("1984-05-14")).unwrap();
        let changed = store.take_changes();
        manager.notify(&changed, &store).unwrap();
        match handle.try_recv().unwrap() {
            SubscriptionEvent::Updated { data } => {
                assert_eq!(data.unwrap().to_json(), json!({"name": "Mark", "birthday": "1984-05-14"}));
            }
            other => panic!("Expected Updated event, got {:?}", other),
        }
    }

    #[test]
    fn test_unrelated_changes_are_ignored() {
        let store = store_with_name("Zuck");
        let mut manager = SubscriptionManager::default();
        let (handle, _) = manager.subscribe(&store, name_query(), id("1")).unwrap();
        manager.notify(&[id("2")], &store).unwrap();
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let mut store = store_with_name("Zuck");
        let mut manager = SubscriptionManager::new(SubscriptionConfig { buffer_size: 2 });
        let (_handle, _) = manager.subscribe(&store, name_query(), id("1")).unwrap();

        let mut released = Vec::new();
        for i in 0..10 {
            store.put_field(&id("1"), "name", json!(format!("n{}", i))).unwrap();
            let changed = store.take_changes();
            released.extend(manager.notify(&changed, &store).unwrap().released);
        }

        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(released, vec![id("1")]);
    }

    #[test]
    fn test_observed_delta_follows_links() {
        let mut store = store_with_name("Zuck");
        store.put_record(&id("2"), None);
        store.put_record(&id("3"), None);
        store.put_linked_record(&id("1"), "best", Some(id("2"))).unwrap();
        store.take_changes();

        let query: QueryNode = Root::new("node")
            .with_call("id", "1")
            .with_children(vec![Field::linked("best", vec![Field::scalar("id").into()]).into()])
            .into();
        let mut manager = SubscriptionManager::default();
        let (_handle, observed) = manager.subscribe(&store, query, id("1")).unwrap();
        assert_eq!(observed, vec![id("1"), id("2")]);

        store.put_linked_record(&id("1"), "best", Some(id("3"))).unwrap();
        let changed = store.take_changes();
        let delta = manager.notify(&changed, &store).unwrap();
        assert_eq!(delta.retained, vec![id("3")]);
        assert_eq!(delta.released, vec![id("2")]);
    }
}
