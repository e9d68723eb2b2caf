//! The cache facade tying all components together.

use crate::diff::diff_query;
use crate::error::{FetchError, Result};
use crate::gc::{CollectResult, GarbageCollector};
use crate::pending::{FetchHandle, FetchMode, FetchState, PendingQueryTracker, Transport};
use crate::persist::CacheSnapshot;
use crate::query::{QueryNode, Root};
use crate::records::RecordStore;
use crate::resolver::{resolve_query, Data};
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionManager};
use crate::types::{CacheStats, DataId, FetchId, RecordState, SubscriptionId};
use crate::writer::{root_record_id, write_payload};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;
use std::time::{Duration, Instant};

/// Cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// How long an unreferenced record survives before a sweep evicts it.
    pub gc_grace_period: Duration,

    /// Whether sweeps run automatically after each operation.
    pub gc_enabled: bool,

    /// Max buffered events per subscription.
    pub subscription_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_grace_period: Duration::from_secs(30),
            gc_enabled: true,
            subscription_buffer_size: 1000,
        }
    }
}

/// Everything guarded by the cache lock.
struct CacheState {
    store: RecordStore,
    gc: GarbageCollector,
    tracker: PendingQueryTracker,
    subscriptions: SubscriptionManager,
    transport: Box<dyn Transport>,
}

/// A normalized graph cache.
///
/// Provides a unified interface for:
/// - Diffing queries against cached records
/// - Fetching the missing part, shared with in-flight fetches
/// - Resolving and subscribing to query results
/// - Reference-counted eviction
///
/// All state sits behind one lock held for the duration of each call.
/// Results are delivered over channels, so no caller code runs under it.
pub struct GraphCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl GraphCache {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_config(transport, CacheConfig::default())
    }

    pub fn with_config(transport: impl Transport + 'static, config: CacheConfig) -> Self {
        let state = CacheState {
            store: RecordStore::new(),
            gc: GarbageCollector::new(config.gc_grace_period),
            tracker: PendingQueryTracker::new(),
            subscriptions: SubscriptionManager::new(SubscriptionConfig {
                buffer_size: config.subscription_buffer_size,
            }),
            transport: Box::new(transport),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // --- Reads ---

    /// Record the root call of `root` maps to.
    pub fn root_id(&self, root: &Root) -> DataId {
        root_record_id(root, &self.state.lock().store)
    }

    /// The part of `query` the store cannot answer, or `None` on a full hit.
    pub fn diff(&self, query: &QueryNode, root_id: &DataId) -> Result<Option<QueryNode>> {
        query.validate()?;
        diff_query(query, root_id, &self.state.lock().store)
    }

    /// Read `query` from the store. `None` means some selected data is missing.
    pub fn resolve(&self, query: &QueryNode, root_id: &DataId) -> Result<Option<Data>> {
        query.validate()?;
        resolve_query(&self.state.lock().store, query, root_id)
    }

    pub fn record_state(&self, id: &DataId) -> RecordState {
        self.state.lock().store.get_record_state(id)
    }

    pub fn reference_count(&self, id: &DataId) -> usize {
        self.state.lock().gc.reference_count(id)
    }

    /// Run `f` against the store.
    pub fn read<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        f(&self.state.lock().store)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            records: state.store.len(),
            ranges: state.store.range_count(),
            pending_fetches: state.tracker.outstanding(),
            subscriptions: state.subscriptions.subscription_count(),
            tracked_references: state.gc.tracked(),
        }
    }

    // --- Subscriptions ---

    /// Resolve `query` and push a new result whenever its records change.
    pub fn subscribe(&self, query: &QueryNode, root_id: &DataId) -> Result<SubscriptionHandle> {
        query.validate()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (handle, observed) = state
            .subscriptions
            .subscribe(&state.store, query.clone(), root_id.clone())?;
        for id in &observed {
            state.gc.increment_reference_count(id);
        }
        Ok(handle)
    }

    /// Stop a subscription. Disposing twice is an error.
    pub fn dispose(&self, id: SubscriptionId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let released = state.subscriptions.dispose(id)?;
        let now = Instant::now();
        for data_id in &released {
            state.gc.decrement_reference_count(data_id, now)?;
        }
        tracing::debug!(subscription = id.0, released = released.len(), "subscription disposed");
        self.settle(state)
    }

    /// Keep `id` alive regardless of subscriptions.
    pub fn retain(&self, id: &DataId) {
        self.state.lock().gc.increment_reference_count(id);
    }

    /// Undo one [`GraphCache::retain`].
    pub fn release(&self, id: &DataId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.gc.decrement_reference_count(id, Instant::now())?;
        self.settle(state)
    }

    // --- Fetching ---

    /// Fetch `query`, requesting only what neither the store nor an
    /// outstanding fetch provides.
    ///
    /// The handle resolves once the data is in the store.
    pub fn fetch(&self, query: &QueryNode, mode: FetchMode) -> Result<FetchHandle> {
        query.validate()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let root_id = root_record_id(query.expect_root()?, &state.store);

        let wanted = match mode {
            FetchMode::CacheFirst => match diff_query(query, &root_id, &state.store)? {
                Some(rest) => rest,
                None => {
                    tracing::debug!(root = %root_id, "fetch served from cache");
                    return Ok(state.tracker.resolved_handle(Some(root_id)));
                }
            },
            FetchMode::Refetch => query.clone(),
        };

        state.gc.increment_reference_count(&root_id);
        match state.tracker.add(wanted, root_id.clone(), state.transport.as_mut()) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                state.gc.decrement_reference_count(&root_id, Instant::now())?;
                Err(e)
            }
        }
    }

    pub fn fetch_state(&self, id: FetchId) -> Option<FetchState> {
        self.state.lock().tracker.state(id)
    }

    /// Report the transport's answer for fetch `id`.
    ///
    /// `response` holds the value of the root field. A payload that does not
    /// match the query rejects the fetch and its dependents; nothing from it
    /// is written.
    pub fn complete_fetch(&self, id: FetchId, response: std::result::Result<Value, FetchError>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match response {
            Ok(payload) => {
                if state.tracker.state(id) == Some(FetchState::Fetching) {
                    if let Some(request) = state.tracker.request(id) {
                        if let Err(e) = write_payload(&state.store, request, &payload) {
                            tracing::warn!(fetch = id.0, error = %e, "payload rejected");
                            state.tracker.reject(id, FetchError::InvalidPayload(e.to_string()))?;
                            self.drain(state)?;
                            self.settle(state)?;
                            return Err(e);
                        }
                    }
                }
                state.tracker.record_response(id, payload)?;
            }
            Err(error) => state.tracker.reject(id, error)?,
        }
        self.drain(state)?;
        self.settle(state)
    }

    /// Abort fetch `id`. Dependents are rejected, not re-issued.
    pub fn abort(&self, id: FetchId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.tracker.abort(id)?;
        self.drain(state)?;
        self.settle(state)
    }

    /// Write resolvable payloads in dependency order and send unblocked fetches.
    fn drain(&self, state: &mut CacheState) -> Result<()> {
        loop {
            while let Some(id) = state.tracker.next_ready() {
                let root_id = match state.tracker.take_payload(id)? {
                    Some((request, payload)) => match write_payload(&state.store, &request, &payload) {
                        Ok(batch) => {
                            let root_id = batch.root_id.clone();
                            tracing::trace!(fetch = id.0, mutations = batch.len(), "applying payload");
                            batch.apply(&mut state.store)?;
                            root_id
                        }
                        Err(e) => {
                            state.tracker.reject(id, FetchError::InvalidPayload(e.to_string()))?;
                            continue;
                        }
                    },
                    None => state
                        .tracker
                        .root_key(id)
                        .and_then(|key| state.store.get_root_call_id(key))
                        .cloned(),
                };
                state.tracker.mark_resolved(id, root_id)?;
            }
            if !state.tracker.unblock(&state.store, state.transport.as_mut())? {
                return Ok(());
            }
        }
    }

    // --- Writes ---

    /// Store `payload` as the result of `query` without a fetch.
    ///
    /// Returns the record the root call resolved to.
    pub fn write_payload(&self, query: &QueryNode, payload: &Value) -> Result<Option<DataId>> {
        query.validate()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let batch = write_payload(&state.store, query, payload)?;
        let root_id = batch.root_id.clone();
        batch.apply(&mut state.store)?;
        self.settle(state)?;
        Ok(root_id)
    }

    /// Mutate the store directly. Subscribers are notified afterwards.
    pub fn write<R>(&self, f: impl FnOnce(&mut RecordStore) -> Result<R>) -> Result<R> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let result = f(&mut state.store);
        self.settle(state)?;
        result
    }

    // --- Garbage collection ---

    pub fn collect_garbage(&self) -> Result<CollectResult> {
        self.collect_garbage_at(Instant::now())
    }

    /// Sweep as if the clock read `now`.
    pub fn collect_garbage_at(&self, now: Instant) -> Result<CollectResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let result = state.gc.collect(&mut state.store, now)?;
        Self::flush(state, now)?;
        Ok(result)
    }

    /// Evict every unreferenced record, ignoring the grace period.
    pub fn collect_garbage_now(&self) -> Result<CollectResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();
        Self::flush(state, now)?;
        let result = state.gc.collect_now(&mut state.store, now)?;
        Self::flush(state, now)?;
        Ok(result)
    }

    // --- Persistence ---

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot::capture(&self.state.lock().store)
    }

    /// Load `snapshot` into the store. Restored records start unreferenced.
    pub fn restore(&self, snapshot: &CacheSnapshot) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        snapshot.replay(&mut state.store)?;
        self.settle(state)
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        self.snapshot().write_to(path)
    }

    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = CacheSnapshot::read_from(path)?;
        self.restore(&snapshot)
    }

    // --- Internal ---

    /// Push store changes to the collector and to subscriptions.
    fn flush(state: &mut CacheState, now: Instant) -> Result<()> {
        let changed = state.store.take_changes();
        for id in &changed {
            if state.store.get_record_state(id) != RecordState::Unknown {
                state.gc.register(id, now);
            }
        }
        state.gc.apply_membership(state.store.take_membership(), now)?;
        if changed.is_empty() {
            return Ok(());
        }

        let delta = state.subscriptions.notify(&changed, &state.store)?;
        for id in &delta.retained {
            state.gc.increment_reference_count(id);
        }
        for id in &delta.released {
            state.gc.decrement_reference_count(id, now)?;
        }
        Ok(())
    }

    /// Flush, release finished fetches and sweep until nothing changes.
    fn settle(&self, state: &mut CacheState) -> Result<()> {
        loop {
            let now = Instant::now();
            Self::flush(state, now)?;
            for id in state.tracker.take_finished() {
                state.gc.decrement_reference_count(&id, now)?;
            }
            if !self.config.gc_enabled {
                return Ok(());
            }
            if state.gc.collect(&mut state.store, now)?.evicted.is_empty() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{ChannelTransport, FetchOutcome, FetchRequest};
    use crate::query::Field;
    use crate::subscriptions::SubscriptionEvent;
    use crossbeam_channel::Receiver;
    use serde_json::json;

    fn cache() -> (GraphCache, Receiver<FetchRequest>) {
        let (transport, requests) = ChannelTransport::new();
        (GraphCache::new(transport), requests)
    }

    fn user(fields: &[&str]) -> QueryNode {
        Root::new("node")
            .with_call("id", "1")
            .with_children(fields.iter().map(|f| Field::scalar(*f).into()).collect())
            .into()
    }

    #[test]
    fn test_fetch_writes_and_resolves() {
        let (cache, requests) = cache();
        let handle = cache.fetch(&user(&["name"]), FetchMode::CacheFirst).unwrap();
        let request = requests.try_recv().unwrap();
        assert_eq!(request.id, handle.id);
        assert_eq!(cache.fetch_state(handle.id), Some(FetchState::Fetching));

        cache
            .complete_fetch(handle.id, Ok(json!({"id": "1", "name": "Zuck"})))
            .unwrap();
        assert_eq!(
            handle.try_recv().unwrap(),
            FetchOutcome::Resolved {
                root_id: Some(DataId::new("1"))
            }
        );
        assert_eq!(cache.diff(&user(&["name"]), &DataId::new("1")).unwrap(), None);
        assert_eq!(cache.stats().pending_fetches, 0);
        assert_eq!(cache.reference_count(&DataId::new("1")), 0);
    }

    #[test]
    fn test_cache_hit_sends_nothing() {
        let (cache, requests) = cache();
        cache
            .write_payload(&user(&["name"]), &json!({"id": "1", "name": "Zuck"}))
            .unwrap();
        let handle = cache.fetch(&user(&["name"]), FetchMode::CacheFirst).unwrap();
        assert!(requests.try_recv().is_err());
        assert!(matches!(handle.try_recv().unwrap(), FetchOutcome::Resolved { .. }));

        cache.fetch(&user(&["name"]), FetchMode::Refetch).unwrap();
        assert!(requests.try_recv().is_ok());
    }

    #[test]
    fn test_partially_cached_query_does_not_resolve() {
        let (cache, _requests) = cache();
        let root = DataId::new("1");
        cache
            .write_payload(&user(&["name"]), &json!({"id": "1", "name": "Zuck"}))
            .unwrap();

        assert!(cache.resolve(&user(&["name", "birthday"]), &root).unwrap().is_none());
        let handle = cache.subscribe(&user(&["name", "birthday"]), &root).unwrap();
        assert!(handle.initial.is_none());

        cache
            .write_payload(&user(&["birthday"]), &json!({"id": "1", "birthday": "1984-05-14"}))
            .unwrap();
        match handle.try_recv().unwrap() {
            SubscriptionEvent::Updated { data } => assert_eq!(
                data.unwrap().to_json(),
                json!({"name": "Zuck", "birthday": "1984-05-14"})
            ),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(cache.resolve(&user(&["name", "birthday"]), &root).unwrap().is_some());
    }

    #[test]
    fn test_null_root_without_id_is_not_refetched() {
        let (cache, requests) = cache();
        let viewer: QueryNode = Root::new("viewer")
            .with_children(vec![Field::scalar("name").into()])
            .into();
        let handle = cache.fetch(&viewer, FetchMode::CacheFirst).unwrap();
        requests.try_recv().unwrap();
        cache.complete_fetch(handle.id, Ok(Value::Null)).unwrap();
        assert!(matches!(handle.try_recv().unwrap(), FetchOutcome::Resolved { .. }));

        let again = cache.fetch(&viewer, FetchMode::CacheFirst).unwrap();
        assert!(requests.try_recv().is_err());
        assert!(matches!(again.try_recv().unwrap(), FetchOutcome::Resolved { .. }));

        let root_id = cache.root_id(viewer.as_root().unwrap());
        assert_eq!(cache.record_state(&root_id), RecordState::Nonexistent);
        assert_eq!(cache.resolve(&viewer, &root_id).unwrap(), Some(Data::Null));
    }

    #[test]
    fn test_subscription_keeps_records_alive() {
        let (transport, _requests) = ChannelTransport::new();
        let cache = GraphCache::with_config(
            transport,
            CacheConfig {
                gc_grace_period: Duration::ZERO,
                gc_enabled: false,
                ..Default::default()
            },
        );
        let query = user(&["name"]);
        let root = DataId::new("1");
        cache.write_payload(&query, &json!({"id": "1", "name": "Zuck"})).unwrap();
        let handle = cache.subscribe(&query, &root).unwrap();
        assert_eq!(cache.reference_count(&root), 1);

        cache.write(|store| store.put_field(&root, "name", json!("Mark"))).unwrap();
        assert!(matches!(handle.try_recv().unwrap(), SubscriptionEvent::Updated { .. }));

        assert!(cache.collect_garbage().unwrap().evicted.is_empty());
        assert_eq!(cache.record_state(&root), RecordState::Existent);

        cache.dispose(handle.id).unwrap();
        assert_eq!(cache.collect_garbage().unwrap().evicted, vec![root.clone()]);
        assert_eq!(cache.record_state(&root), RecordState::Unknown);
        assert!(cache.dispose(handle.id).is_err());
    }

    #[test]
    fn test_transport_error_rejects() {
        let (cache, _requests) = cache();
        let handle = cache.fetch(&user(&["name"]), FetchMode::CacheFirst).unwrap();
        cache
            .complete_fetch(handle.id, Err(FetchError::Transport("offline".into())))
            .unwrap();
        assert_eq!(
            handle.try_recv().unwrap(),
            FetchOutcome::Rejected(FetchError::Transport("offline".into()))
        );
        assert_eq!(cache.fetch_state(handle.id), None);
    }
}
