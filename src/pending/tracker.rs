//! Deduplication and dependency tracking for in-flight fetches.

use super::fetch::{FetchHandle, FetchOutcome, FetchState, PendingFetch};
use super::offsets::resolve_edge_offsets;
use super::transport::{FetchRequest, Transport};
use crate::error::{CacheError, FetchError, Result};
use crate::query::{subtract_query, QueryNode};
use crate::records::RecordStore;
use crate::types::{DataId, FetchId};
use crossbeam_channel::bounded;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Outstanding fetches and the dependency graph between them.
///
/// A new query is reduced by every outstanding fetch on the same root call;
/// each fetch that took something away becomes a dependency. A fetch
/// resolves only after its own response (if it needed one) and all of its
/// dependencies have resolved.
#[derive(Default)]
pub struct PendingQueryTracker {
    fetches: BTreeMap<FetchId, PendingFetch>,
    next_id: u64,
    finished: Vec<FetchId>,
}

impl PendingQueryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_id(&mut self) -> FetchId {
        self.next_id += 1;
        FetchId(self.next_id)
    }

    /// Track a fetch of `query` and send whatever outstanding fetches do not cover.
    ///
    /// `query` must already be reduced against the store.
    pub fn add(
        &mut self,
        query: QueryNode,
        retained: DataId,
        transport: &mut dyn Transport,
    ) -> Result<FetchHandle> {
        let root = query.expect_root()?;
        let root_key = root.storage_key();
        let variables = root.variables.clone();
        let id = self.allocate_id();
        let fingerprint = query.fingerprint();

        let mut dependencies = BTreeSet::new();
        let mut request = Some(query.clone());

        let duplicate = self
            .fetches
            .values()
            .find(|f| f.is_outstanding() && f.query.fingerprint() == fingerprint);
        if let Some(existing) = duplicate {
            dependencies.insert(existing.id);
            request = None;
        } else {
            for other in self.fetches.values().filter(|f| f.is_outstanding() && f.root_key == root_key) {
                let (Some(current), Some(theirs)) = (&request, &other.request) else {
                    continue;
                };
                let rest = subtract_query(current, theirs);
                if rest.as_ref() != Some(current) {
                    dependencies.insert(other.id);
                    request = rest;
                }
                if request.is_none() {
                    break;
                }
            }
        }

        let state = match &request {
            None => FetchState::Fetched,
            Some(q) if q.contains_edge_offsets() => FetchState::Blocked,
            Some(q) => {
                tracing::debug!(fetch = id.0, query = %q, "sending fetch");
                transport.send(FetchRequest {
                    id,
                    query: q.clone(),
                    variables,
                });
                FetchState::Fetching
            }
        };
        if !dependencies.is_empty() {
            tracing::debug!(fetch = id.0, ?dependencies, ?state, "fetch shares outstanding requests");
        }

        for dep in &dependencies {
            if let Some(other) = self.fetches.get_mut(dep) {
                other.dependents.insert(id);
            }
        }
        let (sender, receiver) = bounded(1);
        self.fetches.insert(
            id,
            PendingFetch {
                id,
                root_key,
                retained,
                query,
                request,
                dependencies,
                dependents: BTreeSet::new(),
                state,
                payload: None,
                sender,
            },
        );
        Ok(FetchHandle::new(id, receiver))
    }

    /// A handle that is already resolved, for queries the store fully answers.
    pub(crate) fn resolved_handle(&mut self, root_id: Option<DataId>) -> FetchHandle {
        let id = self.allocate_id();
        let (sender, receiver) = bounded(1);
        let _ = sender.try_send(FetchOutcome::Resolved { root_id });
        FetchHandle::new(id, receiver)
    }

    pub fn state(&self, id: FetchId) -> Option<FetchState> {
        self.fetches.get(&id).map(|f| f.state)
    }

    /// Query sent for `id`, with placeholders already resolved.
    pub fn request(&self, id: FetchId) -> Option<&QueryNode> {
        self.fetches.get(&id).and_then(|f| f.request.as_ref())
    }

    /// Number of fetches not yet finished.
    pub fn outstanding(&self) -> usize {
        self.fetches.values().filter(|f| f.is_outstanding()).count()
    }

    /// Storage key of the root call `id` fetches.
    pub fn root_key(&self, id: FetchId) -> Option<&str> {
        self.fetches.get(&id).map(|f| f.root_key.as_str())
    }

    fn get_mut(&mut self, id: FetchId) -> Result<&mut PendingFetch> {
        self.fetches.get_mut(&id).ok_or(CacheError::UnknownFetch(id))
    }

    /// Issued once, already finished and drained.
    fn is_retired(&self, id: FetchId) -> bool {
        id.0 > 0 && id.0 <= self.next_id && !self.fetches.contains_key(&id)
    }

    /// Store the server response for `id`.
    ///
    /// Returns `false` if the fetch already finished (e.g. was aborted) and
    /// the response was discarded.
    pub fn record_response(&mut self, id: FetchId, payload: Value) -> Result<bool> {
        if self.is_retired(id) {
            tracing::debug!(fetch = id.0, "response for drained fetch discarded");
            return Ok(false);
        }
        let fetch = self.get_mut(id)?;
        match fetch.state {
            FetchState::Fetching => {
                fetch.state = FetchState::Fetched;
                fetch.payload = Some(payload);
                Ok(true)
            }
            state if state.is_terminal() => {
                tracing::debug!(fetch = id.0, ?state, "late response discarded");
                Ok(false)
            }
            state => Err(CacheError::inconsistent(format!(
                "response for fetch {} in state {:?}",
                id, state
            ))),
        }
    }

    /// A fetched fetch whose dependencies have all resolved, oldest first.
    pub fn next_ready(&self) -> Option<FetchId> {
        self.fetches
            .values()
            .find(|f| f.state == FetchState::Fetched && self.dependencies_resolved(f))
            .map(|f| f.id)
    }

    fn dependencies_resolved(&self, fetch: &PendingFetch) -> bool {
        fetch
            .dependencies
            .iter()
            .all(|d| self.fetches.get(d).map_or(true, |f| f.state == FetchState::Resolved))
    }

    /// Take the stored response of `id` together with the query it answers.
    pub fn take_payload(&mut self, id: FetchId) -> Result<Option<(QueryNode, Value)>> {
        let fetch = self.get_mut(id)?;
        match (fetch.payload.take(), &fetch.request) {
            (Some(payload), Some(request)) => Ok(Some((request.clone(), payload))),
            _ => Ok(None),
        }
    }

    pub fn mark_resolved(&mut self, id: FetchId, root_id: Option<DataId>) -> Result<()> {
        let fetch = self.get_mut(id)?;
        if fetch.state.is_terminal() {
            return Err(CacheError::inconsistent(format!(
                "resolving fetch {} in terminal state {:?}",
                id, fetch.state
            )));
        }
        fetch.finish(FetchState::Resolved, FetchOutcome::Resolved { root_id });
        tracing::debug!(fetch = id.0, "fetch resolved");
        self.finished.push(id);
        Ok(())
    }

    /// Send blocked fetches whose dependencies have resolved.
    ///
    /// Returns true if any fetch changed state.
    pub fn unblock(&mut self, store: &RecordStore, transport: &mut dyn Transport) -> Result<bool> {
        let ready: Vec<FetchId> = self
            .fetches
            .values()
            .filter(|f| f.state == FetchState::Blocked && self.dependencies_resolved(f))
            .map(|f| f.id)
            .collect();

        for id in &ready {
            let fetch = self.get_mut(*id)?;
            let root_id = store.get_root_call_id(&fetch.root_key).cloned();
            let resolved = match &fetch.request {
                Some(query) => resolve_edge_offsets(query, root_id.as_ref(), store)?,
                None => None,
            };
            fetch.request = resolved;
            match &fetch.request {
                None => fetch.state = FetchState::Fetched,
                Some(query) => {
                    let variables = query.as_root().map(|r| r.variables.clone()).unwrap_or_default();
                    tracing::debug!(fetch = id.0, query = %query, "sending unblocked fetch");
                    transport.send(FetchRequest {
                        id: *id,
                        query: query.clone(),
                        variables,
                    });
                    fetch.state = FetchState::Fetching;
                }
            }
        }
        Ok(!ready.is_empty())
    }

    /// Fail `id` and every fetch that transitively depends on it.
    pub fn reject(&mut self, id: FetchId, error: FetchError) -> Result<()> {
        if self.is_retired(id) {
            return Ok(());
        }
        let fetch = self.get_mut(id)?;
        if fetch.state.is_terminal() {
            return Ok(());
        }
        tracing::debug!(fetch = id.0, %error, "fetch rejected");
        let state = if matches!(error, FetchError::Aborted(_)) {
            FetchState::Aborted
        } else {
            FetchState::Rejected
        };
        let reason = error.to_string();
        fetch.finish(state, FetchOutcome::Rejected(error));
        self.finished.push(id);
        self.reject_dependents(id, &reason);
        Ok(())
    }

    fn reject_dependents(&mut self, failed: FetchId, reason: &str) {
        let mut stack: Vec<FetchId> = self
            .fetches
            .get(&failed)
            .map(|f| f.dependents.iter().copied().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            let Some(fetch) = self.fetches.get_mut(&id) else {
                continue;
            };
            if fetch.state.is_terminal() {
                continue;
            }
            fetch.finish(
                FetchState::Rejected,
                FetchOutcome::Rejected(FetchError::Dependency {
                    dependency: failed,
                    reason: reason.to_string(),
                }),
            );
            tracing::debug!(fetch = id.0, dependency = failed.0, "dependent fetch rejected");
            stack.extend(fetch.dependents.iter().copied());
            self.finished.push(id);
        }
    }

    /// Abort `id`. Its dependents are rejected; nothing is re-issued.
    pub fn abort(&mut self, id: FetchId) -> Result<()> {
        if self.is_retired(id) {
            return Ok(());
        }
        self.get_mut(id)?;
        self.reject(id, FetchError::Aborted(id))
    }

    /// Drain finished fetches, returning the records they kept alive.
    pub fn take_finished(&mut self) -> Vec<DataId> {
        let mut released = Vec::new();
        for id in std::mem::take(&mut self.finished) {
            if let Some(fetch) = self.fetches.remove(&id) {
                released.push(fetch.retained);
            }
        }
        // Removed dependencies count as resolved; dependents of failed ones
        // were rejected with them.
        released
    }
}
