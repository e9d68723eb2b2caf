//! In-flight fetch records and their completion handles.

use crate::error::FetchError;
use crate::query::QueryNode;
use crate::types::{DataId, FetchId};
use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use std::collections::BTreeSet;

/// How a fetch consults the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Diff against the store first; only the gap is requested.
    #[default]
    CacheFirst,
    /// Request the whole query, still sharing outstanding fetches.
    Refetch,
}

/// Lifecycle of a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchState {
    /// Waiting for dependencies before its request can be built.
    Blocked,
    /// Request sent, no response yet.
    Fetching,
    /// Response received (or none needed), waiting for dependencies.
    Fetched,
    Resolved,
    Rejected,
    Aborted,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Resolved | FetchState::Rejected | FetchState::Aborted)
    }
}

/// Final outcome delivered to a [`FetchHandle`].
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    /// Data is in the store. `root_id` is the record the root call resolved to.
    Resolved { root_id: Option<DataId> },
    Rejected(FetchError),
}

/// Handle to wait for a fetch.
pub struct FetchHandle {
    pub id: FetchId,
    receiver: Receiver<FetchOutcome>,
}

impl FetchHandle {
    pub(crate) fn new(id: FetchId, receiver: Receiver<FetchOutcome>) -> Self {
        Self { id, receiver }
    }

    /// Receive the outcome (blocking).
    pub fn recv(&self) -> Result<FetchOutcome, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive the outcome (non-blocking).
    pub fn try_recv(&self) -> Result<FetchOutcome, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<FetchOutcome, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Tracker-side state of one fetch.
pub(crate) struct PendingFetch {
    pub id: FetchId,
    /// Storage key of the root call; fetches only overlap within one key.
    pub root_key: String,
    /// Record kept alive while the fetch is outstanding.
    pub retained: DataId,
    /// Query as requested by the caller.
    pub query: QueryNode,
    /// Query this fetch asks the server for; `None` when dependencies cover it.
    pub request: Option<QueryNode>,
    pub dependencies: BTreeSet<FetchId>,
    pub dependents: BTreeSet<FetchId>,
    pub state: FetchState,
    pub payload: Option<Value>,
    pub sender: Sender<FetchOutcome>,
}

impl PendingFetch {
    pub fn is_outstanding(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Deliver the final outcome. The handle may already be gone.
    pub fn finish(&mut self, state: FetchState, outcome: FetchOutcome) {
        self.state = state;
        self.payload = None;
        let _ = self.sender.try_send(outcome);
    }
}
