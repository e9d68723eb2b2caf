//! Subscription types for live query results.

use crate::resolver::Data;
use crate::types::SubscriptionId;
use serde::{Deserialize, Serialize};

/// Configuration for subscriptions.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// Events emitted by subscriptions.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    /// The query result changed. `None` means part of it is no longer in the store.
    Updated { data: Option<Data> },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Receiver went away.
    Disconnected,
    /// Explicitly disposed.
    Disposed,
}

/// Handle to a live query.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Result at the time of subscribing, `None` if the store cannot answer it fully.
    pub initial: Option<Data>,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<SubscriptionEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<SubscriptionEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
