//! The network boundary.

use crate::query::QueryNode;
use crate::types::FetchId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::Value;
use std::collections::BTreeMap;

/// A query ready to go over the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    pub id: FetchId,
    pub query: QueryNode,
    pub variables: BTreeMap<String, Value>,
}

/// Sends requests to a server.
///
/// Called with the cache lock held, so implementations must only enqueue.
/// The response is reported later through `GraphCache::complete_fetch`.
pub trait Transport: Send {
    fn send(&mut self, request: FetchRequest);
}

impl<F> Transport for F
where
    F: FnMut(FetchRequest) + Send,
{
    fn send(&mut self, request: FetchRequest) {
        self(request)
    }
}

/// Transport that hands requests to a worker over a channel.
pub struct ChannelTransport {
    sender: Sender<FetchRequest>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<FetchRequest>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, request: FetchRequest) {
        if self.sender.send(request).is_err() {
            tracing::warn!("transport receiver dropped, request discarded");
        }
    }
}
