//! Error types for the query cache.

use crate::types::{FetchId, SubscriptionId};
use thiserror::Error;

/// Failure reported by the transport (or derived from one) for a fetch.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Fetch {0} was aborted")]
    Aborted(FetchId),

    #[error("Dependency {dependency} failed: {reason}")]
    Dependency { dependency: FetchId, reason: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Main error type for cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Inconsistent cache state: {0}")]
    InconsistentState(String),

    #[error("Unknown fetch: {0}")]
    UnknownFetch(FetchId),

    #[error("Subscription already disposed: {0:?}")]
    SubscriptionDisposed(SubscriptionId),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl CacheError {
    /// Build an invariant-violation error and log it loudly.
    pub(crate) fn inconsistent(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "cache invariant violated");
        CacheError::InconsistentState(message)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CacheError::Deserialization(e.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
