//! # Graph Cache
//!
//! A client-side normalized cache for graph queries. Query results are
//! flattened into records keyed by id, so every view that reads a record
//! sees the same data and only the missing part of a query is fetched.
//!
//! ## Core Concepts
//!
//! - **Records**: Normalized objects with scalar fields and links by id
//! - **Diffing**: Reducing a query to what the store cannot answer
//! - **Ranges**: Cursor-paginated connections with known coverage
//! - **Pending fetches**: In-flight queries shared between callers
//! - **Subscriptions**: Live results pushed when their records change
//!
//! ## Example
//!
//! ```ignore
//! use graphcache::{ChannelTransport, FetchMode, Field, GraphCache, Root};
//!
//! let (transport, requests) = ChannelTransport::new();
//! let cache = GraphCache::new(transport);
//!
//! let query = Root::new("node")
//!     .with_call("id", "4")
//!     .with_children(vec![Field::scalar("name").into()])
//!     .into();
//! let handle = cache.fetch(&query, FetchMode::CacheFirst)?;
//!
//! // A worker answers the request
//! let request = requests.recv()?;
//! cache.complete_fetch(request.id, Ok(json!({"id": "4", "name": "Zuck"})))?;
//!
//! let outcome = handle.recv()?;
//! let data = cache.resolve(&query, &DataId::new("4"))?;
//! ```

pub mod cache;
pub mod diff;
pub mod error;
pub mod gc;
pub mod pending;
pub mod persist;
pub mod query;
pub mod range;
pub mod records;
pub mod resolver;
pub mod subscriptions;
pub mod types;
pub mod writer;

// Re-exports
pub use cache::{CacheConfig, GraphCache};
pub use diff::{diff_query, QueryDiffer};
pub use error::{CacheError, FetchError, Result};
pub use gc::{CollectResult, GarbageCollector};
pub use pending::{
    ChannelTransport, FetchHandle, FetchMode, FetchOutcome, FetchRequest, FetchState,
    PendingQueryTracker, Transport,
};
pub use persist::CacheSnapshot;
pub use query::{
    subtract_query, Call, CallValue, Field, FieldKind, Fragment, FragmentRegistry, InlineFragment,
    QueryNode, Root, Selection,
};
pub use range::{PageInfo, Range, RangeEdge, RangeInfo, RangeUpdate};
pub use records::{MembershipChange, RecordStore};
pub use resolver::{resolve_query, Data, DataObject};
pub use subscriptions::{DropReason, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle};
pub use types::*;
pub use writer::{write_payload, WriteBatch};
