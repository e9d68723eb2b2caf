//! In-flight fetch tracking.
//!
//! Outstanding fetches are subtracted from new ones so the same data is
//! never requested twice. A fetch that leans on another waits for it:
//! - Fully covered queries send nothing and resolve with their dependencies
//! - Partially covered queries send only the remainder
//! - Pages that continue an outstanding page stay blocked until that page's
//!   cursors are known
//!
//! Failures propagate to every transitive dependent.

mod fetch;
mod offsets;
mod tracker;
mod transport;

pub use fetch::{FetchHandle, FetchMode, FetchOutcome, FetchState};
pub use offsets::resolve_edge_offsets;
pub use tracker::PendingQueryTracker;
pub use transport::{ChannelTransport, FetchRequest, Transport};
