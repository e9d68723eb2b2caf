//! Live query subscriptions.
//!
//! A subscription remembers the records its query read. When a write batch
//! changes one of them, the query is resolved again and, if the result
//! differs, an [`SubscriptionEvent::Updated`] is pushed to the handle.
//!
//! Subscriptions support:
//! - Structural sharing between successive results
//! - Bounded buffers with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let handle = cache.subscribe(&query, &DataId::new("4"))?;
//! println!("{:?}", handle.initial);
//!
//! loop {
//!     match handle.recv() {
//!         Ok(SubscriptionEvent::Updated { data }) => println!("now: {:?}", data),
//!         Ok(SubscriptionEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::{ObservedDelta, SubscriptionManager};
pub use types::{DropReason, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle};
