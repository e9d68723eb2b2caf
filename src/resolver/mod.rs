//! Denormalizing reads.
//!
//! [`read_query`] walks a query against the store and produces a [`Data`]
//! tree along with the records it looked at. Subscriptions use the observed
//! set to decide when to re-read and [`recycle`] to keep unchanged subtrees
//! identical between reads.

mod data;
mod reader;

pub use data::{recycle, Data, DataObject};
pub use reader::{read_query, resolve_query, Resolution};
