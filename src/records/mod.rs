//! Normalized record store.
//!
//! Records are flat field maps keyed by [`DataId`](crate::types::DataId);
//! links between records are stored as ids, never as nested records.

mod store;

pub use store::{MembershipChange, RecordStore};
