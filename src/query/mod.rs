//! Query trees.
//!
//! Queries arrive already parsed: a [`Root`] call with nested [`Field`]s,
//! [`Fragment`]s and [`InlineFragment`]s. This module also provides:
//! - Structural validation (`QueryNode::validate`)
//! - Fragment composition with cycle rejection (`FragmentRegistry`)
//! - Subtraction of one query from another (`subtract_query`)
//!
//! # Example
//!
//! ```ignore
//! let query: QueryNode = Root::new("node")
//!     .with_call("id", "1")
//!     .with_children(vec![Field::scalar("id").into(), Field::scalar("name").into()])
//!     .into();
//! query.validate()?;
//! println!("{}", query); // query { node(id: "1") { id name } }
//! ```

mod compose;
mod node;
mod subtract;

pub use compose::{FragmentRegistry, Selection};
pub(crate) use node::with_connection_essentials;
pub use node::{
    find_call, has_non_identity, is_compatible_type, storage_key, Call, CallValue, Field,
    FieldKind, Fragment, InlineFragment, QueryNode, Root, IDENTITY_FIELDS, RANGE_CALLS,
};
pub use subtract::subtract_query;
