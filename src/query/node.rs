//! Query tree nodes, calls and structural validation.

use crate::error::{CacheError, Result};
use crate::types::DataId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Arguments that select a slice of a connection rather than a different connection.
pub const RANGE_CALLS: [&str; 4] = ["first", "last", "after", "before"];

/// Field names that identify a record rather than describe it.
pub const IDENTITY_FIELDS: [&str; 2] = ["id", "__typename"];

/// Value of a call (argument).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CallValue {
    Literal(serde_json::Value),
    /// Placeholder cursor: "after the `count`-th edge from the start" (or
    /// "before the `count`-th edge from the end"). Only produced by pending
    /// fetch subtraction and replaced with a real cursor before sending.
    EdgeOffset { count: u64, from_end: bool },
}

impl fmt::Display for CallValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallValue::Literal(value) => write!(f, "{}", value),
            CallValue::EdgeOffset { count, from_end: false } => write!(f, "<edge {}>", count),
            CallValue::EdgeOffset { count, from_end: true } => write!(f, "<edge -{}>", count),
        }
    }
}

/// A named argument on a field or root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub value: CallValue,
}

impl Call {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: CallValue::Literal(value.into()),
        }
    }

    pub fn edge_offset(name: impl Into<String>, count: u64, from_end: bool) -> Self {
        Self {
            name: name.into(),
            value: CallValue::EdgeOffset { count, from_end },
        }
    }

    pub fn is_range_call(&self) -> bool {
        RANGE_CALLS.contains(&self.name.as_str())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match &self.value {
            CallValue::Literal(v) => v.as_u64(),
            CallValue::EdgeOffset { .. } => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            CallValue::Literal(v) => v.as_str(),
            CallValue::EdgeOffset { .. } => None,
        }
    }
}

/// Find a call by name.
pub fn find_call<'a>(calls: &'a [Call], name: &str) -> Option<&'a Call> {
    calls.iter().find(|c| c.name == name)
}

/// Key under which a field is stored on its parent record.
///
/// Arguments are sorted by name so argument order never splits a field in
/// two. Connections pass `skip_range = true` so every page of the same
/// connection lands on one record.
pub fn storage_key(name: &str, calls: &[Call], skip_range: bool) -> String {
    let mut kept: Vec<&Call> = calls
        .iter()
        .filter(|c| !(skip_range && c.is_range_call()))
        .collect();
    if kept.is_empty() {
        return name.to_string();
    }
    kept.sort_by(|a, b| a.name.cmp(&b.name));
    let args: Vec<String> = kept
        .iter()
        .map(|c| format!("{}:{}", c.name, c.value))
        .collect();
    format!("{}{{{}}}", name, args.join(","))
}

/// How a field's value is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Scalar or list of scalars, stored inline.
    Scalar,
    /// Reference to a single record.
    Linked,
    /// Ordered list of record references.
    Plural,
    /// Paginated connection backed by a range.
    Connection,
}

/// The top of a query: a root call and its selections.
#[derive(Clone, Debug, PartialEq)]
pub struct Root {
    /// Operation name, for logs only.
    pub name: String,
    pub field: String,
    pub calls: Vec<Call>,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub children: Vec<QueryNode>,
}

impl Root {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            field: field.into(),
            calls: Vec::new(),
            variables: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_call(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.calls.push(Call::new(name, value));
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_children(mut self, children: Vec<QueryNode>) -> Self {
        self.children = children;
        self
    }

    pub fn storage_key(&self) -> String {
        storage_key(&self.field, &self.calls, false)
    }

    /// The record id named by an `id` argument, if the root call has one.
    pub fn identifying_id(&self) -> Option<DataId> {
        let call = find_call(&self.calls, "id")?;
        match &call.value {
            CallValue::Literal(serde_json::Value::String(s)) => Some(DataId::new(s.clone())),
            CallValue::Literal(serde_json::Value::Number(n)) => Some(DataId::new(n.to_string())),
            _ => None,
        }
    }
}

/// A selected field.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub calls: Vec<Call>,
    pub kind: FieldKind,
    pub children: Vec<QueryNode>,
}

impl Field {
    fn with_kind(name: impl Into<String>, kind: FieldKind, children: Vec<QueryNode>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            calls: Vec::new(),
            kind,
            children,
        }
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        Self::with_kind(name, FieldKind::Scalar, Vec::new())
    }

    pub fn linked(name: impl Into<String>, children: Vec<QueryNode>) -> Self {
        Self::with_kind(name, FieldKind::Linked, children)
    }

    pub fn plural(name: impl Into<String>, children: Vec<QueryNode>) -> Self {
        Self::with_kind(name, FieldKind::Plural, children)
    }

    pub fn connection(name: impl Into<String>, children: Vec<QueryNode>) -> Self {
        Self::with_kind(name, FieldKind::Connection, children)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_call(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.calls.push(Call::new(name, value));
        self
    }

    pub fn with_calls(mut self, calls: Vec<Call>) -> Self {
        self.calls = calls;
        self
    }

    pub fn storage_key(&self) -> String {
        storage_key(&self.name, &self.calls, self.kind == FieldKind::Connection)
    }

    /// Key used in payloads and resolved results.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn is_identity(&self) -> bool {
        self.kind == FieldKind::Scalar
            && self.calls.is_empty()
            && IDENTITY_FIELDS.contains(&self.name.as_str())
    }

    pub fn range_calls(&self) -> Vec<Call> {
        self.calls.iter().filter(|c| c.is_range_call()).cloned().collect()
    }

    pub fn non_range_calls(&self) -> Vec<Call> {
        self.calls.iter().filter(|c| !c.is_range_call()).cloned().collect()
    }
}

/// A named fragment, already flattened into its selections.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub name: String,
    pub type_condition: String,
    pub is_abstract: bool,
    pub children: Vec<QueryNode>,
}

impl Fragment {
    pub fn new(name: impl Into<String>, type_condition: impl Into<String>, children: Vec<QueryNode>) -> Self {
        Self {
            name: name.into(),
            type_condition: type_condition.into(),
            is_abstract: false,
            children,
        }
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

/// An anonymous type-conditioned selection set.
#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragment {
    pub type_condition: String,
    pub is_abstract: bool,
    pub children: Vec<QueryNode>,
}

impl InlineFragment {
    pub fn new(type_condition: impl Into<String>, children: Vec<QueryNode>) -> Self {
        Self {
            type_condition: type_condition.into(),
            is_abstract: false,
            children,
        }
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

/// Whether a fragment on `type_condition` applies to a record of `record_type`.
///
/// Unknown record types and abstract conditions are treated as compatible.
pub fn is_compatible_type(type_condition: &str, is_abstract: bool, record_type: Option<&str>) -> bool {
    is_abstract || record_type.map_or(true, |t| t == type_condition)
}

/// An immutable query tree node.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryNode {
    Root(Root),
    Field(Field),
    Fragment(Fragment),
    InlineFragment(InlineFragment),
}

impl From<Root> for QueryNode {
    fn from(root: Root) -> Self {
        QueryNode::Root(root)
    }
}

impl From<Field> for QueryNode {
    fn from(field: Field) -> Self {
        QueryNode::Field(field)
    }
}

impl From<Fragment> for QueryNode {
    fn from(fragment: Fragment) -> Self {
        QueryNode::Fragment(fragment)
    }
}

impl From<InlineFragment> for QueryNode {
    fn from(fragment: InlineFragment) -> Self {
        QueryNode::InlineFragment(fragment)
    }
}

impl QueryNode {
    pub fn children(&self) -> &[QueryNode] {
        match self {
            QueryNode::Root(n) => &n.children,
            QueryNode::Field(n) => &n.children,
            QueryNode::Fragment(n) => &n.children,
            QueryNode::InlineFragment(n) => &n.children,
        }
    }

    /// Copy of this node with different children.
    pub fn with_children(&self, children: Vec<QueryNode>) -> QueryNode {
        match self {
            QueryNode::Root(n) => QueryNode::Root(Root {
                children,
                ..n.clone_shallow()
            }),
            QueryNode::Field(n) => QueryNode::Field(Field {
                children,
                ..n.clone_shallow()
            }),
            QueryNode::Fragment(n) => QueryNode::Fragment(Fragment {
                name: n.name.clone(),
                type_condition: n.type_condition.clone(),
                is_abstract: n.is_abstract,
                children,
            }),
            QueryNode::InlineFragment(n) => QueryNode::InlineFragment(InlineFragment {
                type_condition: n.type_condition.clone(),
                is_abstract: n.is_abstract,
                children,
            }),
        }
    }

    pub fn as_root(&self) -> Option<&Root> {
        match self {
            QueryNode::Root(root) => Some(root),
            _ => None,
        }
    }

    pub fn as_field(&self) -> Option<&Field> {
        match self {
            QueryNode::Field(field) => Some(field),
            _ => None,
        }
    }

    /// Fail with `MalformedQuery` unless this is a root node.
    pub fn expect_root(&self) -> Result<&Root> {
        self.as_root()
            .ok_or_else(|| CacheError::MalformedQuery("expected a root query node".to_string()))
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, QueryNode::Field(f) if f.is_identity())
    }

    /// True if any unresolved [`CallValue::EdgeOffset`] is present.
    pub fn contains_edge_offsets(&self) -> bool {
        if let QueryNode::Field(field) = self {
            if field
                .calls
                .iter()
                .any(|c| matches!(c.value, CallValue::EdgeOffset { .. }))
            {
                return true;
            }
        }
        self.children().iter().any(|c| c.contains_edge_offsets())
    }

    /// SHA-256 of the printed query and its root variables, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        if let QueryNode::Root(root) = self {
            for (name, value) in &root.variables {
                hasher.update(b"\0$");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.to_string().as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Check structural invariants of the whole tree.
    pub fn validate(&self) -> Result<()> {
        match self {
            QueryNode::Root(root) => {
                if root.field.is_empty() {
                    return Err(CacheError::MalformedQuery("root has no field name".to_string()));
                }
                check_duplicate_calls(&root.field, &root.calls)?;
                validate_children(&root.children)
            }
            _ => Err(CacheError::MalformedQuery(
                "query must start at a root node".to_string(),
            )),
        }
    }
}

/// True if any node (looking through fragments) is a non-identity field.
pub fn has_non_identity(nodes: &[QueryNode]) -> bool {
    nodes.iter().any(|node| match node {
        QueryNode::Field(field) => !field.is_identity(),
        QueryNode::Fragment(_) | QueryNode::InlineFragment(_) => has_non_identity(node.children()),
        QueryNode::Root(_) => true,
    })
}

/// Re-add the selections a connection write cannot do without.
///
/// `remaining` is a pruned copy of a connection's `original` children. Any
/// kept `edges` field regains its `cursor`, and `pageInfo` comes back
/// whenever edges are fetched, so the range can be spliced correctly.
pub(crate) fn with_connection_essentials(original: &[QueryNode], remaining: Vec<QueryNode>) -> Vec<QueryNode> {
    let mut fetches_edges = false;
    let mut out: Vec<QueryNode> = remaining
        .into_iter()
        .map(|node| match node {
            QueryNode::Field(field) if field.name == "edges" => {
                fetches_edges = true;
                let original_cursor = original
                    .iter()
                    .filter_map(QueryNode::as_field)
                    .filter(|f| f.name == "edges")
                    .flat_map(|f| f.children.iter())
                    .find(|c| matches!(c, QueryNode::Field(f) if f.name == "cursor"))
                    .cloned();
                let has_cursor = field
                    .children
                    .iter()
                    .any(|c| matches!(c, QueryNode::Field(f) if f.name == "cursor"));
                let mut field = field;
                if let (false, Some(cursor)) = (has_cursor, original_cursor) {
                    field.children.insert(0, cursor);
                }
                QueryNode::Field(field)
            }
            other => other,
        })
        .collect();

    if fetches_edges {
        let has_page_info = out
            .iter()
            .any(|n| matches!(n, QueryNode::Field(f) if f.name == "pageInfo"));
        if !has_page_info {
            if let Some(page_info) = original
                .iter()
                .find(|n| matches!(n, QueryNode::Field(f) if f.name == "pageInfo"))
            {
                out.push(page_info.clone());
            }
        }
    }
    out
}

fn validate_children(children: &[QueryNode]) -> Result<()> {
    for child in children {
        match child {
            QueryNode::Root(root) => {
                return Err(CacheError::MalformedQuery(format!(
                    "root `{}` nested inside another query",
                    root.field
                )))
            }
            QueryNode::Field(field) => validate_field(field)?,
            QueryNode::Fragment(_) | QueryNode::InlineFragment(_) => {
                validate_children(child.children())?
            }
        }
    }
    Ok(())
}

fn validate_field(field: &Field) -> Result<()> {
    check_duplicate_calls(&field.name, &field.calls)?;
    match field.kind {
        FieldKind::Scalar => {
            if !field.children.is_empty() {
                return Err(CacheError::MalformedQuery(format!(
                    "scalar field `{}` cannot have children",
                    field.name
                )));
            }
        }
        FieldKind::Linked | FieldKind::Plural | FieldKind::Connection => {
            if field.children.is_empty() {
                return Err(CacheError::MalformedQuery(format!(
                    "field `{}` selects no children",
                    field.name
                )));
            }
        }
    }
    if field.kind == FieldKind::Connection {
        validate_range_calls(&field.name, &field.calls)?;
    }
    validate_children(&field.children)
}

fn check_duplicate_calls(name: &str, calls: &[Call]) -> Result<()> {
    for (i, call) in calls.iter().enumerate() {
        if calls[..i]
            .iter()
            .any(|other| other.name == call.name && other.value != call.value)
        {
            return Err(CacheError::MalformedQuery(format!(
                "conflicting values for argument `{}` on `{}`",
                call.name, name
            )));
        }
    }
    Ok(())
}

fn validate_range_calls(name: &str, calls: &[Call]) -> Result<()> {
    let malformed = |msg: &str| Err(CacheError::MalformedQuery(format!("connection `{}`: {}", name, msg)));

    let first = find_call(calls, "first");
    let last = find_call(calls, "last");
    let after = find_call(calls, "after");
    let before = find_call(calls, "before");

    match (first, last) {
        (None, None) => return malformed("requires `first` or `last`"),
        (Some(_), Some(_)) => return malformed("cannot combine `first` and `last`"),
        _ => {}
    }
    if let Some(count) = first.or(last) {
        if count.as_u64().is_none() {
            return malformed("page size must be a non-negative integer");
        }
    }
    if after.is_some() && first.is_none() {
        return malformed("`after` requires `first`");
    }
    if before.is_some() && last.is_none() {
        return malformed("`before` requires `last`");
    }
    Ok(())
}

impl Root {
    fn clone_shallow(&self) -> Root {
        Root {
            name: self.name.clone(),
            field: self.field.clone(),
            calls: self.calls.clone(),
            variables: self.variables.clone(),
            children: Vec::new(),
        }
    }
}

impl Field {
    fn clone_shallow(&self) -> Field {
        Field {
            name: self.name.clone(),
            alias: self.alias.clone(),
            calls: self.calls.clone(),
            kind: self.kind,
            children: Vec::new(),
        }
    }
}

fn write_calls(f: &mut fmt::Formatter<'_>, calls: &[Call]) -> fmt::Result {
    if calls.is_empty() {
        return Ok(());
    }
    write!(f, "(")?;
    for (i, call) in calls.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}: {}", call.name, call.value)?;
    }
    write!(f, ")")
}

fn write_children(f: &mut fmt::Formatter<'_>, children: &[QueryNode]) -> fmt::Result {
    if children.is_empty() {
        return Ok(());
    }
    write!(f, " {{")?;
    for child in children {
        write!(f, " {}", child)?;
    }
    write!(f, " }}")
}

impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryNode::Root(root) => {
                if root.name.is_empty() {
                    write!(f, "query {{ {}", root.field)?;
                } else {
                    write!(f, "query {} {{ {}", root.name, root.field)?;
                }
                write_calls(f, &root.calls)?;
                write_children(f, &root.children)?;
                write!(f, " }}")
            }
            QueryNode::Field(field) => {
                if let Some(alias) = &field.alias {
                    write!(f, "{}: ", alias)?;
                }
                write!(f, "{}", field.name)?;
                write_calls(f, &field.calls)?;
                write_children(f, &field.children)
            }
            QueryNode::Fragment(fragment) => {
                write!(f, "...{} on {}", fragment.name, fragment.type_condition)?;
                write_children(f, &fragment.children)
            }
            QueryNode::InlineFragment(fragment) => {
                write!(f, "... on {}", fragment.type_condition)?;
                write_children(f, &fragment.children)
            }
        }
    }
}
