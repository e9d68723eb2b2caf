//! Fragment composition.
//!
//! Named fragments may spread other fragments. The registry expands every
//! spread into a flat [`QueryNode`] tree and rejects compositions that
//! refer back to themselves, so no cycle survives into the query tree.

use super::node::{Field, Fragment, InlineFragment, QueryNode, Root};
use crate::error::{CacheError, Result};
use std::collections::HashMap;

/// A selection before fragment spreads are expanded.
#[derive(Clone, Debug)]
pub enum Selection {
    /// An already flat subtree.
    Node(QueryNode),
    /// A field whose children are given as selections (its own children are ignored).
    Field { field: Field, selections: Vec<Selection> },
    /// `...Name`
    Spread(String),
    /// `... on Type { ... }`
    Inline {
        type_condition: String,
        is_abstract: bool,
        selections: Vec<Selection>,
    },
}

impl Selection {
    pub fn field(field: Field, selections: Vec<Selection>) -> Self {
        Selection::Field { field, selections }
    }

    pub fn spread(name: impl Into<String>) -> Self {
        Selection::Spread(name.into())
    }
}

impl From<QueryNode> for Selection {
    fn from(node: QueryNode) -> Self {
        Selection::Node(node)
    }
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Selection::Node(field.into())
    }
}

#[derive(Clone, Debug)]
struct FragmentDefinition {
    type_condition: String,
    is_abstract: bool,
    selections: Vec<Selection>,
}

/// Named fragment definitions.
#[derive(Debug, Default)]
pub struct FragmentRegistry {
    definitions: HashMap<String, FragmentDefinition>,
}

impl FragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a fragment on a concrete type.
    pub fn define(
        &mut self,
        name: impl Into<String>,
        type_condition: impl Into<String>,
        selections: Vec<Selection>,
    ) -> Result<()> {
        self.insert(name.into(), type_condition.into(), false, selections)
    }

    /// Define a fragment on an interface or union.
    pub fn define_abstract(
        &mut self,
        name: impl Into<String>,
        type_condition: impl Into<String>,
        selections: Vec<Selection>,
    ) -> Result<()> {
        self.insert(name.into(), type_condition.into(), true, selections)
    }

    fn insert(
        &mut self,
        name: String,
        type_condition: String,
        is_abstract: bool,
        selections: Vec<Selection>,
    ) -> Result<()> {
        if self.definitions.contains_key(&name) {
            return Err(CacheError::MalformedQuery(format!(
                "fragment `{}` defined twice",
                name
            )));
        }
        self.definitions.insert(
            name,
            FragmentDefinition {
                type_condition,
                is_abstract,
                selections,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Check every definition for cycles and unknown spreads.
    pub fn check(&self) -> Result<()> {
        let mut expanded = HashMap::new();
        let mut names: Vec<&String> = self.definitions.keys().collect();
        names.sort();
        for name in names {
            self.expand_named(name, &mut Vec::new(), &mut expanded)?;
        }
        Ok(())
    }

    /// Expand a single fragment into a flat [`Fragment`] node.
    pub fn expand(&self, name: &str) -> Result<QueryNode> {
        self.expand_named(name, &mut Vec::new(), &mut HashMap::new())
    }

    /// Build a validated root query from selections.
    pub fn build(&self, root: Root, selections: Vec<Selection>) -> Result<QueryNode> {
        let mut expanded = HashMap::new();
        let children = self.expand_selections(&selections, &mut Vec::new(), &mut expanded)?;
        let query = QueryNode::Root(root.with_children(children));
        query.validate()?;
        Ok(query)
    }

    fn expand_named(
        &self,
        name: &str,
        stack: &mut Vec<String>,
        expanded: &mut HashMap<String, QueryNode>,
    ) -> Result<QueryNode> {
        if let Some(node) = expanded.get(name) {
            return Ok(node.clone());
        }
        if stack.iter().any(|n| n == name) {
            let mut path = stack.clone();
            path.push(name.to_string());
            return Err(CacheError::MalformedQuery(format!(
                "fragment cycle: {}",
                path.join(" -> ")
            )));
        }
        let definition = self.definitions.get(name).ok_or_else(|| {
            CacheError::MalformedQuery(format!("unknown fragment `{}`", name))
        })?;

        stack.push(name.to_string());
        let children = self.expand_selections(&definition.selections, stack, expanded)?;
        stack.pop();

        let mut fragment = Fragment::new(name, definition.type_condition.clone(), children);
        fragment.is_abstract = definition.is_abstract;
        let node = QueryNode::Fragment(fragment);
        expanded.insert(name.to_string(), node.clone());
        Ok(node)
    }

    fn expand_selections(
        &self,
        selections: &[Selection],
        stack: &mut Vec<String>,
        expanded: &mut HashMap<String, QueryNode>,
    ) -> Result<Vec<QueryNode>> {
        let mut nodes = Vec::with_capacity(selections.len());
        for selection in selections {
            let node = match selection {
                Selection::Node(node) => node.clone(),
                Selection::Field { field, selections } => {
                    let children = self.expand_selections(selections, stack, expanded)?;
                    QueryNode::Field(field.clone()).with_children(children)
                }
                Selection::Spread(name) => self.expand_named(name, stack, expanded)?,
                Selection::Inline {
                    type_condition,
                    is_abstract,
                    selections,
                } => {
                    let children = self.expand_selections(selections, stack, expanded)?;
                    let mut inline = InlineFragment::new(type_condition.clone(), children);
                    inline.is_abstract = *is_abstract;
                    QueryNode::InlineFragment(inline)
                }
            };
            nodes.push(node);
        }
        Ok(nodes)
    }
}
