//! Incremental validation for interactive edits.
//!
//! `TreeIndex` keeps a node map plus a children index and checks only the
//! invariants a single add/update/remove can break. A rejected mutation leaves
//! the index untouched.

use std::collections::BTreeSet;

use canopy_core::{Node, NodeMap};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{ValidationError, Validator};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeIndexError {
    #[error("node {0} already exists")]
    AlreadyExists(String),
    #[error("node {0} not found")]
    NotFound(String),
    #[error("cannot make {node} a root: {existing} is already the root")]
    RootExists { existing: String, node: String },
    #[error("root node {0} must be a container")]
    RootNotContainer(String),
    #[error("parent {parent} of {node} not found")]
    ParentNotFound { node: String, parent: String },
    #[error("parent {parent} of {node} is not a container")]
    ParentNotContainer { node: String, parent: String },
    #[error("moving {node} under {parent} would create a cycle")]
    WouldCycle { node: String, parent: String },
    #[error("node {node} has children: {}", .children.join(", "))]
    HasChildren { node: String, children: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct TreeIndex {
    nodes: NodeMap,
    children: FxHashMap<String, BTreeSet<String>>,
    root: Option<String>,
    validator: Validator,
}

impl TreeIndex {
    pub fn new(validator: Validator) -> Self {
        Self { validator, ..Self::default() }
    }

    /// Build from an existing map, certifying it with the batch validator first.
    pub fn from_nodes(nodes: NodeMap, validator: Validator) -> Result<Self, ValidationError> {
        validator.validate(&nodes)?;
        let mut idx = Self::new(validator);
        for node in nodes.into_values() {
            idx.insert_unchecked(node);
        }
        Ok(idx)
    }

    pub fn nodes(&self) -> &NodeMap { &self.nodes }

    pub fn into_nodes(self) -> NodeMap { self.nodes }

    pub fn root(&self) -> Option<&str> { self.root.as_deref() }

    pub fn get(&self, name: &str) -> Option<&Node> { self.nodes.get(name) }

    pub fn children(&self, name: &str) -> impl Iterator<Item = &str> {
        self.children.get(name).into_iter().flat_map(|s| s.iter().map(|c| c.as_str()))
    }

    pub fn len(&self) -> usize { self.nodes.len() }

    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    /// Full batch validation over the current contents.
    pub fn validate(&self) -> Result<(), ValidationError> { self.validator.validate(&self.nodes) }

    pub fn add(&mut self, node: Node) -> Result<(), TreeIndexError> {
        if self.nodes.contains_key(&node.name) {
            return Err(TreeIndexError::AlreadyExists(node.name));
        }
        if node.is_root() {
            self.check_root_slot(&node)?;
        } else {
            self.check_parent(&node)?;
        }
        trace!(node = %node.name, parent = %node.parent, "index add");
        self.insert_unchecked(node);
        Ok(())
    }

    pub fn update(&mut self, node: Node) -> Result<(), TreeIndexError> {
        let Some(old) = self.nodes.get(&node.name) else {
            return Err(TreeIndexError::NotFound(node.name));
        };
        if node.is_root() {
            self.check_root_slot(&node)?;
        } else if node.parent != old.parent {
            self.check_parent(&node)?;
            if self.is_descendant(&node.parent, &node.name) {
                return Err(TreeIndexError::WouldCycle { node: node.name, parent: node.parent });
            }
        } else if let Some(p) = self.nodes.get(&node.parent) {
            // parent may have been turned into a leaf since; keep the edge legal
            if !p.container {
                return Err(TreeIndexError::ParentNotContainer { node: node.name, parent: node.parent });
            }
        }
        if !node.container {
            let kids: Vec<String> = self.children(&node.name).map(|s| s.to_string()).collect();
            if !kids.is_empty() {
                return Err(TreeIndexError::HasChildren { node: node.name, children: kids });
            }
        }
        trace!(node = %node.name, parent = %node.parent, "index update");
        self.detach(&node.name);
        self.insert_unchecked(node);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Node, TreeIndexError> {
        if !self.nodes.contains_key(name) {
            return Err(TreeIndexError::NotFound(name.to_string()));
        }
        let kids: Vec<String> = self.children(name).map(|s| s.to_string()).collect();
        if !kids.is_empty() {
            return Err(TreeIndexError::HasChildren { node: name.to_string(), children: kids });
        }
        trace!(node = %name, "index remove");
        self.detach(name).ok_or_else(|| TreeIndexError::NotFound(name.to_string()))
    }

    fn check_root_slot(&self, node: &Node) -> Result<(), TreeIndexError> {
        if let Some(existing) = self.root.as_deref() {
            if existing != node.name {
                return Err(TreeIndexError::RootExists { existing: existing.to_string(), node: node.name.clone() });
            }
        }
        if !node.container {
            return Err(TreeIndexError::RootNotContainer(node.name.clone()));
        }
        Ok(())
    }

    fn check_parent(&self, node: &Node) -> Result<(), TreeIndexError> {
        if node.parent == node.name {
            return Err(TreeIndexError::WouldCycle { node: node.name.clone(), parent: node.parent.clone() });
        }
        match self.nodes.get(&node.parent) {
            None => Err(TreeIndexError::ParentNotFound { node: node.name.clone(), parent: node.parent.clone() }),
            Some(p) if !p.container => {
                Err(TreeIndexError::ParentNotContainer { node: node.name.clone(), parent: node.parent.clone() })
            }
            Some(_) => Ok(()),
        }
    }

    /// True when `candidate` sits somewhere below `ancestor`.
    fn is_descendant(&self, candidate: &str, ancestor: &str) -> bool {
        let mut cur = candidate;
        // bounded by node count in case the index was seeded with bad data
        for _ in 0..=self.nodes.len() {
            let Some(n) = self.nodes.get(cur) else { return false };
            if n.is_root() { return false; }
            if n.parent == ancestor { return true; }
            cur = n.parent.as_str();
        }
        false
    }

    fn insert_unchecked(&mut self, node: Node) {
        if node.is_root() {
            self.root = Some(node.name.clone());
        } else {
            self.children.entry(node.parent.clone()).or_default().insert(node.name.clone());
        }
        self.nodes.insert(node.name.clone(), node);
    }

    fn detach(&mut self, name: &str) -> Option<Node> {
        let node = self.nodes.remove(name)?;
        if node.is_root() {
            self.root = None;
        } else if let Some(set) = self.children.get_mut(&node.parent) {
            set.remove(name);
            if set.is_empty() {
                self.children.remove(&node.parent);
            }
        }
        Some(node)
    }
}
