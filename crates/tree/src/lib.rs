//! Canopy tree validator.
//!
//! Certifies that a flat `name -> Node` map is a well-formed hierarchy:
//! exactly one root, no parent cycles, every parent present, leaves without
//! children and a container at the root. All violations are collected so the
//! caller gets a complete diagnostic in one pass.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use canopy_core::{children_index, Node, NodeMap};
use rustc_hash::FxHashMap;
use tracing::debug;

mod index;

pub use index::{TreeIndex, TreeIndexError};

/// A single broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    NoRoot,
    MultipleRoots(Vec<String>),
    /// Members of one parent cycle, sorted.
    Cycle(Vec<String>),
    MissingParent { node: String, parent: String },
    LeafHasChildren { node: String, children: Vec<String> },
    RootNotContainer(String),
    /// Childless non-root container rejected by the configured [`LeafRule`].
    ContainerLeaf(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NoRoot => write!(f, "no root node (every node has a parent)"),
            Violation::MultipleRoots(names) => write!(f, "multiple root nodes: {}", names.join(", ")),
            Violation::Cycle(names) => write!(f, "parent cycle: {}", names.join(" -> ")),
            Violation::MissingParent { node, parent } => write!(f, "node {} references missing parent {}", node, parent),
            Violation::LeafHasChildren { node, children } => {
                write!(f, "leaf node {} has children: {}", node, children.join(", "))
            }
            Violation::RootNotContainer(name) => write!(f, "root node {} is not a container", name),
            Violation::ContainerLeaf(name) => write!(f, "container node {} is a leaf holding attached content", name),
        }
    }
}

/// Aggregate validation failure listing every violation found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", render(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn render(violations: &[Violation]) -> String {
    let mut out = format!("invalid policy hierarchy ({} violation(s))", violations.len());
    for v in violations {
        out.push_str("\n  - ");
        out.push_str(&v.to_string());
    }
    out
}

/// Policy for non-root containers that have no children.
#[derive(Clone, Default)]
pub enum LeafRule {
    /// Childless containers are fine.
    #[default]
    Permit,
    /// Every non-root container must have at least one child.
    RequireChildren,
    /// Reject the node when the predicate returns true (it holds attached content).
    Predicate(Arc<dyn Fn(&Node) -> bool + Send + Sync>),
}

impl fmt::Debug for LeafRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafRule::Permit => f.write_str("Permit"),
            LeafRule::RequireChildren => f.write_str("RequireChildren"),
            LeafRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl LeafRule {
    fn rejects(&self, node: &Node) -> bool {
        match self {
            LeafRule::Permit => false,
            LeafRule::RequireChildren => true,
            LeafRule::Predicate(p) => p(node),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    leaf_rule: LeafRule,
}

impl Validator {
    pub fn new() -> Self { Self::default() }

    pub fn with_leaf_rule(mut self, rule: LeafRule) -> Self {
        self.leaf_rule = rule;
        self
    }

    pub fn leaf_rule(&self) -> &LeafRule { &self.leaf_rule }

    pub fn validate(&self, nodes: &NodeMap) -> Result<(), ValidationError> {
        let mut names: Vec<&str> = nodes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();

        let mut violations = Vec::new();
        check_roots(nodes, &names, &mut violations);
        check_cycles(nodes, &names, &mut violations);
        self.check_shape(nodes, &names, &mut violations);

        if violations.is_empty() {
            Ok(())
        } else {
            debug!(count = violations.len(), nodes = nodes.len(), "hierarchy rejected");
            Err(ValidationError { violations })
        }
    }

    fn check_shape(&self, nodes: &NodeMap, names: &[&str], out: &mut Vec<Violation>) {
        let idx = children_index(nodes);
        for name in names {
            let node = &nodes[*name];
            if node.is_root() {
                if !node.container {
                    out.push(Violation::RootNotContainer(node.name.clone()));
                }
            } else if node.parent != node.name && !nodes.contains_key(&node.parent) {
                out.push(Violation::MissingParent { node: node.name.clone(), parent: node.parent.clone() });
            }
            match idx.get(*name) {
                Some(kids) if !node.container => {
                    let mut children: Vec<String> = kids.iter().map(|s| s.to_string()).collect();
                    children.sort_unstable();
                    out.push(Violation::LeafHasChildren { node: node.name.clone(), children });
                }
                None if node.container && !node.is_root() && self.leaf_rule.rejects(node) => {
                    out.push(Violation::ContainerLeaf(node.name.clone()));
                }
                _ => {}
            }
        }
    }
}

/// Validate with the default (permissive) leaf rule.
pub fn validate(nodes: &NodeMap) -> Result<(), ValidationError> {
    Validator::default().validate(nodes)
}

fn check_roots(nodes: &NodeMap, names: &[&str], out: &mut Vec<Violation>) {
    let roots: Vec<String> = names.iter().filter(|n| nodes[**n].is_root()).map(|n| n.to_string()).collect();
    match roots.len() {
        0 => out.push(Violation::NoRoot),
        1 => {}
        _ => out.push(Violation::MultipleRoots(roots)),
    }
}

// Each node has at most one outgoing (child -> parent) edge, so every
// strongly-connected component with an edge is a simple cycle found by
// walking parent chains.
fn check_cycles(nodes: &NodeMap, names: &[&str], out: &mut Vec<Violation>) {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark { OnPath, Done }

    let mut marks: FxHashMap<&str, Mark> = FxHashMap::default();
    for start in names {
        if marks.contains_key(start) { continue; }
        let mut path: Vec<&str> = Vec::new();
        let mut cur = *start;
        loop {
            match marks.get(cur) {
                Some(Mark::Done) => break,
                Some(Mark::OnPath) => {
                    if let Some(pos) = path.iter().position(|n| *n == cur) {
                        let mut members: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                        members.sort_unstable();
                        out.push(Violation::Cycle(members));
                    }
                    break;
                }
                None => {}
            }
            marks.insert(cur, Mark::OnPath);
            path.push(cur);
            let Some(node) = nodes.get(cur) else { break };
            if node.is_root() { break; }
            match nodes.get_key_value(node.parent.as_str()) {
                Some((k, _)) => cur = k.as_str(),
                None => break,
            }
        }
        for n in path {
            marks.insert(n, Mark::Done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::AllPolicies;

    fn nodes(list: Vec<Node>) -> NodeMap { AllPolicies::from_nodes(list).nodes }

    #[test]
    fn valid_tree_passes_and_is_pure() {
        let n = nodes(vec![
            Node::container("org", ""),
            Node::container("f1", "org"),
            Node::leaf("p1", "f1"),
            Node::leaf("p2", "org"),
        ]);
        assert!(validate(&n).is_ok());
        assert_eq!(validate(&n), validate(&n));
    }

    #[test]
    fn empty_map_has_no_root() {
        let err = validate(&NodeMap::default()).unwrap_err();
        assert_eq!(err.violations, vec![Violation::NoRoot]);
    }

    #[test]
    fn multiple_roots_are_named() {
        let n = nodes(vec![Node::container("b", ""), Node::container("a", "")]);
        let err = validate(&n).unwrap_err();
        assert_eq!(err.violations, vec![Violation::MultipleRoots(vec!["a".into(), "b".into()])]);
    }

    #[test]
    fn cycle_is_reported_with_members() {
        let n = nodes(vec![
            Node::container("org", ""),
            Node::container("x", "z"),
            Node::container("y", "x"),
            Node::container("z", "y"),
        ]);
        let err = validate(&n).unwrap_err();
        assert_eq!(err.violations, vec![Violation::Cycle(vec!["x".into(), "y".into(), "z".into()])]);
        assert!(err.to_string().contains("parent cycle: x -> y -> z"), "{}", err);
    }

    #[test]
    fn error_message_lists_each_violation() {
        let err = ValidationError {
            violations: vec![Violation::NoRoot, Violation::RootNotContainer("org".into())],
        };
        assert_eq!(
            err.to_string(),
            "invalid policy hierarchy (2 violation(s))\n  - no root node (every node has a parent)\n  - root node org is not a container"
        );
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let n = nodes(vec![Node::container("org", ""), Node::container("loop", "loop")]);
        let err = validate(&n).unwrap_err();
        assert_eq!(err.violations, vec![Violation::Cycle(vec!["loop".into()])]);
    }

    #[test]
    fn all_violations_are_aggregated() {
        let n = nodes(vec![
            Node::leaf("org", ""),
            Node::leaf("p1", "org"),
            Node::leaf("p2", "ghost"),
            Node::container("a", "b"),
            Node::container("b", "a"),
        ]);
        let err = validate(&n).unwrap_err();
        assert!(err.violations.contains(&Violation::RootNotContainer("org".into())));
        assert!(err.violations.contains(&Violation::LeafHasChildren { node: "org".into(), children: vec!["p1".into()] }));
        assert!(err.violations.contains(&Violation::MissingParent { node: "p2".into(), parent: "ghost".into() }));
        assert!(err.violations.contains(&Violation::Cycle(vec!["a".into(), "b".into()])));
        assert_eq!(err.violations.len(), 4);
    }

    #[test]
    fn leaf_rule_is_pluggable() {
        let n = nodes(vec![
            Node::container("org", ""),
            Node::container("empty", "org"),
            Node::container("tagged", "org").with_payload(serde_json::json!({"roles": ["viewer"]})),
        ]);
        assert!(validate(&n).is_ok());

        let strict = Validator::new().with_leaf_rule(LeafRule::RequireChildren);
        let err = strict.validate(&n).unwrap_err();
        assert_eq!(err.violations, vec![Violation::ContainerLeaf("empty".into()), Violation::ContainerLeaf("tagged".into())]);

        let content = Validator::new().with_leaf_rule(LeafRule::Predicate(Arc::new(|n: &Node| !n.payload.is_null())));
        let err = content.validate(&n).unwrap_err();
        assert_eq!(err.violations, vec![Violation::ContainerLeaf("tagged".into())]);
    }
}
