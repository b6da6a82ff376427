//! Canopy core types: policy nodes, snapshots, resume markers.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod sync;

pub use kube::core::GroupVersionKind;
pub use sync::{SyncGroup, SyncKind, SyncRegistration};

/// A named vertex of the policy hierarchy (organization, folder or project).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    /// Parent node name; empty for the root.
    #[serde(default)]
    pub parent: String,
    /// Containers may have children; leaves may not.
    #[serde(default)]
    pub container: bool,
    /// Attached policy content. Never interpreted, only compared.
    #[serde(default)]
    pub payload: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl Node {
    pub fn container(name: &str, parent: &str) -> Self {
        Self { name: name.to_string(), parent: parent.to_string(), container: true, payload: Json::Null, resource_version: None }
    }

    pub fn leaf(name: &str, parent: &str) -> Self {
        Self { container: false, ..Self::container(name, parent) }
    }

    pub fn with_payload(mut self, payload: Json) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_root(&self) -> bool { self.parent.is_empty() }
}

/// Organization-wide singleton policy. Lives outside the tree ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicy {
    #[serde(default = "ClusterPolicy::default_name")]
    pub name: String,
    #[serde(default)]
    pub payload: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ClusterPolicy {
    pub const DEFAULT_NAME: &'static str = "cluster-policy";

    fn default_name() -> String { Self::DEFAULT_NAME.to_string() }

    pub fn new(payload: Json) -> Self {
        Self { name: Self::default_name(), payload, resource_version: None }
    }
}

pub type NodeMap = FxHashMap<String, Node>;
pub type SyncMap = FxHashMap<String, SyncRegistration>;

/// External feed element -> internal node name.
pub type NameMap = BTreeMap<String, String>;

/// A complete view of the policy collection at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllPolicies {
    #[serde(default)]
    pub nodes: NodeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_policy: Option<ClusterPolicy>,
    #[serde(default)]
    pub syncs: SyncMap,
}

impl AllPolicies {
    pub fn from_nodes<I: IntoIterator<Item = Node>>(nodes: I) -> Self {
        let mut s = Self::default();
        for n in nodes {
            s.upsert_node(n);
        }
        s
    }

    /// Insert or replace a node, returning the previous value.
    pub fn upsert_node(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.name.clone(), node)
    }

    pub fn remove_node(&mut self, name: &str) -> Option<Node> { self.nodes.remove(name) }

    pub fn upsert_sync(&mut self, sync: SyncRegistration) -> Option<SyncRegistration> {
        self.syncs.insert(sync.name.clone(), sync)
    }

    pub fn root(&self) -> Option<&Node> { root_of(&self.nodes) }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.cluster_policy.is_none() && self.syncs.is_empty()
    }
}

/// First node with an empty parent reference, if any.
pub fn root_of(nodes: &NodeMap) -> Option<&Node> {
    nodes.values().find(|n| n.is_root())
}

/// Parent name -> child names, built fresh from the flat map.
/// Root entries (empty parent) are not indexed.
pub fn children_index(nodes: &NodeMap) -> FxHashMap<&str, Vec<&str>> {
    let mut idx: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for n in nodes.values() {
        if n.is_root() { continue; }
        idx.entry(n.parent.as_str()).or_default().push(n.name.as_str());
    }
    idx
}

/// Names of every node reachable below `name` (excluding `name`).
pub fn descendants_of<'a>(nodes: &'a NodeMap, name: &str) -> FxHashSet<&'a str> {
    let idx = children_index(nodes);
    let mut out = FxHashSet::default();
    let mut stack: Vec<&str> = idx.get(name).cloned().unwrap_or_default();
    while let Some(n) = stack.pop() {
        if !out.insert(n) { continue; }
        if let Some(kids) = idx.get(n) {
            stack.extend(kids.iter().copied());
        }
    }
    out
}

/// Opaque, non-empty token for resuming the change feed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct ResumeMarker(Vec<u8>);

#[derive(Debug, thiserror::Error)]
#[error("resume marker must not be empty")]
pub struct EmptyMarker;

impl ResumeMarker {
    /// Returns `None` for an empty token.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let b = bytes.into();
        if b.is_empty() { None } else { Some(Self(b)) }
    }

    pub fn as_bytes(&self) -> &[u8] { &self.0 }
}

impl TryFrom<Vec<u8>> for ResumeMarker {
    type Error = EmptyMarker;
    fn try_from(v: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(v).ok_or(EmptyMarker)
    }
}

impl From<ResumeMarker> for Vec<u8> {
    fn from(m: ResumeMarker) -> Self { m.0 }
}

impl fmt::Debug for ResumeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeMarker({})", self)
    }
}

impl fmt::Display for ResumeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => {
                for b in &self.0 { write!(f, "{:02x}", b)?; }
                Ok(())
            }
        }
    }
}

/// Durable unit written after a group advanced the resume marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub marker: ResumeMarker,
    pub snapshot: AllPolicies,
    #[serde(default)]
    pub names: NameMap,
    /// Seconds since epoch.
    pub ts: i64,
}

pub mod prelude {
    pub use super::{AllPolicies, Checkpoint, ClusterPolicy, GroupVersionKind, NameMap, Node, NodeMap, ResumeMarker, SyncMap, SyncRegistration};
}
