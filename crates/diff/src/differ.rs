//! Current/desired snapshot differ.
//!
//! Emission order is part of the contract because appliers run actions
//! strictly in sequence: node creates (shallow first), node updates (shallow
//! first), node deletes (deep first), the cluster policy, then sync upserts.
//! Sync deletes and reductions are a separate pre-phase, see [`Differ::plan`].

use std::collections::VecDeque;
use std::sync::Arc;

use canopy_core::{children_index, root_of, AllPolicies, ClusterPolicy, Node, NodeMap, SyncRegistration};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::action::{Action, ActionFactories, Verb};
use crate::sync::{reduce, syncs_equal};

/// Payload equality predicate. Only attached content is compared.
pub type PayloadEq = Arc<dyn Fn(&Json, &Json) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct DiffOptions {
    /// Break depth ties by name. Costs a sort pass; needed for reproducible output.
    pub deterministic: bool,
    pub payload_eq: PayloadEq,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { deterministic: false, payload_eq: Arc::new(|a: &Json, b: &Json| a == b) }
    }
}

impl std::fmt::Debug for DiffOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffOptions").field("deterministic", &self.deterministic).finish_non_exhaustive()
    }
}

impl DiffOptions {
    pub fn deterministic() -> Self { Self { deterministic: true, ..Self::default() } }
}

/// Counts per verb, for logs and previews.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub sync_deletes: usize,
    pub sync_reductions: usize,
}

/// Full transition: pre-phase (sync deletes, then reductions) and main actions.
#[derive(Debug, Default)]
pub struct Plan {
    pub prephase: Vec<Box<dyn Action>>,
    pub actions: Vec<Box<dyn Action>>,
}

impl Plan {
    pub fn is_empty(&self) -> bool { self.prephase.is_empty() && self.actions.is_empty() }

    pub fn len(&self) -> usize { self.prephase.len() + self.actions.len() }

    /// Pre-phase first, then main actions.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Action> {
        self.prephase.iter().chain(self.actions.iter()).map(|a| a.as_ref())
    }

    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for a in &self.prephase {
            match a.verb() {
                Verb::Delete => s.sync_deletes += 1,
                _ => s.sync_reductions += 1,
            }
        }
        for a in &self.actions {
            match a.verb() {
                Verb::Create => s.creates += 1,
                Verb::Update => s.updates += 1,
                Verb::Delete => s.deletes += 1,
            }
        }
        s
    }
}

/// BFS depth from the root (root = 0). Nodes unreachable from the root are absent.
pub fn depths(nodes: &NodeMap) -> FxHashMap<&str, usize> {
    let mut out: FxHashMap<&str, usize> = FxHashMap::default();
    let Some(root) = root_of(nodes) else { return out };
    let idx = children_index(nodes);
    let mut queue = VecDeque::new();
    out.insert(root.name.as_str(), 0);
    queue.push_back((root.name.as_str(), 0usize));
    while let Some((name, d)) = queue.pop_front() {
        for &child in idx.get(name).into_iter().flatten() {
            if out.contains_key(child) { continue; }
            out.insert(child, d + 1);
            queue.push_back((child, d + 1));
        }
    }
    out
}

/// Registrations present in `current` but gone from `desired`, sorted by name.
pub fn sync_deletes(current: &AllPolicies, desired: &AllPolicies) -> Vec<String> {
    let mut out: Vec<String> = current.syncs.keys().filter(|n| !desired.syncs.contains_key(*n)).cloned().collect();
    out.sort_unstable();
    out
}

/// Shrunk versions of registrations present on both sides, sorted by name.
pub fn sync_reductions(current: &AllPolicies, desired: &AllPolicies) -> Vec<SyncRegistration> {
    let mut out: Vec<SyncRegistration> = current
        .syncs
        .iter()
        .filter_map(|(name, cur)| desired.syncs.get(name).and_then(|want| reduce(cur, want)))
        .collect();
    out.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    out
}

// Unreachable nodes only appear in unvalidated input; park them at the far end.
fn depth_of(m: &FxHashMap<&str, usize>, n: &Node) -> usize {
    m.get(n.name.as_str()).copied().unwrap_or(usize::MAX)
}

pub struct Differ {
    factories: ActionFactories,
    opts: DiffOptions,
}

impl Differ {
    pub fn new(factories: ActionFactories, opts: DiffOptions) -> Self { Self { factories, opts } }

    pub fn options(&self) -> &DiffOptions { &self.opts }

    /// Structural fields (parent, container) or payload differ.
    /// `name` and `resource_version` are never compared.
    pub fn node_changed(&self, current: &Node, desired: &Node) -> bool {
        current.parent != desired.parent
            || current.container != desired.container
            || !(self.opts.payload_eq)(&current.payload, &desired.payload)
    }

    fn cluster_policy_changed(&self, current: &ClusterPolicy, desired: &ClusterPolicy) -> bool {
        !(self.opts.payload_eq)(&current.payload, &desired.payload)
    }

    /// Ordered main-phase actions transitioning `current` into `desired`.
    /// Both sides must already satisfy the tree invariants.
    pub fn diff(&self, current: &AllPolicies, desired: &AllPolicies) -> Vec<Box<dyn Action>> {
        let mut creates: Vec<&Node> = Vec::new();
        let mut updates: Vec<(&Node, &Node)> = Vec::new();
        for (name, want) in &desired.nodes {
            match current.nodes.get(name) {
                None => creates.push(want),
                Some(have) if self.node_changed(have, want) => updates.push((have, want)),
                Some(_) => {}
            }
        }
        let mut deletes: Vec<&Node> = current.nodes.iter().filter(|(n, _)| !desired.nodes.contains_key(*n)).map(|(_, v)| v).collect();

        let want_depth = depths(&desired.nodes);
        let have_depth = depths(&current.nodes);

        if self.opts.deterministic {
            creates.sort_by(|a, b| depth_of(&want_depth, a).cmp(&depth_of(&want_depth, b)).then_with(|| a.name.cmp(&b.name)));
            updates.sort_by(|a, b| depth_of(&want_depth, a.1).cmp(&depth_of(&want_depth, b.1)).then_with(|| a.1.name.cmp(&b.1.name)));
            deletes.sort_by(|a, b| depth_of(&have_depth, b).cmp(&depth_of(&have_depth, a)).then_with(|| a.name.cmp(&b.name)));
        } else {
            creates.sort_by_key(|n| depth_of(&want_depth, n));
            updates.sort_by_key(|(_, n)| depth_of(&want_depth, n));
            deletes.sort_by_key(|n| std::cmp::Reverse(depth_of(&have_depth, n)));
        }

        let mut out: Vec<Box<dyn Action>> = Vec::with_capacity(creates.len() + updates.len() + deletes.len() + 1);
        out.extend(creates.iter().map(|n| self.factories.nodes.new_create(n)));
        out.extend(updates.iter().map(|(have, want)| self.factories.nodes.new_update(have, want)));
        out.extend(deletes.iter().map(|n| self.factories.nodes.new_delete(n)));

        match (&current.cluster_policy, &desired.cluster_policy) {
            (None, Some(want)) => out.push(self.factories.cluster_policy.new_create(want)),
            (Some(have), None) => out.push(self.factories.cluster_policy.new_delete(have)),
            (Some(have), Some(want)) if self.cluster_policy_changed(have, want) => {
                out.push(self.factories.cluster_policy.new_update(have, want))
            }
            _ => {}
        }

        let mut syncs: Vec<&SyncRegistration> = desired.syncs.values().collect();
        if self.opts.deterministic {
            syncs.sort_by(|a, b| a.name.cmp(&b.name));
        }
        for want in syncs {
            match current.syncs.get(&want.name) {
                None => out.push(self.factories.syncs.new_create(want)),
                Some(have) if !syncs_equal(have, want) => out.push(self.factories.syncs.new_update(have, want)),
                Some(_) => {}
            }
        }

        debug!(creates = creates.len(), updates = updates.len(), deletes = deletes.len(), total = out.len(), "diff computed");
        counter!("diff_actions_total", out.len() as u64);
        out
    }

    /// Sync pre-phase plus main actions. Pre-phase deletes precede reductions;
    /// the main phase is diffed against `current` as it stands once the
    /// pre-phase has settled.
    pub fn plan(&self, current: &AllPolicies, desired: &AllPolicies) -> Plan {
        let mut prephase: Vec<Box<dyn Action>> = Vec::new();
        let mut settled = current.clone();
        for name in sync_deletes(current, desired) {
            if let Some(have) = settled.syncs.remove(&name) {
                prephase.push(self.factories.syncs.new_delete(&have));
            }
        }
        for reduced in sync_reductions(current, desired) {
            if let Some(have) = current.syncs.get(&reduced.name) {
                prephase.push(self.factories.syncs.new_update(have, &reduced));
            }
            settled.upsert_sync(reduced);
        }
        Plan { prephase, actions: self.diff(&settled, desired) }
    }
}
