//! GVK-set algebra over watch registrations.

use canopy_core::{SyncGroup, SyncKind, SyncRegistration};
use rustc_hash::{FxHashMap, FxHashSet};

/// Same triple set, ignoring ordering and duplicate entries.
pub fn syncs_equal(a: &SyncRegistration, b: &SyncRegistration) -> bool {
    a.gvks() == b.gvks()
}

/// Shrink `current` to the triples `desired` still covers.
///
/// Returns `None` when nothing would be dropped. Otherwise the result keeps
/// `current`'s name and ordering and holds exactly the shared triples (possibly
/// none). Never grows a registration.
pub fn reduce(current: &SyncRegistration, desired: &SyncRegistration) -> Option<SyncRegistration> {
    let mut lookup: FxHashMap<&str, FxHashMap<&str, FxHashSet<&str>>> = FxHashMap::default();
    for g in &desired.groups {
        let kinds = lookup.entry(g.group.as_str()).or_default();
        for k in &g.kinds {
            kinds.entry(k.kind.as_str()).or_default().extend(k.versions.iter().map(|v| v.as_str()));
        }
    }

    let mut dropped = false;
    let mut groups = Vec::new();
    for g in &current.groups {
        let mut kinds = Vec::new();
        for k in &g.kinds {
            let mut versions: Vec<String> = Vec::new();
            for v in &k.versions {
                let shared = lookup
                    .get(g.group.as_str())
                    .and_then(|ks| ks.get(k.kind.as_str()))
                    .is_some_and(|vs| vs.contains(v.as_str()));
                if !shared {
                    dropped = true;
                } else if !versions.contains(v) {
                    versions.push(v.clone());
                }
            }
            if !versions.is_empty() {
                kinds.push(SyncKind { kind: k.kind.clone(), versions });
            }
        }
        if !kinds.is_empty() {
            groups.push(SyncGroup { group: g.group.clone(), kinds });
        }
    }

    if dropped {
        Some(SyncRegistration { name: current.name.clone(), groups })
    } else {
        None
    }
}
