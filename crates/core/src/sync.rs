//! Watch registrations: which (group, kind, version) triples are live.

use kube::core::GroupVersionKind;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncKind {
    pub kind: String,
    #[serde(default)]
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncGroup {
    /// Empty for the core group.
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub kinds: Vec<SyncKind>,
}

/// Named record of live watch registrations, laid out `group -> kind -> versions`.
/// Representation order is not significant; see [`SyncRegistration::gvks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRegistration {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<SyncGroup>,
}

impl SyncRegistration {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), groups: Vec::new() }
    }

    /// Build from triples, grouping in first-seen order.
    pub fn from_gvks<'a, I>(name: &str, gvks: I) -> Self
    where
        I: IntoIterator<Item = &'a GroupVersionKind>,
    {
        let mut out = Self::new(name);
        for gvk in gvks {
            out.insert(gvk);
        }
        out
    }

    pub fn insert(&mut self, gvk: &GroupVersionKind) {
        let group = match self.groups.iter_mut().position(|g| g.group == gvk.group) {
            Some(i) => &mut self.groups[i],
            None => {
                self.groups.push(SyncGroup { group: gvk.group.clone(), kinds: Vec::new() });
                let last = self.groups.len() - 1;
                &mut self.groups[last]
            }
        };
        let kind = match group.kinds.iter_mut().position(|k| k.kind == gvk.kind) {
            Some(i) => &mut group.kinds[i],
            None => {
                group.kinds.push(SyncKind { kind: gvk.kind.clone(), versions: Vec::new() });
                let last = group.kinds.len() - 1;
                &mut group.kinds[last]
            }
        };
        if !kind.versions.iter().any(|v| *v == gvk.version) {
            kind.versions.push(gvk.version.clone());
        }
    }

    /// Iterate triples in representation order (duplicates included).
    pub fn iter_gvks(&self) -> impl Iterator<Item = GroupVersionKind> + '_ {
        self.groups.iter().flat_map(|g| {
            g.kinds.iter().flat_map(move |k| {
                k.versions.iter().map(move |v| GroupVersionKind {
                    group: g.group.clone(),
                    version: v.clone(),
                    kind: k.kind.clone(),
                })
            })
        })
    }

    /// The triple set this registration covers.
    pub fn gvks(&self) -> FxHashSet<GroupVersionKind> { self.iter_gvks().collect() }

    pub fn is_empty(&self) -> bool { self.iter_gvks().next().is_none() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvk(g: &str, v: &str, k: &str) -> GroupVersionKind {
        GroupVersionKind { group: g.into(), version: v.into(), kind: k.into() }
    }

    #[test]
    fn insert_groups_and_dedups() {
        let mut s = SyncRegistration::new("s");
        s.insert(&gvk("rbac", "v1", "Role"));
        s.insert(&gvk("rbac", "v1beta1", "Role"));
        s.insert(&gvk("rbac", "v1", "Role"));
        s.insert(&gvk("", "v1", "ResourceQuota"));
        assert_eq!(s.groups.len(), 2);
        assert_eq!(s.groups[0].kinds[0].versions, vec!["v1", "v1beta1"]);
        assert_eq!(s.gvks().len(), 3);
        assert!(!s.is_empty());
    }

    #[test]
    fn empty_kinds_cover_nothing() {
        let s = SyncRegistration {
            name: "s".into(),
            groups: vec![SyncGroup { group: "rbac".into(), kinds: vec![SyncKind { kind: "Role".into(), versions: vec![] }] }],
        };
        assert!(s.is_empty());
    }
}
