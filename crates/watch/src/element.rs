//! Element-name classification.
//!
//! Feed element names are `""` for the root, otherwise a chain of
//! `(organizations|folders|projects)/<id>` segments ending in `PolicyNode` or
//! `ClusterPolicy`.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// The root element; its payload is the root [`canopy_core::Node`].
    Root,
    Node,
    ClusterPolicy,
    Unknown,
}

static ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:organizations|folders|projects)/[^/]+/)*(PolicyNode|ClusterPolicy)$")
        .expect("element pattern compiles")
});

pub fn classify(element: &str) -> ElementKind {
    if element.is_empty() {
        return ElementKind::Root;
    }
    match ELEMENT.captures(element).and_then(|c| c.get(1)).map(|m| m.as_str()) {
        Some("PolicyNode") => ElementKind::Node,
        Some("ClusterPolicy") => ElementKind::ClusterPolicy,
        _ => ElementKind::Unknown,
    }
}
