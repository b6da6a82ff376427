//! Action seams: what the differ emits and how it gets applied.
//!
//! The differ never talks to a backend. It asks injected factories for opaque
//! actions and hands them back in order; an [`Applier`] runs them.

use std::fmt;
use std::sync::Arc;

use canopy_core::{ClusterPolicy, Node, SyncRegistration};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// API group all canopy resources live in.
pub const GROUP: &str = "canopy.dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    PolicyNode,
    ClusterPolicy,
    Sync,
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::PolicyNode => "PolicyNode",
            Resource::ClusterPolicy => "ClusterPolicy",
            Resource::Sync => "Sync",
        }
    }
}

/// `<group>/<kind>/<name>/<verb>`
pub fn action_id(resource: Resource, name: &str, verb: Verb) -> String {
    format!("{}/{}/{}/{}", GROUP, resource.kind(), name, verb)
}

/// One step of a reconcile plan. `Display` renders [`action_id`].
#[async_trait::async_trait]
pub trait Action: fmt::Display + Send + Sync {
    fn resource(&self) -> Resource;
    fn name(&self) -> &str;
    fn verb(&self) -> Verb;
    /// Perform the mutation. Invoked by an applier, never by the differ.
    async fn execute(&self) -> anyhow::Result<()>;
}

impl fmt::Debug for dyn Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self)
    }
}

/// Builds actions for one resource type.
pub trait ActionFactory<R>: Send + Sync {
    fn new_create(&self, desired: &R) -> Box<dyn Action>;
    fn new_update(&self, current: &R, desired: &R) -> Box<dyn Action>;
    fn new_delete(&self, current: &R) -> Box<dyn Action>;
}

/// Per-kind factories supplied at construction time.
#[derive(Clone)]
pub struct ActionFactories {
    pub nodes: Arc<dyn ActionFactory<Node>>,
    pub cluster_policy: Arc<dyn ActionFactory<ClusterPolicy>>,
    pub syncs: Arc<dyn ActionFactory<SyncRegistration>>,
}

impl ActionFactories {
    /// Use one value that knows how to build actions for every kind.
    pub fn uniform<F>(f: Arc<F>) -> Self
    where
        F: ActionFactory<Node> + ActionFactory<ClusterPolicy> + ActionFactory<SyncRegistration> + 'static,
    {
        Self { nodes: f.clone(), cluster_policy: f.clone(), syncs: f }
    }

    /// Factories producing [`PlannedAction`]s (inert; useful for previews and tests).
    pub fn planned() -> Self { Self::uniform(Arc::new(PlanFactory)) }
}

/// Executes actions handed over by the watch processor, strictly in order.
#[async_trait::async_trait]
pub trait Applier: Send {
    async fn apply(&mut self, action: &dyn Action) -> anyhow::Result<()>;
}

/// Applier that simply runs [`Action::execute`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutingApplier;

#[async_trait::async_trait]
impl Applier for ExecutingApplier {
    async fn apply(&mut self, action: &dyn Action) -> anyhow::Result<()> {
        let res = action.execute().await;
        match &res {
            Ok(()) => { counter!("apply_ok", 1u64); }
            Err(_) => { counter!("apply_err", 1u64); }
        }
        res
    }
}

/// Inert action carrying the object it would write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub resource: Resource,
    pub name: String,
    pub verb: Verb,
    /// Desired object for create/update, current object for delete.
    pub object: Json,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&action_id(self.resource, &self.name, self.verb))
    }
}

#[async_trait::async_trait]
impl Action for PlannedAction {
    fn resource(&self) -> Resource { self.resource }
    fn name(&self) -> &str { &self.name }
    fn verb(&self) -> Verb { self.verb }

    async fn execute(&self) -> anyhow::Result<()> {
        debug!(action = %self, "planned action (no-op)");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlanFactory;

impl PlanFactory {
    fn planned<R: Serialize>(resource: Resource, name: &str, verb: Verb, obj: &R) -> Box<dyn Action> {
        let object = serde_json::to_value(obj).unwrap_or(Json::Null);
        Box::new(PlannedAction { resource, name: name.to_string(), verb, object })
    }
}

impl ActionFactory<Node> for PlanFactory {
    fn new_create(&self, desired: &Node) -> Box<dyn Action> {
        Self::planned(Resource::PolicyNode, &desired.name, Verb::Create, desired)
    }
    fn new_update(&self, _current: &Node, desired: &Node) -> Box<dyn Action> {
        Self::planned(Resource::PolicyNode, &desired.name, Verb::Update, desired)
    }
    fn new_delete(&self, current: &Node) -> Box<dyn Action> {
        Self::planned(Resource::PolicyNode, &current.name, Verb::Delete, current)
    }
}

impl ActionFactory<ClusterPolicy> for PlanFactory {
    fn new_create(&self, desired: &ClusterPolicy) -> Box<dyn Action> {
        Self::planned(Resource::ClusterPolicy, &desired.name, Verb::Create, desired)
    }
    fn new_update(&self, _current: &ClusterPolicy, desired: &ClusterPolicy) -> Box<dyn Action> {
        Self::planned(Resource::ClusterPolicy, &desired.name, Verb::Update, desired)
    }
    fn new_delete(&self, current: &ClusterPolicy) -> Box<dyn Action> {
        Self::planned(Resource::ClusterPolicy, &current.name, Verb::Delete, current)
    }
}

impl ActionFactory<SyncRegistration> for PlanFactory {
    fn new_create(&self, desired: &SyncRegistration) -> Box<dyn Action> {
        Self::planned(Resource::Sync, &desired.name, Verb::Create, desired)
    }
    fn new_update(&self, _current: &SyncRegistration, desired: &SyncRegistration) -> Box<dyn Action> {
        Self::planned(Resource::Sync, &desired.name, Verb::Update, desired)
    }
    fn new_delete(&self, current: &SyncRegistration) -> Box<dyn Action> {
        Self::planned(Resource::Sync, &current.name, Verb::Delete, current)
    }
}
