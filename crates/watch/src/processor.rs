//! The watch processor: atomic groups in, ordered actions out.
//!
//! Changes accumulate until one arrives with `continued == false`. The closed
//! group is materialized into a desired snapshot, validated, planned against
//! the committed snapshot and pushed through the [`Applier`] before anything
//! is committed. A group that fails at any step leaves the committed state,
//! name map and resume marker exactly as they were.

use std::time::Instant;

use canopy_core::{AllPolicies, Checkpoint, ClusterPolicy, NameMap, Node, ResumeMarker, SyncMap};
use canopy_diff::{Action, ActionFactories, Applier, DiffOptions, Differ, PayloadEq};
use canopy_tree::{ValidationError, Validator};
use metrics::{counter, gauge, histogram};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::element::{classify, ElementKind};
use crate::feed::{Change, ChangeFeed, ChangeState, FeedError};
use crate::snapshot::{Publisher, SnapshotHandle};

/// How the processor treats the first group it sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// No usable marker: the first group is the full initial state and
    /// replaces whatever was seeded.
    Fresh,
    /// Continue from a marker; groups are deltas on the seeded snapshot.
    Resume(ResumeMarker),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingInitialState,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Cancelled,
    IdleTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("group {group}: element {element:?} reported an error state")]
    ElementError { element: String, group: u64 },
    #[error("group {group}: initial state skipped for element {element:?}")]
    InitialStateSkipped { element: String, group: u64 },
    #[error("group {group}: unrecognized element {element:?}")]
    UnknownElement { element: String, group: u64 },
    #[error("group {group}: decoding payload of {element:?}: {source}")]
    Decode {
        element: String,
        group: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("group {group}: initial state did not include the root element")]
    MissingRoot { group: u64 },
    #[error("group {group}: {source}")]
    Invalid {
        group: u64,
        #[source]
        source: ValidationError,
    },
    #[error("group {group}: applying {action}: {source:#}")]
    Apply {
        action: String,
        group: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("feed: {0}")]
    Feed(#[from] FeedError),
    #[error("seeded snapshot: {0}")]
    InvalidSeed(#[source] ValidationError),
}

/// Aborts a pending receive. Dropping the handle without calling
/// [`CancelHandle::cancel`] does not cancel.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Everything the caller needs to persist or resume, plus how the run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// Last adopted marker; `None` only if no group ever carried one.
    pub marker: Option<ResumeMarker>,
    pub snapshot: AllPolicies,
    pub names: NameMap,
    pub result: Result<StopReason, WatchError>,
}

impl RunOutcome {
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        let marker = self.marker.clone()?;
        Some(Checkpoint { marker, snapshot: self.snapshot.clone(), names: self.names.clone(), ts: now_secs() })
    }
}

/// Chooses the sync registrations a materialized snapshot should carry.
pub trait SyncPlanner: Send {
    fn desired_syncs(&self, current: &AllPolicies, desired: &AllPolicies) -> SyncMap;
}

/// Keeps whatever registrations are committed now.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainSyncs;

impl SyncPlanner for RetainSyncs {
    fn desired_syncs(&self, current: &AllPolicies, _desired: &AllPolicies) -> SyncMap {
        current.syncs.clone()
    }
}

/// Durable sink for checkpoints. Failures are logged by the processor.
pub trait CheckpointSink: Send {
    fn commit(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
}

pub struct Processor {
    factories: ActionFactories,
    diff_opts: DiffOptions,
    differ: Differ,
    validator: Validator,
    config: WatchConfig,
    state: State,
    current: AllPolicies,
    names: NameMap,
    marker: Option<ResumeMarker>,
    syncs: Box<dyn SyncPlanner>,
    checkpoints: Option<Box<dyn CheckpointSink>>,
    publisher: Publisher,
    cancel_tx: Option<oneshot::Sender<()>>,
    cancel_rx: Option<oneshot::Receiver<()>>,
    groups: u64,
}

impl Processor {
    /// A non-empty seeded snapshot must already be a valid hierarchy.
    pub fn new(
        factories: ActionFactories,
        start: StartMode,
        seed: AllPolicies,
        config: WatchConfig,
    ) -> Result<Self, WatchError> {
        let validator = Validator::new().with_leaf_rule(config.leaf_rule.clone());
        if !seed.nodes.is_empty() {
            validator.validate(&seed.nodes).map_err(WatchError::InvalidSeed)?;
        }
        let (state, marker) = match start {
            StartMode::Fresh => (State::AwaitingInitialState, None),
            StartMode::Resume(m) => (State::Steady, Some(m)),
        };
        let diff_opts = DiffOptions { deterministic: config.deterministic, ..DiffOptions::default() };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        Ok(Self {
            differ: Differ::new(factories.clone(), diff_opts.clone()),
            factories,
            diff_opts,
            validator,
            config,
            state,
            publisher: Publisher::new(&seed),
            current: seed,
            names: NameMap::new(),
            marker,
            syncs: Box::new(RetainSyncs),
            checkpoints: None,
            cancel_tx: Some(cancel_tx),
            cancel_rx: Some(cancel_rx),
            groups: 0,
        })
    }

    /// Element-to-name mapping restored from a checkpoint.
    pub fn with_names(mut self, names: NameMap) -> Self {
        self.names = names;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_payload_eq(mut self, eq: PayloadEq) -> Self {
        self.diff_opts.payload_eq = eq;
        self.differ = Differ::new(self.factories.clone(), self.diff_opts.clone());
        self
    }

    pub fn with_sync_planner<P: SyncPlanner + 'static>(mut self, planner: P) -> Self {
        self.syncs = Box::new(planner);
        self
    }

    pub fn with_checkpoints<C: CheckpointSink + 'static>(mut self, sink: C) -> Self {
        self.checkpoints = Some(Box::new(sink));
        self
    }

    /// Only the first call returns a handle.
    pub fn cancel_handle(&mut self) -> Option<CancelHandle> {
        self.cancel_tx.take().map(|tx| CancelHandle { tx: Some(tx) })
    }

    pub fn snapshot_handle(&self) -> SnapshotHandle { self.publisher.handle() }

    pub fn state(&self) -> State { self.state }

    pub fn current(&self) -> &AllPolicies { &self.current }

    pub fn marker(&self) -> Option<&ResumeMarker> { self.marker.as_ref() }

    /// Drive the feed until it ends, is cancelled, idles out or a group fails.
    pub async fn run<F, A>(mut self, feed: &mut F, applier: &mut A) -> RunOutcome
    where
        F: ChangeFeed + ?Sized,
        A: Applier + ?Sized,
    {
        let result = self.pump(feed, applier).await;
        match &result {
            Ok(reason) => info!(?reason, groups = self.groups, marker = ?self.marker, "watch stopped"),
            Err(e) => warn!(error = %e, groups = self.groups, marker = ?self.marker, "watch aborted"),
        }
        RunOutcome { marker: self.marker, snapshot: self.current, names: self.names, result }
    }

    async fn pump<F, A>(&mut self, feed: &mut F, applier: &mut A) -> Result<StopReason, WatchError>
    where
        F: ChangeFeed + ?Sized,
        A: Applier + ?Sized,
    {
        enum Next {
            Cancelled,
            Idle,
            Received(Result<Vec<Change>, FeedError>),
        }

        let idle = self.config.idle_timeout;
        let mut cancel_rx = self.cancel_rx.take();
        let mut pending: Vec<Change> = Vec::new();
        loop {
            let next = tokio::select! {
                _ = cancelled(&mut cancel_rx) => Next::Cancelled,
                res = tokio::time::timeout(idle, feed.receive()) => match res {
                    Ok(r) => Next::Received(r),
                    Err(_) => Next::Idle,
                },
            };
            let batch = match next {
                Next::Cancelled => {
                    info!(pending = pending.len(), "watch cancelled");
                    feed.cancel();
                    return Ok(StopReason::Cancelled);
                }
                Next::Idle => {
                    warn!(idle_secs = idle.as_secs_f64(), pending = pending.len(), "feed idle; giving up");
                    counter!("watch_idle_timeouts_total", 1u64);
                    feed.cancel();
                    return Ok(StopReason::IdleTimeout);
                }
                Next::Received(Ok(batch)) => batch,
                Next::Received(Err(FeedError::Closed)) => {
                    if !pending.is_empty() {
                        warn!(pending = pending.len(), "feed closed inside an open group; dropping it");
                    }
                    return Ok(StopReason::EndOfStream);
                }
                Next::Received(Err(FeedError::Cancelled)) => return Ok(StopReason::Cancelled),
                Next::Received(Err(e)) => return Err(WatchError::Feed(e)),
            };
            debug!(changes = batch.len(), "batch received");
            for change in batch {
                let group = self.groups + 1;
                match change.state {
                    ChangeState::Error => {
                        return Err(WatchError::ElementError { element: change.element, group });
                    }
                    ChangeState::InitialStateSkipped => {
                        return Err(WatchError::InitialStateSkipped { element: change.element, group });
                    }
                    ChangeState::Exists | ChangeState::DoesNotExist => {}
                }
                let closes = !change.continued;
                pending.push(change);
                if closes {
                    let changes = std::mem::take(&mut pending);
                    self.commit_group(changes, applier).await?;
                }
            }
        }
    }

    async fn commit_group<A>(&mut self, changes: Vec<Change>, applier: &mut A) -> Result<(), WatchError>
    where
        A: Applier + ?Sized,
    {
        self.groups += 1;
        let group = self.groups;
        let t0 = Instant::now();

        let initial = self.state == State::AwaitingInitialState;
        if initial
            && !changes
                .iter()
                .any(|c| c.state == ChangeState::Exists && classify(&c.element) == ElementKind::Root)
        {
            return Err(WatchError::MissingRoot { group });
        }

        let (mut desired, mut names) = if initial {
            (AllPolicies::default(), NameMap::new())
        } else {
            (self.current.clone(), self.names.clone())
        };
        for change in &changes {
            apply_change(&mut desired, &mut names, change, group)?;
        }
        desired.syncs = self.syncs.desired_syncs(&self.current, &desired);

        self.validator
            .validate(&desired.nodes)
            .map_err(|source| WatchError::Invalid { group, source })?;

        let plan = self.differ.plan(&self.current, &desired);
        for action in plan.iter() {
            apply_one(applier, action, group).await?;
        }

        let marker = changes
            .iter()
            .rev()
            .find_map(|c| c.resume_marker.clone().and_then(ResumeMarker::new));
        let advanced = marker.is_some();

        self.current = desired;
        self.names = names;
        self.state = State::Steady;
        if let Some(m) = marker {
            self.marker = Some(m);
        }
        let epoch = self.publisher.publish(&self.current);

        let elapsed = t0.elapsed().as_secs_f64() * 1000.0;
        counter!("watch_groups_total", 1u64);
        counter!("watch_actions_applied_total", plan.len() as u64);
        histogram!("watch_group_latency_ms", elapsed);
        gauge!("watch_nodes", self.current.nodes.len() as f64);
        info!(
            group,
            changes = changes.len(),
            actions = plan.len(),
            initial,
            epoch,
            marker = ?self.marker,
            elapsed_ms = %format!("{:.3}", elapsed),
            "group committed"
        );

        if advanced {
            self.write_checkpoint(group);
        }
        Ok(())
    }

    fn write_checkpoint(&mut self, group: u64) {
        let Some(sink) = self.checkpoints.as_mut() else { return };
        let Some(marker) = self.marker.clone() else { return };
        let cp = Checkpoint { marker, snapshot: self.current.clone(), names: self.names.clone(), ts: now_secs() };
        if let Err(e) = sink.commit(&cp) {
            counter!("checkpoint_err", 1u64);
            warn!(group, error = %e, "checkpoint write failed");
        }
    }
}

async fn apply_one<A>(applier: &mut A, action: &dyn Action, group: u64) -> Result<(), WatchError>
where
    A: Applier + ?Sized,
{
    debug!(group, action = %action, "apply");
    applier
        .apply(action)
        .await
        .map_err(|source| WatchError::Apply { action: action.to_string(), group, source })
}

fn apply_change(desired: &mut AllPolicies, names: &mut NameMap, change: &Change, group: u64) -> Result<(), WatchError> {
    let element = change.element.as_str();
    match (classify(element), change.state) {
        (ElementKind::Unknown, _) => Err(WatchError::UnknownElement { element: element.to_string(), group }),
        (ElementKind::Root | ElementKind::Node, ChangeState::Exists) => {
            let node: Node = decode(change, group)?;
            // A node name is owned by one element at a time; a move re-keys it.
            names.retain(|e, n| {
                let moved = e.as_str() != element && *n == node.name;
                if moved {
                    debug!(group, from = %e, to = element, node = %node.name, "node moved to new element");
                }
                !moved
            });
            if let Some(prev) = names.insert(element.to_string(), node.name.clone()) {
                if prev != node.name && !is_tracked(names, &prev) {
                    debug!(group, element, from = %prev, to = %node.name, "element renamed");
                    desired.remove_node(&prev);
                }
            }
            desired.upsert_node(node);
            Ok(())
        }
        (ElementKind::Root | ElementKind::Node, ChangeState::DoesNotExist) => {
            match names.remove(element) {
                Some(name) if is_tracked(names, &name) => {
                    debug!(group, element, node = %name, "stale delete; node is tracked by another element");
                }
                Some(name) => {
                    desired.remove_node(&name);
                }
                None => {
                    counter!("watch_unknown_delete_total", 1u64);
                    warn!(group, element, "delete for element with no known node; skipping");
                }
            }
            Ok(())
        }
        (ElementKind::ClusterPolicy, ChangeState::Exists) => {
            let cp: ClusterPolicy = decode(change, group)?;
            desired.cluster_policy = Some(cp);
            Ok(())
        }
        (ElementKind::ClusterPolicy, ChangeState::DoesNotExist) => {
            desired.cluster_policy = None;
            Ok(())
        }
        (_, ChangeState::Error) => Err(WatchError::ElementError { element: element.to_string(), group }),
        (_, ChangeState::InitialStateSkipped) => {
            Err(WatchError::InitialStateSkipped { element: element.to_string(), group })
        }
    }
}

fn is_tracked(names: &NameMap, name: &str) -> bool {
    names.values().any(|n| n == name)
}

fn decode<T: serde::de::DeserializeOwned>(change: &Change, group: u64) -> Result<T, WatchError> {
    serde_json::from_slice(&change.payload).map_err(|source| WatchError::Decode {
        element: change.element.clone(),
        group,
        source,
    })
}

/// Resolves once cancellation was requested; never if the handle was dropped.
async fn cancelled(rx: &mut Option<oneshot::Receiver<()>>) {
    if let Some(r) = rx.as_mut() {
        if r.await.is_ok() {
            return;
        }
    }
    *rx = None;
    std::future::pending::<()>().await
}

fn now_secs() -> i64 { chrono::Utc::now().timestamp() }
