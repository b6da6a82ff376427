use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopy_core::{AllPolicies, Checkpoint, ClusterPolicy, NameMap, Node, ResumeMarker, SyncMap, SyncRegistration};
use canopy_diff::{Action, ActionFactories, Applier};
use canopy_watch::{
    Change, ChangeState, CheckpointSink, FeedError, Processor, ScriptedFeed, StartMode, StopReason, SyncPlanner,
    WatchConfig, WatchError,
};

/// Records every action id; optionally fails on one.
#[derive(Default)]
struct Recorder {
    seen: Vec<String>,
    fail_on: Option<String>,
}

#[async_trait::async_trait]
impl Applier for Recorder {
    async fn apply(&mut self, action: &dyn Action) -> anyhow::Result<()> {
        let id = action.to_string();
        if self.fail_on.as_deref() == Some(id.as_str()) {
            anyhow::bail!("backend refused {id}");
        }
        self.seen.push(id);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemSink(Arc<Mutex<Vec<Checkpoint>>>);

impl CheckpointSink for MemSink {
    fn commit(&mut self, cp: &Checkpoint) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(cp.clone());
        Ok(())
    }
}

fn processor(start: StartMode, seed: AllPolicies) -> Processor {
    let cfg = WatchConfig::default().deterministic(true);
    Processor::new(ActionFactories::planned(), start, seed, cfg).unwrap()
}

fn seeded() -> AllPolicies {
    AllPolicies::from_nodes([
        Node::container("org", ""),
        Node::container("f1", "org"),
        Node::leaf("p1", "f1"),
        Node::leaf("p2", "org"),
    ])
}

fn marker(s: &str) -> ResumeMarker {
    ResumeMarker::new(s).unwrap()
}

#[tokio::test]
async fn error_state_aborts_group_without_actions() {
    let p = processor(StartMode::Fresh, AllPolicies::default());
    let mut feed = ScriptedFeed::new([vec![
        Change::node("", &Node::container("org", "")).unwrap().continued(true),
        Change::new("organizations/1/PolicyNode", ChangeState::Error),
    ]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;

    match out.result {
        Err(WatchError::ElementError { element, group }) => {
            assert_eq!(element, "organizations/1/PolicyNode");
            assert_eq!(group, 1);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(applier.seen.is_empty());
    assert!(out.snapshot.is_empty());
    assert_eq!(out.marker, None);
}

#[tokio::test]
async fn initial_state_skipped_is_fatal() {
    let p = processor(StartMode::Resume(marker("m0")), seeded());
    let mut feed = ScriptedFeed::new([vec![Change::new("PolicyNode", ChangeState::InitialStateSkipped)]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;
    assert!(matches!(out.result, Err(WatchError::InitialStateSkipped { .. })));
    assert!(applier.seen.is_empty());
    assert_eq!(out.marker, Some(marker("m0")));
    assert_eq!(out.snapshot, seeded());
}

#[tokio::test]
async fn fresh_start_wipes_seeded_nodes() {
    let p = processor(StartMode::Fresh, seeded());
    let mut feed = ScriptedFeed::new([vec![Change::node("", &Node::container("org", "")).unwrap().with_marker("m1")]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;

    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert_eq!(
        applier.seen,
        vec![
            "canopy.dev/PolicyNode/p1/delete",
            "canopy.dev/PolicyNode/f1/delete",
            "canopy.dev/PolicyNode/p2/delete",
        ]
    );
    assert_eq!(out.snapshot.nodes.len(), 1);
    assert_eq!(out.marker, Some(marker("m1")));
    assert_eq!(out.names.get("").map(String::as_str), Some("org"));
}

#[tokio::test]
async fn resume_start_keeps_seeded_nodes() {
    let p = processor(StartMode::Resume(marker("m0")), seeded());
    let mut feed = ScriptedFeed::new([vec![Change::node("", &Node::container("org", "")).unwrap().with_marker("m1")]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;

    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert!(applier.seen.is_empty(), "{:?}", applier.seen);
    assert_eq!(out.snapshot, seeded());
    assert_eq!(out.marker, Some(marker("m1")));
}

#[tokio::test]
async fn fresh_group_without_root_is_fatal() {
    let p = processor(StartMode::Fresh, AllPolicies::default());
    let mut feed = ScriptedFeed::new([vec![Change::node("organizations/1/PolicyNode", &Node::leaf("p", "org")).unwrap()]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;
    assert!(matches!(out.result, Err(WatchError::MissingRoot { group: 1 })));
    assert!(applier.seen.is_empty());
}

#[tokio::test]
async fn groups_span_batches_and_markers_never_regress() {
    let p = processor(StartMode::Fresh, AllPolicies::default());
    let mut feed = ScriptedFeed::new([
        vec![Change::node("", &Node::container("org", "")).unwrap().continued(true).with_marker("m1")],
        vec![Change::node("organizations/1/PolicyNode", &Node::leaf("p", "org")).unwrap()],
        // no marker on this group: m1 must survive
        vec![Change::node("organizations/2/PolicyNode", &Node::leaf("q", "org")).unwrap()],
        // empty marker counts as absent
        vec![Change::removed("organizations/2/PolicyNode").with_marker(Vec::new())],
    ]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;

    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert_eq!(out.marker, Some(marker("m1")));
    assert_eq!(
        applier.seen,
        vec![
            "canopy.dev/PolicyNode/org/create",
            "canopy.dev/PolicyNode/p/create",
            "canopy.dev/PolicyNode/q/create",
            "canopy.dev/PolicyNode/q/delete",
        ]
    );
    let mut names: Vec<_> = out.snapshot.nodes.keys().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["org", "p"]);
}

#[tokio::test]
async fn unknown_delete_is_skipped_not_fatal() {
    let p = processor(StartMode::Resume(marker("m0")), seeded());
    let mut feed = ScriptedFeed::new([vec![Change::removed("organizations/42/PolicyNode").with_marker("m1")]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;
    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert!(applier.seen.is_empty());
    assert_eq!(out.marker, Some(marker("m1")));
}

const OLD_X: &str = "organizations/1/folders/1/projects/x/PolicyNode";
const NEW_X: &str = "organizations/1/folders/2/projects/x/PolicyNode";

fn two_folders() -> (AllPolicies, NameMap) {
    let seed = AllPolicies::from_nodes([
        Node::container("org", ""),
        Node::container("f1", "org"),
        Node::container("f2", "org"),
        Node::leaf("x", "f1"),
    ]);
    let names: NameMap = [
        ("", "org"),
        ("organizations/1/folders/1/PolicyNode", "f1"),
        ("organizations/1/folders/2/PolicyNode", "f2"),
        (OLD_X, "x"),
    ]
    .into_iter()
    .map(|(e, n)| (e.to_string(), n.to_string()))
    .collect();
    (seed, names)
}

#[tokio::test]
async fn moved_node_survives_late_removal_of_old_element() {
    let (seed, names) = two_folders();
    let p = processor(StartMode::Resume(marker("m0")), seed).with_names(names);
    let mut feed = ScriptedFeed::new([vec![
        Change::node(NEW_X, &Node::leaf("x", "f2")).unwrap().continued(true),
        Change::removed(OLD_X).with_marker("m1"),
    ]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;

    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert_eq!(applier.seen, vec!["canopy.dev/PolicyNode/x/update"]);
    assert_eq!(out.snapshot.nodes.get("x").map(|n| n.parent.as_str()), Some("f2"));
    assert_eq!(out.names.get(NEW_X).map(String::as_str), Some("x"));
    assert!(!out.names.contains_key(OLD_X));
}

#[tokio::test]
async fn moved_node_survives_removal_in_later_group() {
    let (seed, names) = two_folders();
    let p = processor(StartMode::Resume(marker("m0")), seed).with_names(names);
    let mut feed = ScriptedFeed::new([
        vec![Change::node(NEW_X, &Node::leaf("x", "f2")).unwrap().with_marker("m1")],
        vec![Change::removed(OLD_X).with_marker("m2")],
    ]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;

    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert_eq!(applier.seen, vec!["canopy.dev/PolicyNode/x/update"]);
    assert!(out.snapshot.nodes.contains_key("x"));
    assert_eq!(out.marker, Some(marker("m2")));
}

#[tokio::test]
async fn unknown_element_is_fatal() {
    let p = processor(StartMode::Resume(marker("m0")), seeded());
    let mut feed = ScriptedFeed::new([vec![Change::removed("teams/1/Widget")]]);
    let out = p.run(&mut feed, &mut Recorder::default()).await;
    assert!(matches!(out.result, Err(WatchError::UnknownElement { .. })));
}

#[tokio::test]
async fn invalid_group_keeps_previous_state() {
    let p = processor(StartMode::Resume(marker("m0")), seeded());
    // second root
    let mut feed = ScriptedFeed::new([vec![Change::node("organizations/9/PolicyNode", &Node::container("other", "")).unwrap()
        .with_marker("m1")]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;
    assert!(matches!(out.result, Err(WatchError::Invalid { group: 1, .. })));
    assert!(applier.seen.is_empty());
    assert_eq!(out.marker, Some(marker("m0")));
    assert_eq!(out.snapshot, seeded());
}

#[tokio::test]
async fn applier_error_aborts_and_keeps_marker() {
    let p = processor(StartMode::Fresh, AllPolicies::default());
    let mut feed = ScriptedFeed::new([
        vec![Change::node("", &Node::container("org", "")).unwrap().with_marker("m1")],
        vec![
            Change::node("organizations/1/PolicyNode", &Node::leaf("a", "org")).unwrap().continued(true),
            Change::node("organizations/2/PolicyNode", &Node::leaf("b", "org")).unwrap().with_marker("m2"),
        ],
    ]);
    let mut applier = Recorder { fail_on: Some("canopy.dev/PolicyNode/b/create".into()), ..Recorder::default() };
    let out = p.run(&mut feed, &mut applier).await;

    match out.result {
        Err(WatchError::Apply { action, group, .. }) => {
            assert_eq!(action, "canopy.dev/PolicyNode/b/create");
            assert_eq!(group, 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(out.marker, Some(marker("m1")));
    assert_eq!(out.snapshot.nodes.len(), 1);
    assert_eq!(applier.seen, vec!["canopy.dev/PolicyNode/org/create", "canopy.dev/PolicyNode/a/create"]);
}

#[tokio::test]
async fn cluster_policy_lifecycle() {
    let p = processor(StartMode::Resume(marker("m0")), seeded());
    let payload = serde_json::to_vec(&ClusterPolicy::new(serde_json::json!({"roles": 1}))).unwrap();
    let mut feed = ScriptedFeed::new([
        vec![Change::new("ClusterPolicy", ChangeState::Exists).with_payload(payload)],
        vec![Change::removed("ClusterPolicy")],
    ]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;
    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert_eq!(
        applier.seen,
        vec!["canopy.dev/ClusterPolicy/cluster-policy/create", "canopy.dev/ClusterPolicy/cluster-policy/delete"]
    );
    assert!(out.snapshot.cluster_policy.is_none());
}

struct NoSyncs;

impl SyncPlanner for NoSyncs {
    fn desired_syncs(&self, _current: &AllPolicies, _desired: &AllPolicies) -> SyncMap {
        SyncMap::default()
    }
}

#[tokio::test]
async fn sync_planner_drives_prephase() {
    let mut seed = seeded();
    seed.upsert_sync(SyncRegistration::new("stale"));
    let p = processor(StartMode::Resume(marker("m0")), seed)
        .with_sync_planner(NoSyncs);
    let mut feed = ScriptedFeed::new([vec![Change::removed("PolicyNode")]]);
    let mut applier = Recorder::default();
    let out = p.run(&mut feed, &mut applier).await;
    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);
    assert_eq!(applier.seen, vec!["canopy.dev/Sync/stale/delete"]);
    assert!(out.snapshot.syncs.is_empty());
}

#[tokio::test]
async fn checkpoints_follow_marker_advances() {
    let sink = MemSink::default();
    let p = processor(StartMode::Fresh, AllPolicies::default()).with_checkpoints(sink.clone());
    let mut feed = ScriptedFeed::new([
        vec![Change::node("", &Node::container("org", "")).unwrap().with_marker("m1")],
        vec![Change::node("organizations/1/PolicyNode", &Node::leaf("p", "org")).unwrap()],
        vec![Change::node("organizations/2/PolicyNode", &Node::leaf("q", "org")).unwrap().with_marker("m2")],
    ]);
    let out = p.run(&mut feed, &mut Recorder::default()).await;
    assert_eq!(out.result.unwrap(), StopReason::EndOfStream);

    let cps = sink.0.lock().unwrap();
    assert_eq!(cps.len(), 2);
    assert_eq!(cps[0].marker, marker("m1"));
    assert_eq!(cps[1].marker, marker("m2"));
    assert_eq!(cps[1].snapshot.nodes.len(), 3);
    assert_eq!(cps[1].names.len(), 3);
}

#[tokio::test]
async fn snapshot_handle_sees_commits() {
    let p = processor(StartMode::Fresh, AllPolicies::default());
    let handle = p.snapshot_handle();
    let mut feed = ScriptedFeed::new([vec![Change::node("", &Node::container("org", "")).unwrap()]]);
    let out = p.run(&mut feed, &mut Recorder::default()).await;
    assert!(out.result.is_ok());
    assert_eq!(handle.epoch(), 1);
    assert!(handle.current().nodes.contains_key("org"));
}

#[tokio::test]
async fn cancel_stops_a_pending_receive() {
    let mut p = processor(StartMode::Fresh, AllPolicies::default());
    let cancel = p.cancel_handle().unwrap();
    let mut feed = ScriptedFeed::new([vec![Change::node("", &Node::container("org", "")).unwrap().with_marker("m1")]])
        .hold_open();
    let task = tokio::spawn(async move {
        let out = p.run(&mut feed, &mut Recorder::default()).await;
        (out, feed.was_cancelled())
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let (out, feed_cancelled) = task.await.unwrap();
    assert_eq!(out.result.unwrap(), StopReason::Cancelled);
    assert!(feed_cancelled);
    assert_eq!(out.marker, Some(marker("m1")));
}

#[tokio::test(start_paused = true)]
async fn idle_feed_times_out_cleanly() {
    let cfg = WatchConfig::default().with_idle_timeout(Duration::from_secs(30));
    let p = Processor::new(ActionFactories::planned(), StartMode::Fresh, AllPolicies::default(), cfg).unwrap();
    let mut feed = ScriptedFeed::default().hold_open();
    let out = p.run(&mut feed, &mut Recorder::default()).await;
    assert_eq!(out.result.unwrap(), StopReason::IdleTimeout);
    assert!(feed.was_cancelled());
}

#[tokio::test]
async fn transport_error_is_fatal_cancelled_is_clean() {
    let mut feed = ScriptedFeed::default();
    feed.push_error(FeedError::Transport("reset".into()));
    let out = processor(StartMode::Fresh, AllPolicies::default()).run(&mut feed, &mut Recorder::default()).await;
    assert!(matches!(out.result, Err(WatchError::Feed(FeedError::Transport(_)))));

    let mut feed = ScriptedFeed::default();
    feed.push_error(FeedError::Cancelled);
    let out = processor(StartMode::Fresh, AllPolicies::default()).run(&mut feed, &mut Recorder::default()).await;
    assert_eq!(out.result.unwrap(), StopReason::Cancelled);
}
