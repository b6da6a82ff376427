use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use canopy_core::AllPolicies;
use canopy_diff::{Action, ActionFactories, Applier, DiffOptions, Differ, ExecutingApplier, Plan};
use canopy_persist::SqliteCheckpointStore;
use canopy_tree::Validator;
use canopy_watch::{
    config::parse_leaf_rule, Change, ChangeBatch, ChangeState, Processor, ScriptedFeed, StartMode, StopReason,
    WatchConfig,
};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "canopyctl", version, about = "Canopy policy hierarchy tool")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Sort equal-depth actions by name
    #[arg(long = "deterministic", action = ArgAction::SetTrue, global = true)]
    deterministic: bool,

    /// Leaf rule for non-root containers: permit | require-children
    #[arg(long = "leaf-rule", global = true)]
    leaf_rule: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a snapshot file (YAML or JSON) for hierarchy violations
    Validate {
        snapshot: PathBuf,
    },
    /// Print the ordered actions that turn CURRENT into DESIRED
    Plan {
        current: PathBuf,
        desired: PathBuf,
    },
    /// Feed a JSONL change log through the watch processor
    Replay {
        /// One batch per line: a change object or an array of them
        changes: PathBuf,
        /// Snapshot to start from (ignored with --resume when a checkpoint exists)
        #[arg(long = "seed")]
        seed: Option<PathBuf>,
        /// Continue from the latest checkpoint instead of wiping on the first group
        #[arg(long = "resume", action = ArgAction::SetTrue)]
        resume: bool,
        /// Write checkpoints to the SQLite store
        #[arg(long = "checkpoint", action = ArgAction::SetTrue)]
        checkpoint: bool,
        /// Checkpoint database (default: CANOPY_DB_PATH or ~/.canopy/canopy.db)
        #[arg(long = "db", env = "CANOPY_DB_PATH")]
        db: Option<String>,
        /// Checkpoint stream name
        #[arg(long = "stream", default_value = canopy_persist::DEFAULT_STREAM)]
        stream: String,
        /// Override CANOPY_IDLE_TIMEOUT_SECS
        #[arg(long = "idle-timeout")]
        idle_timeout: Option<u64>,
    },
    /// List stored checkpoints, newest first
    Checkpoints {
        #[arg(long = "db", env = "CANOPY_DB_PATH")]
        db: Option<String>,
        #[arg(long = "stream", default_value = canopy_persist::DEFAULT_STREAM)]
        stream: String,
        #[arg(long = "limit", default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("CANOPY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CANOPY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CANOPY_METRICS_ADDR; expected host:port");
        }
    }
}

/// Env config with CLI flags layered on top.
fn watch_config(cli: &Cli) -> Result<WatchConfig> {
    let mut cfg = WatchConfig::from_env();
    if cli.deterministic {
        cfg.deterministic = true;
    }
    if let Some(rule) = cli.leaf_rule.as_deref() {
        cfg.leaf_rule = parse_leaf_rule(rule).ok_or_else(|| anyhow!("unknown leaf rule {:?}", rule))?;
    }
    Ok(cfg)
}

/// Both sides must be valid hierarchies before they are diffed.
fn plan_snapshots(cfg: &WatchConfig, current: (&AllPolicies, &Path), desired: (&AllPolicies, &Path)) -> Result<Plan> {
    let validator = Validator::new().with_leaf_rule(cfg.leaf_rule.clone());
    validator
        .validate(&current.0.nodes)
        .with_context(|| format!("current snapshot {}", current.1.display()))?;
    validator
        .validate(&desired.0.nodes)
        .with_context(|| format!("desired snapshot {}", desired.1.display()))?;
    let opts = DiffOptions { deterministic: cfg.deterministic, ..DiffOptions::default() };
    Ok(Differ::new(ActionFactories::planned(), opts).plan(current.0, desired.0))
}

fn load_snapshot(path: &Path) -> Result<AllPolicies> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_snapshot(&raw, path.extension().and_then(|e| e.to_str()))
        .with_context(|| format!("parsing snapshot {}", path.display()))
}

fn parse_snapshot(raw: &str, ext: Option<&str>) -> Result<AllPolicies> {
    let snap = match ext {
        Some("json") => serde_json::from_str(raw)?,
        _ => serde_yaml::from_str(raw)?,
    };
    Ok(snap)
}

/// One line of a replay log.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeRecord {
    #[serde(default)]
    element: String,
    state: ChangeState,
    #[serde(default)]
    continued: bool,
    #[serde(default)]
    payload: Option<Json>,
    #[serde(default)]
    marker: Option<String>,
}

impl ChangeRecord {
    fn into_change(self) -> Result<Change> {
        let payload = match self.payload {
            Some(v) => serde_json::to_vec(&v)?,
            None => Vec::new(),
        };
        let mut c = Change::new(self.element, self.state).continued(self.continued).with_payload(payload);
        if let Some(m) = self.marker {
            c = c.with_marker(m.into_bytes());
        }
        Ok(c)
    }
}

fn parse_changes(raw: &str) -> Result<Vec<ChangeBatch>> {
    let mut batches = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = if line.starts_with('[') {
            serde_json::from_str::<Vec<ChangeRecord>>(line)
        } else {
            serde_json::from_str::<ChangeRecord>(line).map(|r| vec![r])
        };
        let records = parsed.with_context(|| format!("line {}", i + 1))?;
        let batch = records.into_iter().map(ChangeRecord::into_change).collect::<Result<Vec<_>>>()?;
        batches.push(batch);
    }
    Ok(batches)
}

/// Prints each action before running it.
struct EchoApplier {
    output: Output,
    inner: ExecutingApplier,
    applied: usize,
}

#[async_trait::async_trait]
impl Applier for EchoApplier {
    async fn apply(&mut self, action: &dyn Action) -> Result<()> {
        match self.output {
            Output::Human => println!("{}", action),
            Output::Json => println!("{}", action_json(action)),
        }
        self.inner.apply(action).await?;
        self.applied += 1;
        Ok(())
    }
}

fn action_json(a: &dyn Action) -> Json {
    json!({ "id": a.to_string(), "resource": a.resource(), "name": a.name(), "verb": a.verb() })
}

fn open_store(db: Option<&str>, stream: &str) -> Result<SqliteCheckpointStore> {
    let store = match db {
        Some(path) => SqliteCheckpointStore::open(path)?,
        None => SqliteCheckpointStore::open_default()?,
    };
    Ok(store.with_stream(stream))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = watch_config(&cli)?;

    match &cli.command {
        Commands::Validate { snapshot } => {
            info!(path = %snapshot.display(), "validate invoked");
            let snap = load_snapshot(snapshot)?;
            let res = Validator::new().with_leaf_rule(cfg.leaf_rule.clone()).validate(&snap.nodes);
            match cli.output {
                Output::Human => match &res {
                    Ok(()) => {
                        let root = snap.root().map(|n| n.name.as_str()).unwrap_or("-");
                        println!("ok: {} node(s), root {}", snap.nodes.len(), root);
                    }
                    Err(e) => println!("{}", e),
                },
                Output::Json => {
                    let violations: Vec<String> = match &res {
                        Ok(()) => Vec::new(),
                        Err(e) => e.violations.iter().map(|v| v.to_string()).collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&json!({ "valid": res.is_ok(), "violations": violations }))?);
                }
            }
            if res.is_err() {
                bail!("snapshot {} is invalid", snapshot.display());
            }
        }
        Commands::Plan { current, desired } => {
            info!(current = %current.display(), desired = %desired.display(), "plan invoked");
            let cur = load_snapshot(current)?;
            let want = load_snapshot(desired)?;
            let plan = plan_snapshots(&cfg, (&cur, current.as_path()), (&want, desired.as_path()))?;
            let summary = plan.summary();
            match cli.output {
                Output::Human => {
                    if plan.is_empty() {
                        println!("no changes");
                    }
                    for a in &plan.prephase {
                        println!("[sync] {}", a);
                    }
                    for a in &plan.actions {
                        println!("{}", a);
                    }
                    println!(
                        "{} create, {} update, {} delete, {} sync delete, {} sync reduction",
                        summary.creates, summary.updates, summary.deletes, summary.sync_deletes, summary.sync_reductions
                    );
                }
                Output::Json => {
                    let prephase: Vec<Json> = plan.prephase.iter().map(|a| action_json(a.as_ref())).collect();
                    let actions: Vec<Json> = plan.actions.iter().map(|a| action_json(a.as_ref())).collect();
                    let out = json!({ "prephase": prephase, "actions": actions, "summary": summary });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Replay { changes, seed, resume, checkpoint, db, stream, idle_timeout } => {
            info!(path = %changes.display(), resume, checkpoint, "replay invoked");
            let raw = std::fs::read_to_string(changes).with_context(|| format!("reading {}", changes.display()))?;
            let batches = parse_changes(&raw)?;
            counter!("replay_batches_total", batches.len() as u64);

            let mut cfg = cfg.clone();
            if let Some(secs) = idle_timeout {
                cfg.idle_timeout = Duration::from_secs(*secs);
            }

            let store = if *resume || *checkpoint { Some(open_store(db.as_deref(), stream)?) } else { None };
            let latest = match (&store, *resume) {
                (Some(s), true) => s.load_latest()?,
                _ => None,
            };
            let (start, snapshot, names) = match latest {
                Some(cp) => {
                    info!(marker = %cp.marker, ts = cp.ts, "resuming from checkpoint");
                    (StartMode::Resume(cp.marker), cp.snapshot, cp.names)
                }
                None => {
                    if *resume {
                        warn!(stream = %stream, "no checkpoint found; starting fresh");
                    }
                    let snap = match seed {
                        Some(p) => load_snapshot(p)?,
                        None => AllPolicies::default(),
                    };
                    (StartMode::Fresh, snap, Default::default())
                }
            };

            let mut processor = Processor::new(ActionFactories::planned(), start, snapshot, cfg)?.with_names(names);
            if let (Some(store), true) = (store, *checkpoint) {
                processor = processor.with_checkpoints(store);
            }
            if let Some(cancel) = processor.cancel_handle() {
                tokio::spawn(async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received; cancelling replay");
                        cancel.cancel();
                    }
                });
            }

            let mut feed = ScriptedFeed::new(batches);
            let mut applier = EchoApplier { output: cli.output, inner: ExecutingApplier, applied: 0 };
            let outcome = processor.run(&mut feed, &mut applier).await;
            let marker = outcome.marker.as_ref().map(|m| m.to_string());
            match cli.output {
                Output::Human => {
                    println!(
                        "{} action(s) applied; {} node(s); marker {}",
                        applier.applied,
                        outcome.snapshot.nodes.len(),
                        marker.as_deref().unwrap_or("-")
                    );
                }
                Output::Json => {
                    let summary = json!({
                        "applied": applier.applied,
                        "nodes": outcome.snapshot.nodes.len(),
                        "marker": marker,
                        "stopped": outcome.result.as_ref().ok().map(stop_label),
                        "error": outcome.result.as_ref().err().map(|e| e.to_string()),
                    });
                    println!("{}", serde_json::to_string(&summary)?);
                }
            }
            if let Err(e) = outcome.result {
                error!(error = %e, marker = ?marker, "replay aborted");
                return Err(e).context("replay aborted");
            }
        }
        Commands::Checkpoints { db, stream, limit } => {
            let store = open_store(db.as_deref(), stream)?;
            let rows = store.history(Some(*limit))?;
            match cli.output {
                Output::Human => {
                    if rows.is_empty() {
                        println!("no checkpoints for stream {}", stream);
                    }
                    for cp in &rows {
                        let when = chrono::DateTime::<chrono::Utc>::from_timestamp(cp.ts, 0)
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| cp.ts.to_string());
                        let cluster = cp.snapshot.cluster_policy.as_ref().map(|c| c.name.as_str());
                        println!(
                            "{}  {}  nodes={} syncs={} cluster-policy={}",
                            when,
                            cp.marker,
                            cp.snapshot.nodes.len(),
                            cp.snapshot.syncs.len(),
                            cluster.unwrap_or("-")
                        );
                    }
                }
                Output::Json => {
                    let out: Vec<Json> = rows
                        .iter()
                        .map(|cp| {
                            json!({
                                "marker": cp.marker.to_string(),
                                "ts": cp.ts,
                                "nodes": cp.snapshot.nodes.len(),
                                "syncs": cp.snapshot.syncs.len(),
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
    }

    Ok(())
}

fn stop_label(r: &StopReason) -> &'static str {
    match r {
        StopReason::EndOfStream => "end-of-stream",
        StopReason::Cancelled => "cancelled",
        StopReason::IdleTimeout => "idle-timeout",
    }
}
