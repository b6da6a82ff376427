//! Canopy watch: consume a change feed, keep the committed policy snapshot and
//! push the ordered reconcile actions for each atomic group through an applier.

#![forbid(unsafe_code)]

pub mod config;
pub mod element;
pub mod feed;
pub mod processor;
pub mod snapshot;

pub use config::WatchConfig;
pub use element::{classify, ElementKind};
pub use feed::{Change, ChangeBatch, ChangeFeed, ChangeState, FeedError, ScriptedFeed, StreamFeed};
pub use processor::{
    CancelHandle, CheckpointSink, Processor, RetainSyncs, RunOutcome, StartMode, State, StopReason, SyncPlanner,
    WatchError,
};
pub use snapshot::SnapshotHandle;
