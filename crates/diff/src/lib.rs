//! Canopy diff: reconcile plans between two policy snapshots.
//!
//! - [`Differ::diff`]: ordered node/cluster-policy/sync-upsert actions
//! - [`sync_deletes`] / [`sync_reductions`]: the watch-registration pre-phase
//! - [`reduce`] / [`syncs_equal`]: GVK-set algebra behind the pre-phase

#![forbid(unsafe_code)]

pub mod action;
pub mod differ;
pub mod sync;

pub use action::{action_id, Action, ActionFactories, ActionFactory, Applier, ExecutingApplier, PlanFactory, PlannedAction, Resource, Verb, GROUP};
pub use differ::{depths, sync_deletes, sync_reductions, DiffOptions, Differ, PayloadEq, Plan, PlanSummary};
pub use sync::{reduce, syncs_equal};
