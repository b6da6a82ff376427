//! Read side of the processor: the last committed snapshot plus a commit epoch.

use std::sync::Arc;

use arc_swap::ArcSwap;
use canopy_core::AllPolicies;
use tokio::sync::watch;

/// Handle for readers to access the committed snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct SnapshotHandle {
    snap: Arc<ArcSwap<AllPolicies>>,
    epoch_rx: watch::Receiver<u64>,
}

impl SnapshotHandle {
    pub fn current(&self) -> Arc<AllPolicies> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
    pub fn epoch(&self) -> u64 { *self.epoch_rx.borrow() }
}

/// Writer half, owned by the processor.
pub(crate) struct Publisher {
    snap: Arc<ArcSwap<AllPolicies>>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
    epoch: u64,
}

impl Publisher {
    pub(crate) fn new(initial: &AllPolicies) -> Self {
        let snap = Arc::new(ArcSwap::from_pointee(initial.clone()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self { snap, epoch_tx, epoch_rx, epoch: 0 }
    }

    pub(crate) fn handle(&self) -> SnapshotHandle {
        SnapshotHandle { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_rx.clone() }
    }

    pub(crate) fn publish(&mut self, next: &AllPolicies) -> u64 {
        self.epoch = self.epoch.saturating_add(1);
        self.snap.store(Arc::new(next.clone()));
        // no subscribers is fine
        let _ = self.epoch_tx.send(self.epoch);
        self.epoch
    }
}
