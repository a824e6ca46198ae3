use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Ticks processed by the coordinator
    pub ticks: AtomicU64,
    /// Snapshot messages accepted into a mailbox
    pub delivered: AtomicU64,
    /// Snapshot messages dropped because a mailbox was full or closed
    pub dropped: AtomicU64,
    /// Connections admitted
    pub registered: AtomicU64,
    /// Connections actually removed from the registry
    pub removed: AtomicU64,
    /// Unregister events for connections that were already gone
    pub stale_unregisters: AtomicU64,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, delivered: u64, dropped: u64) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn record_register(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    /// `removed` is what `Registry::remove` reported.
    pub fn record_unregister(&self, removed: bool) {
        if removed {
            self.removed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stale_unregisters.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            registered: self.registered.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            stale_unregisters: self.stale_unregisters.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatsSnapshot {
    pub ticks: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub registered: u64,
    pub removed: u64,
    pub stale_unregisters: u64,
}
