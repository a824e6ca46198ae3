//! Coordinator
//!
//! One task that serializes registration, removal and the periodic snapshot
//! broadcast against the [`Registry`]. Connections talk to it through a
//! cloneable [`CoordinatorHandle`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};

use crate::error::{HubError, HubResult};
use crate::protocol::{ConnectionId, ServerMessage};
use crate::registry::{ConnectionHandle, Registry};
use crate::stats::CoordinatorStats;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events processed by the coordinator, one at a time.
#[derive(Debug)]
pub enum CoordinatorEvent {
    Register {
        handle: ConnectionHandle,
        respond_to: oneshot::Sender<HubResult<()>>,
    },
    Unregister {
        id: ConnectionId,
    },
}

/// Outcome of one snapshot broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Coordinator {
    registry: Arc<Registry>,
    events: mpsc::Receiver<CoordinatorEvent>,
    tick_interval: Duration,
    stats: Arc<CoordinatorStats>,
}

impl Coordinator {
    /// Start the coordinator task and return a handle to it.
    pub fn spawn(registry: Arc<Registry>, tick_interval: Duration) -> CoordinatorHandle {
        let (sender, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stats = Arc::new(CoordinatorStats::new());

        let coordinator = Self {
            registry,
            events,
            tick_interval,
            stats: stats.clone(),
        };
        tokio::spawn(coordinator.run());

        CoordinatorHandle { sender, stats }
    }

    async fn run(mut self) {
        info!(tick_ms = self.tick_interval.as_millis() as u64, "Coordinator started");

        let mut ticker = interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(CoordinatorEvent::Register { handle, respond_to }) => {
                        let result = self.handle_register(handle).await;
                        let _ = respond_to.send(result);
                    }
                    Some(CoordinatorEvent::Unregister { id }) => {
                        self.handle_unregister(&id).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let report = broadcast_snapshot(&self.registry).await;
                    self.stats
                        .record_tick(report.delivered as u64, report.dropped as u64);
                    trace!(
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "Tick broadcast"
                    );
                }
            }
        }

        info!("Coordinator shutting down");
    }

    async fn handle_register(&self, handle: ConnectionHandle) -> HubResult<()> {
        let id = handle.id();
        self.registry.admit(handle.clone()).await?;
        self.stats.record_register();
        info!(conn_id = %id, "Client registered");

        // Taken after admission so the new client sees itself.
        let snapshot = self.registry.snapshot().await;
        if !handle.offer(ServerMessage::Init(snapshot)) {
            warn!(conn_id = %id, "Could not queue init snapshot");
        }
        Ok(())
    }

    async fn handle_unregister(&self, id: &ConnectionId) {
        let removed = self.registry.remove(id).await;
        self.stats.record_unregister(removed);
        if removed {
            info!(conn_id = %id, "Client unregistered");
        } else {
            debug!(conn_id = %id, "Unregister for unknown connection ignored");
        }
    }
}

/// Offer the current snapshot to every registered mailbox without waiting.
///
/// Full mailboxes lose this tick's message; nothing is retried.
pub async fn broadcast_snapshot(registry: &Registry) -> BroadcastReport {
    let snapshot = registry.snapshot().await;
    let msg = ServerMessage::SyncData(snapshot);

    let mut report = BroadcastReport::default();
    for handle in registry.handles().await {
        if handle.offer(msg.clone()) {
            report.delivered += 1;
        } else {
            debug!(conn_id = %handle.id(), "Mailbox full, dropping sync_data");
            report.dropped += 1;
        }
    }
    report
}

/// Cloneable entry point into the coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorEvent>,
    stats: Arc<CoordinatorStats>,
}

impl CoordinatorHandle {
    /// Admit a connection. Resolves once it is in the registry and its init
    /// snapshot has been queued.
    pub async fn register(&self, handle: ConnectionHandle) -> HubResult<()> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(CoordinatorEvent::Register { handle, respond_to })
            .await
            .map_err(|_| HubError::CoordinatorGone)?;
        response.await.map_err(|_| HubError::CoordinatorGone)?
    }

    pub async fn unregister(&self, id: ConnectionId) {
        if self
            .sender
            .send(CoordinatorEvent::Unregister { id })
            .await
            .is_err()
        {
            warn!(conn_id = %id, "Coordinator gone, unregister dropped");
        }
    }

    pub fn stats(&self) -> &Arc<CoordinatorStats> {
        &self.stats
    }
}
