//! Connection Registry
//!
//! Tracks every live connection's latest cursor and the handle used to reach
//! its mailbox. Both maps sit behind one lock and are only touched through the
//! whole-operation methods below, so an ID is in the cursor map exactly when it
//! is in the handle map.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{HubError, HubResult};
use crate::mailbox::Mailbox;
use crate::protocol::{ConnectionId, CursorState, ServerMessage, Snapshot};

/// Server-side handle for one client connection.
///
/// The registry only ever enqueues into the mailbox; transport I/O belongs to
/// the connection's reader and writer.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    mailbox: Mailbox,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, mailbox: Mailbox) -> Self {
        Self { id, mailbox }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Non-blocking enqueue; false means the message was dropped.
    pub fn offer(&self, msg: ServerMessage) -> bool {
        self.mailbox.offer(msg)
    }
}

#[derive(Debug, Default)]
struct Entries {
    cursors: HashMap<ConnectionId, CursorState>,
    handles: HashMap<ConnectionId, ConnectionHandle>,
}

/// Shared map of live connections. Writers are exclusive; snapshots may run
/// concurrently with each other.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<Entries>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection with a zero-valued cursor.
    pub async fn admit(&self, handle: ConnectionHandle) -> HubResult<()> {
        let id = handle.id();
        let mut entries = self.entries.write().await;
        if entries.handles.contains_key(&id) {
            return Err(HubError::DuplicateConnection(id.to_string()));
        }
        entries.cursors.insert(id, CursorState::default());
        entries.handles.insert(id, handle);
        Ok(())
    }

    /// Remove a connection and close its mailbox.
    ///
    /// Returns whether the connection was present; removing an unknown ID is
    /// a no-op.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.cursors.remove(id);
            entries.handles.remove(id)
        };
        match removed {
            Some(handle) => {
                handle.mailbox().close();
                true
            }
            None => false,
        }
    }

    /// Replace a connection's cursor. Dropped if the connection is gone.
    pub async fn update(&self, id: &ConnectionId, state: CursorState) -> bool {
        let mut entries = self.entries.write().await;
        match entries.cursors.get_mut(id) {
            Some(cursor) => {
                *cursor = state;
                true
            }
            None => {
                debug!(conn_id = %id, "Dropping update for unregistered connection");
                false
            }
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let entries = self.entries.read().await;
        Snapshot::new(entries.cursors.clone())
    }

    /// Handles of every registered connection, copied out of the lock.
    pub async fn handles(&self) -> Vec<ConnectionHandle> {
        let entries = self.entries.read().await;
        entries.handles.values().cloned().collect()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.read().await.handles.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{MailboxReceiver, mailbox};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn new_handle() -> (ConnectionHandle, MailboxReceiver) {
        let (tx, rx) = mailbox(4);
        (ConnectionHandle::new(ConnectionId::new(), tx), rx)
    }

    async fn key_sets_match(registry: &Registry) -> bool {
        let entries = registry.entries.read().await;
        let cursors: HashSet<_> = entries.cursors.keys().collect();
        let handles: HashSet<_> = entries.handles.keys().collect();
        cursors == handles
    }

    #[tokio::test]
    async fn admit_inserts_default_cursor() {
        let registry = Registry::new();
        let (handle, _rx) = new_handle();
        let id = handle.id();

        registry.admit(handle).await.unwrap();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&id), Some(&CursorState::new(0.0, 0.0, "")));
        assert!(registry.contains(&id).await);
    }

    #[tokio::test]
    async fn admit_rejects_duplicate_id() {
        let registry = Registry::new();
        let (handle, _rx) = new_handle();
        registry.admit(handle.clone()).await.unwrap();

        let err = registry.admit(handle).await.unwrap_err();
        assert!(matches!(err, HubError::DuplicateConnection(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn update_overwrites_whole_state() {
        let registry = Registry::new();
        let (handle, _rx) = new_handle();
        let id = handle.id();
        registry.admit(handle).await.unwrap();

        assert!(registry.update(&id, CursorState::new(1.0, 2.0, "first")).await);
        assert!(registry.update(&id, CursorState::new(3.0, 4.0, "a")).await);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.get(&id), Some(&CursorState::new(3.0, 4.0, "a")));
    }

    #[tokio::test]
    async fn update_after_remove_is_dropped() {
        let registry = Registry::new();
        let (handle, _rx) = new_handle();
        let id = handle.id();
        registry.admit(handle).await.unwrap();

        assert!(registry.remove(&id).await);
        assert!(!registry.update(&id, CursorState::new(5.0, 5.0, "ghost")).await);

        let snapshot = registry.snapshot().await;
        assert!(!snapshot.contains(&id));
        assert!(key_sets_match(&registry).await);
    }

    #[tokio::test]
    async fn remove_closes_mailbox_once() {
        let registry = Registry::new();
        let (handle, mut rx) = new_handle();
        let id = handle.id();
        registry.admit(handle).await.unwrap();

        assert!(registry.remove(&id).await);
        assert!(!registry.remove(&id).await);
        assert!(rx.is_closed());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_writes() {
        let registry = Registry::new();
        let (handle, _rx) = new_handle();
        let id = handle.id();
        registry.admit(handle).await.unwrap();

        let before = registry.snapshot().await;
        registry
            .update(&id, CursorState::new(9.0, 9.0, "later"))
            .await;

        assert_eq!(before.get(&id), Some(&CursorState::default()));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Admit,
        Remove(usize),
        DuplicateRemove(usize),
        Update(usize, f64, f64),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Admit),
            any::<usize>().prop_map(Op::Remove),
            any::<usize>().prop_map(Op::DuplicateRemove),
            (any::<usize>(), -1e6..1e6f64, -1e6..1e6f64)
                .prop_map(|(i, x, y)| Op::Update(i, x, y)),
        ]
    }

    proptest! {
        #[test]
        fn key_sets_stay_equal_for_any_admit_remove_sequence(
            ops in prop::collection::vec(arb_op(), 0..64)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let registry = Registry::new();
                let mut live: Vec<ConnectionId> = Vec::new();
                let mut gone: Vec<ConnectionId> = Vec::new();
                let mut receivers = Vec::new();

                for op in ops {
                    match op {
                        Op::Admit => {
                            let (handle, rx) = new_handle();
                            live.push(handle.id());
                            receivers.push(rx);
                            prop_assert!(registry.admit(handle).await.is_ok());
                        }
                        Op::Remove(i) if !live.is_empty() => {
                            let id = live.remove(i % live.len());
                            prop_assert!(registry.remove(&id).await);
                            gone.push(id);
                        }
                        Op::DuplicateRemove(i) if !gone.is_empty() => {
                            let id = gone[i % gone.len()];
                            prop_assert!(!registry.remove(&id).await);
                        }
                        Op::Update(i, x, y) => {
                            if !live.is_empty() {
                                let id = live[i % live.len()];
                                prop_assert!(registry.update(&id, CursorState::new(x, y, "n")).await);
                            }
                            if !gone.is_empty() {
                                let id = gone[i % gone.len()];
                                prop_assert!(!registry.update(&id, CursorState::new(x, y, "ghost")).await);
                            }
                        }
                        _ => {}
                    }
                    prop_assert!(key_sets_match(&registry).await);
                }

                prop_assert_eq!(registry.len().await, live.len());
                let snapshot = registry.snapshot().await;
                prop_assert_eq!(snapshot.len(), live.len());
                for id in &live {
                    prop_assert!(snapshot.contains(id));
                }
                for id in &gone {
                    prop_assert!(!snapshot.contains(id));
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }

    #[tokio::test]
    async fn concurrent_admit_remove_keeps_maps_in_step() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();

        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = new_handle();
                let id = handle.id();
                registry.admit(handle).await.unwrap();
                registry.update(&id, CursorState::new(1.0, 1.0, "x")).await;
                registry.remove(&id).await;
                registry.update(&id, CursorState::new(2.0, 2.0, "y")).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(registry.is_empty().await);
        assert!(key_sets_match(&registry).await);
        assert!(registry.snapshot().await.is_empty());
    }
}
