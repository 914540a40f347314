//! Connection registry: which users are online and how to reach them.
//!
//! Each user holds at most one live connection. Registering a second one
//! replaces the first, which is abandoned rather than closed; its own
//! cleanup later finds it is no longer the registered entry and leaves the
//! table alone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crate::event;
use crate::UserId;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Why a push onto a connection's queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
    #[error("event could not be serialized")]
    Encode,
}

/// Sending half of a connection's outbound queue, tagged with a
/// process-unique id so two handles can be compared for identity.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<String>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            close: Arc::new(Notify::new()),
        }
    }

    /// Handle plus its receiving end, for connection tasks and tests.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.id == other.id
    }

    /// Queue an already-encoded line. Never waits.
    pub fn push_line(&self, line: String) -> Result<(), PushError> {
        self.tx.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Encode and queue one event.
    pub fn push<T: Serialize>(&self, kind: &str, data: &T) -> Result<(), PushError> {
        let line = event::encode(kind, data).map_err(|e| {
            tracing::error!(kind, "Failed to encode event: {e}");
            PushError::Encode
        })?;
        self.push_line(line)
    }

    /// Encode and queue one event, waiting up to `deadline` for queue space.
    /// Used for bulk deliveries that would otherwise overrun the queue.
    pub async fn push_waiting<T: Serialize>(
        &self,
        kind: &str,
        data: &T,
        deadline: Duration,
    ) -> Result<(), PushError> {
        let line = event::encode(kind, data).map_err(|e| {
            tracing::error!(kind, "Failed to encode event: {e}");
            PushError::Encode
        })?;
        self.tx.send_timeout(line, deadline).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => PushError::Full,
            SendTimeoutError::Closed(_) => PushError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Ask the connection task to shut down. The request is remembered if
    /// the task is not currently waiting for it.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn close_requested(&self) {
        self.close.notified().await;
    }
}

#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the user's connection, returning the one it replaced.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let conn_id = handle.id;
        let previous = self.connections.write().insert(user_id, handle);
        if let Some(ref old) = previous {
            tracing::info!(user_id, conn_id, replaced = old.id, "Connection replaced");
        }
        previous
    }

    /// Remove the user's entry only if it is still `handle`.
    /// Returns whether anything was removed.
    pub fn unregister(&self, user_id: UserId, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write();
        match connections.get(&user_id) {
            Some(current) if current.same_connection(handle) => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections.read().contains_key(&user_id)
    }

    /// The members of `candidates` that are online right now.
    pub fn online_subset<I>(&self, candidates: I) -> HashSet<UserId>
    where
        I: IntoIterator<Item = UserId>,
    {
        let connections = self.connections.read();
        candidates
            .into_iter()
            .filter(|id| connections.contains_key(id))
            .collect()
    }

    pub fn get(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.read().get(&user_id).cloned()
    }

    /// Copy of every entry, so callers never send while holding the lock.
    pub fn snapshot(&self) -> Vec<(UserId, ConnectionHandle)> {
        self.connections
            .read()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister() {
        let registry = Registry::new();
        let (handle, _rx) = ConnectionHandle::channel(4);
        assert!(registry.register(1, handle.clone()).is_none());
        assert!(registry.is_online(1));
        assert!(registry.unregister(1, &handle));
        assert!(!registry.is_online(1));
        assert!(!registry.unregister(1, &handle));
    }

    #[test]
    fn newer_connection_wins_and_stale_unregister_is_ignored() {
        let registry = Registry::new();
        let (old, _old_rx) = ConnectionHandle::channel(4);
        let (new, mut new_rx) = ConnectionHandle::channel(4);
        registry.register(1, old.clone());
        let replaced = registry.register(1, new.clone()).unwrap();
        assert!(replaced.same_connection(&old));

        assert!(!registry.unregister(1, &old));
        assert!(registry.is_online(1));

        registry.get(1).unwrap().push(event::PONG, &"x").unwrap();
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn online_subset_filters_candidates() {
        let registry = Registry::new();
        let (a, _ra) = ConnectionHandle::channel(1);
        let (b, _rb) = ConnectionHandle::channel(1);
        registry.register(1, a);
        registry.register(3, b);
        let online = registry.online_subset([1, 2, 3, 4]);
        assert_eq!(online, HashSet::from([1, 3]));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn push_reports_full_and_closed() {
        let (handle, rx) = ConnectionHandle::channel(1);
        handle.push_line("a".into()).unwrap();
        assert_eq!(handle.push_line("b".into()), Err(PushError::Full));
        drop(rx);
        assert_eq!(handle.push_line("c".into()), Err(PushError::Closed));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn close_request_is_not_lost() {
        let (handle, _rx) = ConnectionHandle::channel(1);
        handle.clone().close();
        tokio::time::timeout(Duration::from_secs(1), handle.close_requested())
            .await
            .unwrap();
    }

    #[test]
    fn handles_have_distinct_ids() {
        let (a, _ra) = ConnectionHandle::channel(1);
        let (b, _rb) = ConnectionHandle::channel(1);
        assert_ne!(a.id(), b.id());
        assert!(a.same_connection(&a.clone()));
    }
}
