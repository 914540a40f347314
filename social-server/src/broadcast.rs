//! Broadcast engine: targeted, group-scoped and global delivery.
//!
//! Delivery is best-effort. A push that fails because the peer's queue is
//! closed or full is treated as a disconnect: the registry entry is reaped
//! and the connection is told to close, so its session runs the usual
//! offline cleanup. Callers never see an error.

use std::sync::Arc;

use serde::Serialize;

use crate::db::SharedDb;
use crate::event;
use crate::registry::{ConnectionHandle, Registry};
use crate::UserId;

/// Outcome of a single targeted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Offline,
    /// The connection was dead or stalled and has been removed.
    Dropped,
}

pub struct Broadcaster {
    registry: Arc<Registry>,
    db: SharedDb,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, db: SharedDb) -> Self {
        Self { registry, db }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn send_to_user<T: Serialize>(&self, user_id: UserId, kind: &str, data: &T) -> Delivery {
        let Some(line) = encode(kind, data) else {
            return Delivery::Dropped;
        };
        self.deliver_line(user_id, kind, line)
    }

    /// Send to one specific connection of `user_id`, looked up earlier.
    /// Reaps it like any other target if it cannot keep up.
    pub fn send_to_connection<T: Serialize>(
        &self,
        user_id: UserId,
        handle: &ConnectionHandle,
        kind: &str,
        data: &T,
    ) -> Delivery {
        let Some(line) = encode(kind, data) else {
            return Delivery::Dropped;
        };
        if self.push_or_reap(user_id, handle, kind, line) {
            Delivery::Delivered
        } else {
            Delivery::Dropped
        }
    }

    /// Send to every accepted member of `group_id` except `exclude`.
    /// Membership is read from storage on each call. Returns deliveries made.
    pub fn send_to_group<T: Serialize>(
        &self,
        group_id: i64,
        kind: &str,
        data: &T,
        exclude: Option<UserId>,
    ) -> usize {
        let members = match self.db.lock().group_members(group_id) {
            Ok(members) => members,
            Err(e) => {
                tracing::error!(group_id, "Failed to load group members: {e}");
                return 0;
            }
        };
        self.send_to_users(members.into_iter().filter(|id| Some(*id) != exclude), kind, data)
    }

    /// Send to an explicit audience. Returns deliveries made.
    pub fn send_to_users<I, T>(&self, users: I, kind: &str, data: &T) -> usize
    where
        I: IntoIterator<Item = UserId>,
        T: Serialize,
    {
        let Some(line) = encode(kind, data) else {
            return 0;
        };
        users
            .into_iter()
            .filter(|id| self.deliver_line(*id, kind, line.clone()) == Delivery::Delivered)
            .count()
    }

    /// Send to everyone online. Reserved for globally visible events.
    pub fn send_to_all<T: Serialize>(&self, kind: &str, data: &T) -> usize {
        let Some(line) = encode(kind, data) else {
            return 0;
        };
        let mut delivered = 0;
        for (user_id, handle) in self.registry.snapshot() {
            if self.push_or_reap(user_id, &handle, kind, line.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver_line(&self, user_id: UserId, kind: &str, line: String) -> Delivery {
        let Some(handle) = self.registry.get(user_id) else {
            return Delivery::Offline;
        };
        if self.push_or_reap(user_id, &handle, kind, line) {
            Delivery::Delivered
        } else {
            Delivery::Dropped
        }
    }

    fn push_or_reap(&self, user_id: UserId, handle: &ConnectionHandle, kind: &str, line: String) -> bool {
        match handle.push_line(line) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id, conn_id = handle.id(), kind, "Dropping connection: {e}");
                if self.registry.unregister(user_id, handle) {
                    handle.close();
                }
                false
            }
        }
    }
}

fn encode<T: Serialize>(kind: &str, data: &T) -> Option<String> {
    match event::encode(kind, data) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!(kind, "Failed to encode event: {e}");
            None
        }
    }
}
