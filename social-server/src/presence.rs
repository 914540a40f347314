//! Presence notifications.
//!
//! A user's presence is interesting to everyone on either side of an
//! accepted follow edge. The audience is recomputed from storage on every
//! announcement.

use std::sync::Arc;

use serde::Serialize;

use crate::broadcast::Broadcaster;
use crate::db::SharedDb;
use crate::event;
use crate::UserId;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PresencePayload {
    pub user_id: UserId,
}

pub struct PresenceNotifier {
    broadcaster: Arc<Broadcaster>,
    db: SharedDb,
}

impl PresenceNotifier {
    pub fn new(broadcaster: Arc<Broadcaster>, db: SharedDb) -> Self {
        Self { broadcaster, db }
    }

    /// Accepted followers of `user_id` plus the users it follows, ascending.
    pub fn interested_users(&self, user_id: UserId) -> Vec<UserId> {
        match self.db.lock().related_users(user_id) {
            Ok(related) => related.into_iter().collect(),
            Err(e) => {
                tracing::error!(user_id, "Failed to load relationships: {e}");
                Vec::new()
            }
        }
    }

    /// Tell every interested user that `user_id` came online or went offline.
    /// Returns the audience that was targeted (offline members included).
    pub fn announce(&self, user_id: UserId, online: bool) -> Vec<UserId> {
        let audience = self.interested_users(user_id);
        let kind = if online { event::USER_ONLINE } else { event::USER_OFFLINE };
        let delivered = self
            .broadcaster
            .send_to_users(audience.iter().copied(), kind, &PresencePayload { user_id });
        tracing::debug!(user_id, online, audience = audience.len(), delivered, "Presence announced");
        audience
    }

    /// Interested users that are online right now, ascending.
    pub fn snapshot(&self, user_id: UserId) -> Vec<UserId> {
        let interested = self.interested_users(user_id);
        let online = self.broadcaster.registry().online_subset(interested.iter().copied());
        interested.into_iter().filter(|id| online.contains(id)).collect()
    }
}
