//! Reconnect catch-up.
//!
//! Runs once right after a connection registers. Unread direct messages are
//! replayed oldest first and marked read as they go out; unread
//! `new_message` notifications are collapsed into a single summary.
//!
//! Registration and the backlog cutoff are taken under the storage lock,
//! which is also held while a sender writes a message and looks up the
//! receiver. A message is therefore either in the backlog or routed live to
//! the new connection, never both.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::messaging::DirectMessagePayload;
use crate::db::timestamp;
use crate::event;
use crate::registry::ConnectionHandle;
use crate::server::SharedState;
use crate::UserId;

/// How long one backlog push may wait for queue space.
const BACKLOG_PUSH_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatchupReport {
    /// Messages pushed onto the connection.
    pub delivered: usize,
    /// Messages pushed but not marked read.
    pub mark_failures: usize,
    /// Unread notification count reported in the summary (0 = none sent).
    pub summarized: i64,
}

#[derive(Debug, Serialize)]
struct OfflineSummary {
    count: i64,
    message: String,
    timestamp: String,
}

/// Register `handle` for `user_id` and return the newest direct message id
/// at that moment. `None` means the cutoff could not be read.
pub fn register(state: &SharedState, user_id: UserId, handle: &ConnectionHandle) -> Option<i64> {
    let db = state.db.lock();
    let cutoff = match db.latest_direct_message_id() {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!(user_id, "Failed to read backlog cutoff: {e}");
            None
        }
    };
    state.registry.register(user_id, handle.clone());
    cutoff
}

/// Replay unread messages with ids up to `cutoff` (all of them when `None`).
pub async fn deliver_backlog(
    state: &SharedState,
    user_id: UserId,
    handle: &ConnectionHandle,
    cutoff: Option<i64>,
) -> CatchupReport {
    let mut report = CatchupReport::default();

    let backlog = match state.db.lock().unread_direct_messages(user_id) {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(user_id, "Failed to load unread messages: {e}");
            Vec::new()
        }
    };

    for row in backlog.into_iter().filter(|row| cutoff.is_none_or(|max| row.id <= max)) {
        let message_id = row.id;
        let payload = DirectMessagePayload::from(row);
        if let Err(e) = handle
            .push_waiting(event::DIRECT_MESSAGE, &payload, BACKLOG_PUSH_DEADLINE)
            .await
        {
            tracing::warn!(user_id, message_id, "Catch-up stopped: {e}");
            return report;
        }
        report.delivered += 1;
        if let Err(e) = state.db.lock().mark_direct_message_read(message_id, Utc::now()) {
            tracing::error!(user_id, message_id, "Failed to mark message read: {e}");
            report.mark_failures += 1;
        }
    }

    let unread = match state
        .db
        .lock()
        .unread_notification_count(user_id, Some(event::kind::NEW_MESSAGE))
    {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(user_id, "Failed to count message notifications: {e}");
            0
        }
    };
    if unread > 0 {
        let summary = OfflineSummary {
            count: unread,
            message: format!("You have {unread} new message(s) while you were offline"),
            timestamp: timestamp(Utc::now()),
        };
        if handle.push(event::OFFLINE_MESSAGES_NOTIFICATION, &summary).is_ok() {
            report.summarized = unread;
            if let Err(e) = state
                .db
                .lock()
                .mark_notifications_read(user_id, Some(event::kind::NEW_MESSAGE))
            {
                tracing::error!(user_id, "Failed to mark message notifications read: {e}");
            }
        }
    }

    if report.delivered > 0 || report.summarized > 0 {
        tracing::info!(user_id, delivered = report.delivered, summarized = report.summarized, "Catch-up delivered");
    }
    report
}
