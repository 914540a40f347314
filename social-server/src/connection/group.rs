//! Group chat.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::helpers::decode;
use super::LiveSession;
use crate::db::timestamp;
use crate::event;
use crate::server::SharedState;
use crate::UserId;

#[derive(Debug, Deserialize)]
struct GroupMessageIn {
    group_id: i64,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct GroupMessagePayload {
    id: i64,
    group_id: i64,
    sender_id: UserId,
    username: String,
    content: String,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct GroupMessageNotification<'a> {
    group_id: i64,
    group_message_id: i64,
    sender_id: UserId,
    sender_username: &'a str,
    content: &'a str,
    created_at: &'a str,
}

pub(super) fn handle_group_message(session: &LiveSession, data: Value) {
    let Some(req) = decode::<GroupMessageIn>(session, event::GROUP_MESSAGE, data) else {
        return;
    };
    let state = session.state();
    let sender = session.user_id();

    match state.with_db(|db| db.is_group_member(req.group_id, sender)) {
        Some(true) => {}
        Some(false) | None => {
            session.error("Not a group member");
            return;
        }
    }
    if req.content.trim().is_empty() {
        session.error("Message content cannot be empty");
        return;
    }

    let now = Utc::now();
    let Some((id, username)) = state.with_db(|db| {
        let id = db.insert_group_message(req.group_id, sender, &req.content, now)?;
        Ok((id, db.username(sender)?.unwrap_or_else(|| "Unknown".to_string())))
    }) else {
        session.error("Failed to save message");
        return;
    };

    let payload = GroupMessagePayload {
        id,
        group_id: req.group_id,
        sender_id: sender,
        username,
        content: req.content,
        created_at: timestamp(now),
    };

    state
        .broadcaster
        .send_to_group(payload.group_id, event::GROUP_MESSAGE, &payload, Some(sender));

    let bg_state = Arc::clone(state);
    let bg_payload = payload.clone();
    state.tasks.spawn("group_message_notification", async move {
        notify_online_members(&bg_state, &bg_payload)
    });

    session.reply(event::GROUP_MESSAGE_SENT, &payload);
}

/// Push a lightweight notification to every other member that is online.
fn notify_online_members(state: &SharedState, message: &GroupMessagePayload) -> anyhow::Result<()> {
    let members = state.db.lock().group_members(message.group_id)?;
    let online = state
        .registry
        .online_subset(members.into_iter().filter(|id| *id != message.sender_id));
    state.broadcaster.send_to_users(
        online,
        event::GROUP_MESSAGE_NOTIFICATION,
        &GroupMessageNotification {
            group_id: message.group_id,
            group_message_id: message.id,
            sender_id: message.sender_id,
            sender_username: &message.username,
            content: &message.content,
            created_at: &message.created_at,
        },
    );
    Ok(())
}
