//! Notification rows and the real-time pushes that accompany them, plus
//! privacy-aware fan-out of new posts.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::db::{NewNotification, PostRow};
use crate::event;
use crate::server::SharedState;
use crate::UserId;

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    id: i64,
    #[serde(rename = "type")]
    kind: &'a str,
    title: &'a str,
    message: &'a str,
    related_id: Option<i64>,
    related_type: Option<&'a str>,
    actor_id: Option<UserId>,
}

#[derive(Debug, Serialize)]
struct UnreadCount {
    unread_count: i64,
}

#[derive(Debug, Serialize)]
pub struct PostPayload<'a> {
    pub id: i64,
    pub user_id: UserId,
    pub author_username: &'a str,
    pub content: &'a str,
    pub privacy: i64,
    pub created_at: &'a str,
}

/// Store a notification, push it to its owner, then push the new unread count.
pub fn notify_user(state: &SharedState, n: NewNotification) -> Result<i64> {
    let id = state
        .db
        .lock()
        .insert_notification(&n)
        .context("insert notification")?;
    state.broadcaster.send_to_user(
        n.user_id,
        &n.kind,
        &NotificationPayload {
            id,
            kind: &n.kind,
            title: &n.title,
            message: &n.message,
            related_id: n.related_id,
            related_type: n.related_type.as_deref(),
            actor_id: n.actor_id,
        },
    );
    push_unread_count(state, n.user_id)?;
    Ok(id)
}

/// Push the user's current unread notification count.
pub fn push_unread_count(state: &SharedState, user_id: UserId) -> Result<()> {
    let unread_count = state
        .db
        .lock()
        .unread_notification_count(user_id, None)
        .context("count unread notifications")?;
    state
        .broadcaster
        .send_to_user(user_id, event::NOTIFICATION_COUNT_UPDATE, &UnreadCount { unread_count });
    Ok(())
}

/// Tell a post's owner someone liked it. Self-likes are ignored.
pub fn post_liked(state: &SharedState, liker: UserId, owner: UserId, post_id: i64) -> Result<()> {
    if liker == owner {
        return Ok(());
    }
    let username = actor_name(state, liker)?;
    notify_user(
        state,
        NewNotification {
            user_id: owner,
            kind: event::kind::POST_LIKE.to_string(),
            title: "Post Liked".to_string(),
            message: format!("{username} liked your post"),
            related_id: Some(post_id),
            related_type: Some("post".to_string()),
            actor_id: Some(liker),
        },
    )?;
    Ok(())
}

/// Record a message the receiver could not get live. Reconnect catch-up
/// summarizes these. Only the unread count is pushed: a `new_message`
/// notification event would collide with the chat event of that name.
pub fn message_waiting(state: &SharedState, sender: UserId, receiver: UserId, message_id: i64) -> Result<()> {
    let username = actor_name(state, sender)?;
    state
        .db
        .lock()
        .insert_notification(&NewNotification {
            user_id: receiver,
            kind: event::kind::NEW_MESSAGE.to_string(),
            title: "New Message".to_string(),
            message: format!("{username} sent you a message"),
            related_id: Some(message_id),
            related_type: Some("message".to_string()),
            actor_id: Some(sender),
        })
        .context("insert notification")?;
    push_unread_count(state, receiver)
}

/// Push a new post to every online user allowed to see it, author excluded.
/// Returns how many users received it.
pub fn fan_out_post(state: &SharedState, post: &PostRow, author_username: &str) -> usize {
    let payload = PostPayload {
        id: post.id,
        user_id: post.user_id,
        author_username,
        content: &post.content,
        privacy: post.privacy.level(),
        created_at: &post.created_at,
    };
    let candidates: Vec<UserId> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| *id != post.user_id)
        .collect();
    let audience: Vec<UserId> = {
        let db = state.db.lock();
        candidates
            .into_iter()
            .filter(|viewer| match db.can_view_post(*viewer, post.user_id, post.privacy) {
                Ok(visible) => visible,
                Err(e) => {
                    tracing::error!(viewer, post_id = post.id, "Visibility check failed: {e}");
                    false
                }
            })
            .collect()
    };
    state.broadcaster.send_to_users(audience, event::NEW_POST, &payload)
}

fn actor_name(state: &SharedState, user_id: UserId) -> Result<String> {
    state
        .db
        .lock()
        .username(user_id)
        .context("look up username")?
        .with_context(|| format!("user {user_id} not found"))
}
