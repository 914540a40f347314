//! Direct messaging: send, typing indicators, read receipts.
//!
//! [`send_direct_message`] and [`mark_message_read`] are shared with the
//! HTTP routes so both entry points persist and notify the same way.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::helpers::decode;
use super::LiveSession;
use crate::broadcast::Delivery;
use crate::db::{timestamp, DirectMessageRow};
use crate::event;
use crate::registry::ConnectionHandle;
use crate::server::SharedState;
use crate::UserId;

/// Why a chat action was refused. The message is what the client sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("Message content cannot be empty")]
    EmptyContent,
    #[error("Cannot send a message to yourself")]
    SelfMessage,
    #[error("Receiver not found")]
    UnknownReceiver,
    #[error("You can only message users you follow or who follow you")]
    NotAllowed,
    #[error("Message not found")]
    MessageNotFound,
    #[error("Failed to save message")]
    Storage,
}

/// Body of `direct_message`, `direct_message_sent` and `new_message` events.
#[derive(Debug, Clone, Serialize)]
pub struct DirectMessagePayload {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: String,
}

impl From<DirectMessageRow> for DirectMessagePayload {
    fn from(row: DirectMessageRow) -> Self {
        Self {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            username: row.sender_username,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

/// A stored direct message and the receiver's connection as it stood when
/// the row was written. A connection registered after that finds the
/// message in its catch-up backlog instead.
pub struct SentMessage {
    pub message: DirectMessagePayload,
    receiver_conn: Option<ConnectionHandle>,
}

impl SentMessage {
    pub fn receiver_online(&self) -> bool {
        self.receiver_conn.is_some()
    }

    /// Push the message to the receiver's connection as event `kind`.
    pub fn deliver(&self, state: &SharedState, kind: &str) -> Delivery {
        match &self.receiver_conn {
            Some(conn) => state
                .broadcaster
                .send_to_connection(self.message.receiver_id, conn, kind, &self.message),
            None => Delivery::Offline,
        }
    }
}

#[derive(Debug, Serialize)]
struct ConversationUpdate<'a> {
    sender_id: UserId,
    sender_username: &'a str,
    last_message: &'a str,
    message_time: &'a str,
    unread_count: u32,
}

#[derive(Debug, Serialize)]
pub struct ReadReceipt {
    pub message_id: i64,
    pub read_by: UserId,
    pub read_at: String,
}

#[derive(Debug, Deserialize)]
struct DirectMessageIn {
    receiver_id: UserId,
    content: String,
}

#[derive(Debug, Deserialize)]
struct TypingIn {
    receiver_id: UserId,
    is_typing: bool,
}

#[derive(Debug, Deserialize)]
struct MessageReadIn {
    message_id: i64,
}

#[derive(Debug, Serialize)]
struct TypingOut {
    sender_id: UserId,
    is_typing: bool,
}

/// Validate and persist a direct message, updating the pair's conversation.
/// Delivery is left to the caller.
pub fn send_direct_message(
    state: &SharedState,
    sender: UserId,
    receiver: UserId,
    content: &str,
) -> Result<SentMessage, ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::EmptyContent);
    }
    if sender == receiver {
        return Err(ChatError::SelfMessage);
    }
    let (exists, allowed) = state
        .with_db(|db| Ok((db.user_exists(receiver)?, db.can_message(sender, receiver)?)))
        .ok_or(ChatError::Storage)?;
    if !exists {
        return Err(ChatError::UnknownReceiver);
    }
    if !allowed {
        return Err(ChatError::NotAllowed);
    }

    let now = Utc::now();
    // The lookup shares the storage lock with catch-up registration.
    let (id, username, receiver_conn) = state
        .with_db(|db| {
            let id = db.insert_direct_message(sender, receiver, content, now)?;
            let username = db.username(sender)?.unwrap_or_default();
            Ok((id, username, state.registry.get(receiver)))
        })
        .ok_or(ChatError::Storage)?;

    Ok(SentMessage {
        message: DirectMessagePayload {
            id,
            sender_id: sender,
            receiver_id: receiver,
            username,
            content: content.to_string(),
            created_at: timestamp(now),
        },
        receiver_conn,
    })
}

/// Let the receiver's conversation list move this pair to the top.
pub fn push_conversation_update(state: &SharedState, message: &DirectMessagePayload) {
    state.broadcaster.send_to_user(
        message.receiver_id,
        event::CONVERSATION_UPDATED,
        &ConversationUpdate {
            sender_id: message.sender_id,
            sender_username: &message.username,
            last_message: &message.content,
            message_time: &message.created_at,
            unread_count: 1,
        },
    );
}

/// Mark a message read on behalf of its receiver and tell the original
/// sender. Returns the receipt that was sent.
pub fn mark_message_read(state: &SharedState, reader: UserId, message_id: i64) -> Result<ReadReceipt, ChatError> {
    let now = Utc::now();
    let sender = state
        .with_db(|db| db.mark_read_by_receiver(message_id, reader, now))
        .ok_or(ChatError::Storage)?
        .ok_or(ChatError::MessageNotFound)?;
    let receipt = ReadReceipt {
        message_id,
        read_by: reader,
        read_at: timestamp(now),
    };
    state.broadcaster.send_to_user(sender, event::MESSAGE_READ, &receipt);
    Ok(receipt)
}

pub(super) fn handle_direct_message(session: &LiveSession, data: Value) {
    let Some(req) = decode::<DirectMessageIn>(session, event::DIRECT_MESSAGE, data) else {
        return;
    };
    let state = session.state();
    match send_direct_message(state, session.user_id(), req.receiver_id, &req.content) {
        Ok(sent) => {
            sent.deliver(state, event::DIRECT_MESSAGE);
            push_conversation_update(state, &sent.message);
            session.reply(event::DIRECT_MESSAGE_SENT, &sent.message);
        }
        Err(e) => {
            tracing::debug!(user_id = session.user_id(), receiver_id = req.receiver_id, "Direct message refused: {e}");
            session.error(&e.to_string());
        }
    }
}

pub(super) fn handle_typing(session: &LiveSession, data: Value) {
    let Some(req) = decode::<TypingIn>(session, event::TYPING_INDICATOR, data) else {
        return;
    };
    session.state().broadcaster.send_to_user(
        req.receiver_id,
        event::TYPING_INDICATOR,
        &TypingOut {
            sender_id: session.user_id(),
            is_typing: req.is_typing,
        },
    );
}

pub(super) fn handle_message_read(session: &LiveSession, data: Value) {
    let Some(req) = decode::<MessageReadIn>(session, event::MESSAGE_READ, data) else {
        return;
    };
    if let Err(e) = mark_message_read(session.state(), session.user_id(), req.message_id) {
        session.error(&e.to_string());
    }
}
