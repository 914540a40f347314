//! Wire envelope for the live protocol.
//!
//! Every frame in either direction is one JSON object `{"type": .., "data": ..}`.
//! Outbound events are serialized once per broadcast and the resulting line
//! is cloned into each recipient's queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONNECTED: &str = "connected";
pub const DIRECT_MESSAGE: &str = "direct_message";
pub const DIRECT_MESSAGE_SENT: &str = "direct_message_sent";
pub const NEW_MESSAGE: &str = "new_message";
pub const NEW_MESSAGE_POPUP: &str = "new_message_popup";
pub const MESSAGE_DELIVERED: &str = "message_delivered";
pub const MESSAGE_READ: &str = "message_read";
pub const CONVERSATION_UPDATED: &str = "conversation_updated";
pub const TYPING_INDICATOR: &str = "typing_indicator";
pub const USER_ONLINE: &str = "user_online";
pub const USER_OFFLINE: &str = "user_offline";
pub const GROUP_MESSAGE: &str = "group_message";
pub const GROUP_MESSAGE_SENT: &str = "group_message_sent";
pub const GROUP_MESSAGE_NOTIFICATION: &str = "group_message_notification";
pub const POST_LIKE_UPDATED: &str = "post_like_updated";
pub const NEW_POST: &str = "new_post";
pub const NOTIFICATION_COUNT_UPDATE: &str = "notification_count_update";
pub const OFFLINE_MESSAGES_NOTIFICATION: &str = "offline_messages_notification";
pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
pub const PONG: &str = "pong";
pub const OPEN_CONVERSATION_ACK: &str = "open_conversation_ack";
pub const ERROR: &str = "error";

/// Notification kinds stored in `notifications.type`.
pub mod kind {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const POST_LIKE: &str = "post_like";
}

/// Inbound frame. `data` stays untyped until dispatch picks a payload shape.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound frame borrowing its payload.
#[derive(Debug, Serialize)]
pub struct Event<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub data: &'a T,
}

/// Serialize an event into a single wire line (no trailing newline).
pub fn encode<T: Serialize>(kind: &str, data: &T) -> serde_json::Result<String> {
    serde_json::to_string(&Event { kind, data })
}
