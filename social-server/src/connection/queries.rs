//! Keepalive and presence queries.

use super::LiveSession;
use crate::event;
use crate::presence::PresencePayload;

pub(super) fn handle_heartbeat(session: &LiveSession) {
    session.reply(event::HEARTBEAT_ACK, &"ok");
}

pub(super) fn handle_ping(session: &LiveSession) {
    session.reply(event::PONG, &"pong");
}

pub(super) fn handle_open_conversation(session: &LiveSession) {
    session.reply(event::OPEN_CONVERSATION_ACK, &"ok");
}

/// One `user_online` per related user that is currently connected.
pub(super) fn handle_online_status(session: &LiveSession) {
    for user_id in session.state().presence.snapshot(session.user_id()) {
        session.reply(event::USER_ONLINE, &PresencePayload { user_id });
    }
}
