//! Per-client live connection handler.
//!
//! Each authenticated WebSocket gets a [`LiveSession`] that:
//! - registers the connection and announces presence
//! - flushes the offline backlog (reconnect catch-up)
//! - reads JSON envelopes and dispatches them by `type`
//! - unregisters and announces offline when the stream ends
//!
//! The handler works on any async byte stream carrying one JSON envelope
//! per line, so tests can drive it over `tokio::io::duplex`.
//!
//! Submodules:
//! - [`catchup`]: backlog delivery on connect
//! - [`messaging`]: direct messages, typing indicators, read receipts
//! - [`group`]: group chat
//! - [`queries`]: heartbeat, ping, presence snapshot
//! - [`helpers`]: payload decoding, flood protection

pub mod catchup;
mod group;
mod helpers;
pub mod messaging;
mod queries;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::event::{self, Envelope};
use crate::registry::ConnectionHandle;
use crate::server::SharedState;
use crate::UserId;

use helpers::{read_frame, Frame, TokenBucket};

/// Largest number of queued events coalesced into one write.
const MAX_WRITE_BATCH: usize = 64;

/// One open connection: who it belongs to and how to answer it.
pub struct LiveSession {
    user_id: UserId,
    handle: ConnectionHandle,
    state: Arc<SharedState>,
}

impl LiveSession {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// Send an event on this connection only.
    pub fn reply<T: Serialize>(&self, kind: &str, data: &T) {
        if let Err(e) = self.handle.push(kind, data) {
            tracing::debug!(user_id = self.user_id, conn_id = self.handle.id(), kind, "Reply dropped: {e}");
        }
    }

    /// Send an `error` event on this connection.
    pub fn error(&self, message: &str) {
        self.reply(event::ERROR, &message);
    }
}

/// Handle a generic async stream (WebSocket bridge, duplex pipe in tests).
/// `user_id` must already be authenticated.
pub async fn handle_generic<S>(stream: S, state: Arc<SharedState>, user_id: UserId) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, state, user_id).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    state: Arc<SharedState>,
    user_id: UserId,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = &state.config;
    let (handle, mut rx) = ConnectionHandle::channel(config.outbound_queue);
    let conn_id = handle.id();
    tracing::info!(user_id, conn_id, "New live connection");

    // Spawn writer task
    let write_timeout = Duration::from_secs(config.write_timeout_secs);
    let mut write_half = writer;
    let mut write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let mut batch = line;
            batch.push('\n');
            // Drain whatever else is queued and write it in one go
            let mut batch_count = 0;
            while let Ok(queued) = rx.try_recv() {
                batch.push_str(&queued);
                batch.push('\n');
                batch_count += 1;
                if batch_count >= MAX_WRITE_BATCH {
                    break;
                }
            }
            let write = async {
                write_half.write_all(batch.as_bytes()).await?;
                write_half.flush().await
            };
            match tokio::time::timeout(write_timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(conn_id, "Write error: {e}");
                    break;
                }
                Err(_) => {
                    tracing::warn!(conn_id, "Write deadline exceeded, dropping connection");
                    break;
                }
            }
        }
    });

    let session = LiveSession {
        user_id,
        handle: handle.clone(),
        state: Arc::clone(&state),
    };

    let backlog_cutoff = catchup::register(&state, user_id, &handle);
    session.reply(event::CONNECTED, &serde_json::json!({ "status": "connected" }));
    state.presence.announce(user_id, true);
    catchup::deliver_backlog(&state, user_id, &handle, backlog_cutoff).await;

    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let max_frame_len = config.max_frame_len;
    let mut limiter = TokenBucket::new(config.rate_limit_per_sec);
    let mut line_buf = Vec::new();

    let reason = loop {
        line_buf.clear();
        let read_result = tokio::select! {
            res = tokio::time::timeout(idle_timeout, read_frame(&mut reader, &mut line_buf, max_frame_len)) => res,
            _ = &mut write_handle => break "writer closed",
            _ = handle.close_requested() => break "closed by server",
        };

        match read_result {
            Err(_) => break "idle timeout",
            Ok(Ok(Frame::Eof)) => break "eof",
            Ok(Err(e)) => {
                tracing::debug!(user_id, conn_id, "Read error: {e}");
                break "read error";
            }
            Ok(Ok(Frame::TooLong)) => {
                tracing::warn!(user_id, conn_id, max_frame_len, "Frame too long, dropping");
                session.error("Message too large");
                continue;
            }
            Ok(Ok(Frame::Line)) => {}
        }

        let Ok(text) = std::str::from_utf8(&line_buf) else {
            tracing::warn!(user_id, conn_id, "Frame is not valid UTF-8");
            break "malformed frame";
        };
        let line = text.trim();
        if line.is_empty() {
            continue;
        }

        if !limiter.try_take() {
            tracing::debug!(user_id, conn_id, "Rate limited");
            // Warn the user (only once per burst)
            if limiter.first_denial() {
                session.error("You are sending messages too fast");
            }
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(user_id, conn_id, "Malformed frame: {e}");
                break "malformed frame";
            }
        };

        dispatch(&session, envelope);
    };

    state.registry.unregister(user_id, &handle);
    // A newer connection for the same user keeps them online.
    let announced_offline = !state.registry.is_online(user_id);
    if announced_offline {
        state.presence.announce(user_id, false);
    }
    write_handle.abort();
    tracing::info!(user_id, conn_id, reason, announced_offline, "Connection closed");
    Ok(())
}

fn dispatch(session: &LiveSession, envelope: Envelope) {
    let Envelope { kind, data } = envelope;
    tracing::debug!(user_id = session.user_id, kind = %kind, "<- frame");

    match kind.as_str() {
        "direct_message" => messaging::handle_direct_message(session, data),
        "typing_indicator" => messaging::handle_typing(session, data),
        "message_read" => messaging::handle_message_read(session, data),
        "group_message" => group::handle_group_message(session, data),
        "heartbeat" => queries::handle_heartbeat(session),
        "ping" => queries::handle_ping(session),
        "open_conversation" => queries::handle_open_conversation(session),
        "request_online_status" => queries::handle_online_status(session),
        other => {
            tracing::warn!(user_id = session.user_id, kind = other, "Unknown message type, ignoring");
        }
    }
}
