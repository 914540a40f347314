//! Live protocol tests, driven over an in-memory duplex pipe.
//!
//! Tests cover:
//! - Direct messages between two connected users (delivery + echo)
//! - Read receipts reaching the original sender
//! - Group chat membership checks, fan-out and notifications
//! - Presence announcements on connect and disconnect
//! - Stalled connections being closed and announced offline
//! - Reconnect catch-up of unread messages
//! - Keepalives, unknown types, malformed payloads and malformed frames
//! - Oversized frames

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use social_server::UserId;
use social_server::broadcast::Delivery;
use social_server::config::ServerConfig;
use social_server::connection;
use social_server::db::{Db, FollowStatus, MemberStatus};
use social_server::server::SharedState;

const TIMEOUT: Duration = Duration::from_secs(5);

fn make_state() -> Arc<SharedState> {
    state_with(ServerConfig::default())
}

fn state_with(config: ServerConfig) -> Arc<SharedState> {
    SharedState::new(config, Db::open_memory().unwrap())
}

/// Two users with an accepted follow in both directions.
fn friends(state: &SharedState) -> (UserId, UserId) {
    let db = state.db.lock();
    let alice = db.create_user("alice", "alice@example.com", "h").unwrap();
    let bob = db.create_user("bob", "bob@example.com", "h").unwrap();
    db.set_follow(alice, bob, FollowStatus::Accepted).unwrap();
    db.set_follow(bob, alice, FollowStatus::Accepted).unwrap();
    (alice, bob)
}

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Client {
    /// Open a live session for `user_id` and consume the `connected` event.
    async fn connect(state: &Arc<SharedState>, user_id: UserId) -> Client {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(connection::handle_generic(server_side, Arc::clone(state), user_id));
        let (reader, writer) = tokio::io::split(client_side);
        let mut client = Client {
            reader: BufReader::new(reader),
            writer,
            task,
        };
        let first = client.next().await;
        assert_eq!(first["type"], "connected");
        assert_eq!(first["data"]["status"], "connected");
        client
    }

    async fn send(&mut self, kind: &str, data: Value) {
        let line = json!({ "type": kind, "data": data }).to_string();
        self.send_raw(&line).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let mut line = String::new();
        let n = tokio::time::timeout(TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for an event")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for an event");
        serde_json::from_str(&line).unwrap()
    }

    /// Skip events until one of type `kind` arrives.
    async fn wait_for(&mut self, kind: &str) -> Value {
        loop {
            let ev = self.next().await;
            if ev["type"] == kind {
                return ev;
            }
        }
    }

    /// Assert nothing arrives within a short window.
    async fn expect_quiet(&mut self) {
        let mut line = String::new();
        let res = tokio::time::timeout(Duration::from_millis(200), self.reader.read_line(&mut line)).await;
        assert!(res.is_err(), "expected no event, got {line:?}");
    }

    /// Close our side and wait for the server to finish cleanup.
    async fn close(self) {
        let Client { reader, writer, task } = self;
        drop(writer);
        drop(reader);
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    }
}

#[tokio::test]
async fn direct_message_reaches_receiver_and_echoes_to_sender() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut a = Client::connect(&state, alice).await;
    let mut b = Client::connect(&state, bob).await;

    a.send("direct_message", json!({ "receiver_id": bob, "content": "hello" })).await;

    let received = b.wait_for("direct_message").await;
    assert_eq!(received["data"]["sender_id"], alice);
    assert_eq!(received["data"]["username"], "alice");
    assert_eq!(received["data"]["content"], "hello");

    let echoed = a.wait_for("direct_message_sent").await;
    assert_eq!(echoed["data"]["id"], received["data"]["id"]);

    let updated = b.wait_for("conversation_updated").await;
    assert_eq!(updated["data"]["sender_id"], alice);
    assert_eq!(updated["data"]["last_message"], "hello");
}

#[tokio::test]
async fn direct_message_to_stranger_is_refused() {
    let state = make_state();
    let (alice, carol) = {
        let db = state.db.lock();
        (
            db.create_user("alice", "alice@example.com", "h").unwrap(),
            db.create_user("carol", "carol@example.com", "h").unwrap(),
        )
    };
    let mut a = Client::connect(&state, alice).await;

    a.send("direct_message", json!({ "receiver_id": carol, "content": "hi" })).await;
    let err = a.wait_for("error").await;
    assert_eq!(err["data"], "You can only message users you follow or who follow you");

    a.send("direct_message", json!({ "receiver_id": 9999, "content": "hi" })).await;
    let err = a.wait_for("error").await;
    assert_eq!(err["data"], "Receiver not found");
}

#[tokio::test]
async fn read_receipt_goes_to_online_sender() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut a = Client::connect(&state, alice).await;
    let mut b = Client::connect(&state, bob).await;

    a.send("direct_message", json!({ "receiver_id": bob, "content": "read me" })).await;
    let msg = b.wait_for("direct_message").await;
    let message_id = msg["data"]["id"].as_i64().unwrap();

    b.send("message_read", json!({ "message_id": message_id })).await;
    let receipt = a.wait_for("message_read").await;
    assert_eq!(receipt["data"]["message_id"], message_id);
    assert_eq!(receipt["data"]["read_by"], bob);
    a.expect_quiet().await;

    let row = state.db.lock().direct_message(message_id).unwrap().unwrap();
    assert!(row.is_read);
    assert!(row.read_at.is_some());
}

#[tokio::test]
async fn read_receipt_for_offline_sender_is_not_queued() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut b = Client::connect(&state, bob).await;
    let a = Client::connect(&state, alice).await;
    b.wait_for("user_online").await;
    a.close().await;
    b.wait_for("user_offline").await;

    // Stored after bob connected, so catch-up has not touched it.
    let message_id = state
        .db
        .lock()
        .insert_direct_message(alice, bob, "while you were out", chrono::Utc::now())
        .unwrap();

    b.send("message_read", json!({ "message_id": message_id })).await;
    b.send("ping", Value::Null).await;
    assert_eq!(b.next().await["type"], "pong");
    let row = state.db.lock().direct_message(message_id).unwrap().unwrap();
    assert!(row.is_read);
    assert!(row.read_at.is_some());

    let mut a = Client::connect(&state, alice).await;
    a.expect_quiet().await;
}

#[tokio::test]
async fn only_receiver_can_mark_read() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let message_id = state
        .db
        .lock()
        .insert_direct_message(alice, bob, "mine", chrono::Utc::now())
        .unwrap();
    let mut a = Client::connect(&state, alice).await;

    a.send("message_read", json!({ "message_id": message_id })).await;
    let err = a.wait_for("error").await;
    assert_eq!(err["data"], "Message not found");
    assert!(!state.db.lock().direct_message(message_id).unwrap().unwrap().is_read);
}

#[tokio::test]
async fn typing_indicator_is_forwarded() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut a = Client::connect(&state, alice).await;
    let mut b = Client::connect(&state, bob).await;

    a.send("typing_indicator", json!({ "receiver_id": bob, "is_typing": true })).await;
    let ev = b.wait_for("typing_indicator").await;
    assert_eq!(ev["data"]["sender_id"], alice);
    assert_eq!(ev["data"]["is_typing"], true);
}

#[tokio::test]
async fn group_message_from_non_member_is_rejected() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let group_id = state.db.lock().create_group("book club", bob).unwrap();
    let mut a = Client::connect(&state, alice).await;

    a.send("group_message", json!({ "group_id": group_id, "content": "let me in" })).await;
    let err = a.wait_for("error").await;
    assert_eq!(err["data"], "Not a group member");
    assert_eq!(state.db.lock().group_message_count(group_id).unwrap(), 0);
}

#[tokio::test]
async fn group_message_fans_out_to_other_members() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let group_id = {
        let db = state.db.lock();
        let group_id = db.create_group("book club", alice).unwrap();
        db.set_group_member(group_id, bob, MemberStatus::Accepted).unwrap();
        group_id
    };
    let mut a = Client::connect(&state, alice).await;
    let mut b = Client::connect(&state, bob).await;

    a.send("group_message", json!({ "group_id": group_id, "content": "chapter 3" })).await;

    let sent = a.wait_for("group_message_sent").await;
    let delivered = b.wait_for("group_message").await;
    assert_eq!(sent["data"]["id"], delivered["data"]["id"]);
    assert_eq!(delivered["data"]["username"], "alice");

    state.tasks.wait_idle().await;
    let note = b.wait_for("group_message_notification").await;
    assert_eq!(note["data"]["group_id"], group_id);
    assert_eq!(note["data"]["content"], "chapter 3");
    assert_eq!(state.db.lock().group_message_count(group_id).unwrap(), 1);
    assert_eq!(state.tasks.failures(), 0);

    // The sender sees neither its own broadcast nor the notification.
    a.expect_quiet().await;
}

#[tokio::test]
async fn presence_is_announced_on_connect_and_close() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut b = Client::connect(&state, bob).await;

    let a = Client::connect(&state, alice).await;
    let online = b.wait_for("user_online").await;
    assert_eq!(online["data"]["user_id"], alice);

    a.close().await;
    let offline = b.wait_for("user_offline").await;
    assert_eq!(offline["data"]["user_id"], alice);
    assert!(!state.registry.is_online(alice));
}

#[tokio::test]
async fn replaced_connection_does_not_announce_offline() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut b = Client::connect(&state, bob).await;

    let first = Client::connect(&state, alice).await;
    b.wait_for("user_online").await;
    let mut second = Client::connect(&state, alice).await;
    b.wait_for("user_online").await;

    first.close().await;
    assert!(state.registry.is_online(alice));
    b.expect_quiet().await;

    // Events now reach the newest connection.
    b.send("direct_message", json!({ "receiver_id": alice, "content": "still there?" })).await;
    let ev = second.wait_for("direct_message").await;
    assert_eq!(ev["data"]["content"], "still there?");
}

#[tokio::test]
async fn stalled_connection_is_closed_and_announced_offline() {
    let state = state_with(ServerConfig {
        outbound_queue: 2,
        ..Default::default()
    });
    let (alice, bob) = friends(&state);
    let mut b = Client::connect(&state, bob).await;

    // Alice's side of the pipe is tiny and never read after `connected`.
    let (client_side, server_side) = tokio::io::duplex(64);
    let task = tokio::spawn(connection::handle_generic(server_side, Arc::clone(&state), alice));
    let (reader, _writer) = tokio::io::split(client_side);
    let mut reader = BufReader::new(reader);
    let mut first = String::new();
    reader.read_line(&mut first).await.unwrap();
    assert!(first.contains("connected"));
    b.wait_for("user_online").await;

    let mut dropped = false;
    for _ in 0..1000 {
        if state.broadcaster.send_to_user(alice, "pong", &"pong") == Delivery::Dropped {
            dropped = true;
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(dropped, "queue never filled up");

    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert!(!state.registry.is_online(alice));
    let offline = b.wait_for("user_offline").await;
    assert_eq!(offline["data"]["user_id"], alice);
}

#[tokio::test]
async fn online_status_request_lists_connected_friends() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut a = Client::connect(&state, alice).await;
    let _b = Client::connect(&state, bob).await;
    a.wait_for("user_online").await;

    a.send("request_online_status", json!({})).await;
    let ev = a.wait_for("user_online").await;
    assert_eq!(ev["data"]["user_id"], bob);
}

#[tokio::test]
async fn unread_backlog_is_replayed_on_connect() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    {
        let mut db = state.db.lock();
        let base = chrono::Utc::now() - chrono::Duration::minutes(5);
        for (i, text) in ["first", "second", "third"].into_iter().enumerate() {
            db.insert_direct_message(alice, bob, text, base + chrono::Duration::seconds(i as i64))
                .unwrap();
        }
    }

    let mut b = Client::connect(&state, bob).await;
    for expected in ["first", "second", "third"] {
        let ev = b.wait_for("direct_message").await;
        assert_eq!(ev["data"]["content"], expected);
        assert_eq!(ev["data"]["username"], "alice");
    }
    assert!(state.db.lock().unread_direct_messages(bob).unwrap().is_empty());
}

#[tokio::test]
async fn keepalives_are_answered() {
    let state = make_state();
    let (alice, _) = friends(&state);
    let mut a = Client::connect(&state, alice).await;

    a.send("heartbeat", Value::Null).await;
    assert_eq!(a.wait_for("heartbeat_ack").await["data"], "ok");
    a.send("ping", Value::Null).await;
    assert_eq!(a.wait_for("pong").await["data"], "pong");
    a.send("open_conversation", json!({ "user_id": 1 })).await;
    assert_eq!(a.wait_for("open_conversation_ack").await["data"], "ok");
}

#[tokio::test]
async fn unknown_type_is_ignored_and_connection_stays_open() {
    let state = make_state();
    let (alice, _) = friends(&state);
    let mut a = Client::connect(&state, alice).await;

    a.send("teleport", json!({ "to": "mars" })).await;
    a.send("ping", Value::Null).await;
    let ev = a.next().await;
    assert_eq!(ev["type"], "pong");
}

#[tokio::test]
async fn bad_payload_shape_gets_error_and_connection_survives() {
    let state = make_state();
    let (alice, _) = friends(&state);
    let mut a = Client::connect(&state, alice).await;

    a.send("direct_message", json!({ "receiver_id": "not a number" })).await;
    let err = a.next().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["data"], "Invalid direct_message payload");

    a.send("ping", Value::Null).await;
    assert_eq!(a.next().await["type"], "pong");
    assert!(state.registry.is_online(alice));
}

#[tokio::test]
async fn non_json_frame_closes_connection() {
    let state = make_state();
    let (alice, bob) = friends(&state);
    let mut b = Client::connect(&state, bob).await;
    let mut a = Client::connect(&state, alice).await;
    b.wait_for("user_online").await;

    a.send_raw("this is not json").await;
    tokio::time::timeout(TIMEOUT, a.task).await.unwrap().unwrap().unwrap();
    assert!(!state.registry.is_online(alice));
    let offline = b.wait_for("user_offline").await;
    assert_eq!(offline["data"]["user_id"], alice);
}

#[tokio::test]
async fn oversized_frame_is_refused_and_connection_survives() {
    let state = state_with(ServerConfig {
        max_frame_len: 128,
        ..Default::default()
    });
    let (alice, _) = friends(&state);
    let mut a = Client::connect(&state, alice).await;

    let content = "x".repeat(4096);
    a.send("direct_message", json!({ "receiver_id": 1, "content": content })).await;
    let err = a.next().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["data"], "Message too large");

    a.send("ping", Value::Null).await;
    assert_eq!(a.next().await["type"], "pong");
    assert!(state.registry.is_online(alice));
}
