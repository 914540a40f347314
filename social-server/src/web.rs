//! HTTP and WebSocket endpoints.
//!
//! Serves on the same port:
//! - `/ws`: WebSocket live protocol (one JSON envelope per text frame)
//! - auth, messaging, presence, post and notification REST routes
//! - `/api/v1/health`

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tower_http::cors::CorsLayer;

use crate::connection::messaging::{mark_message_read, push_conversation_update, send_direct_message};
use crate::db::{timestamp, Privacy};
use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;
use crate::{event, notify, UserId};

pub const SESSION_COOKIE: &str = "session_token";

// ── WebSocket bridge ───────────────────────────────────────────────────

/// A WebSocket bridged to AsyncRead + AsyncWrite, one line per frame.
struct WsBridge {
    reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

fn bridge_ws(socket: WebSocket, send_timeout: Duration) -> WsBridge {
    let (ws_tx, ws_rx) = tokio::sync::mpsc::channel::<WsMessage>(64);

    // conn_side is what the live session handler reads/writes.
    let (conn_side, bridge_side) = tokio::io::duplex(16384);
    let (conn_read, conn_write) = tokio::io::split(conn_side);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // Task 1: owns the WebSocket, frames → bridge_write, ws_rx → frames
    tokio::spawn(async move {
        let mut socket = socket;
        let mut ws_rx = ws_rx;
        loop {
            tokio::select! {
                frame = socket.recv() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            // A raw newline is never valid inside a JSON string,
                            // so flattening keeps one frame on one line.
                            let mut bytes: Vec<u8> = text
                                .as_bytes()
                                .iter()
                                .map(|&b| if b == b'\r' || b == b'\n' { b' ' } else { b })
                                .collect();
                            bytes.push(b'\n');
                            if bridge_write.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(WsMessage::Binary(_))) => {
                            tracing::debug!("Ignoring binary WebSocket frame");
                        }
                        Some(Ok(_)) => {} // Ping/Pong handled by axum
                        Some(Err(_)) => break,
                    }
                }
                msg = ws_rx.recv() => {
                    match msg {
                        Some(ws_msg) => {
                            match tokio::time::timeout(send_timeout, socket.send(ws_msg)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(_)) | Err(_) => {
                                    tracing::debug!("WebSocket send failed or timed out, closing bridge");
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        let _ = socket.send(WsMessage::Close(None)).await;
    });

    // Task 2: bridge lines (← live session writes) → text frames
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut line_buf = Vec::new();
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    line_buf.extend_from_slice(&buf[..n]);
                    while let Some(pos) = line_buf.iter().position(|b| *b == b'\n') {
                        let line = String::from_utf8_lossy(&line_buf[..pos]).to_string();
                        line_buf.drain(..=pos);
                        if ws_tx.send(WsMessage::Text(line.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    WsBridge {
        reader: conn_read,
        writer: conn_write,
    }
}

impl AsyncRead for WsBridge {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsBridge {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

// ── Axum router ────────────────────────────────────────────────────────

/// Build the axum router with WebSocket and REST endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    let cors = {
        use axum::http::Method;
        use tower_http::cors::AllowOrigin;
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(
                state.config.allowed_origins.iter().filter_map(|o| o.parse().ok()),
            ))
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(true)
    };

    Router::new()
        // Live protocol
        .route("/ws", get(ws_upgrade))
        // Auth
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/checkAuth", get(check_auth))
        // Direct messages
        .route("/messages/{id}", post(post_message))
        .route("/messages/{id}/read", patch(read_message))
        // Presence
        .route("/users/online-status", get(batch_online_status))
        .route("/users/{id}/online-status", get(user_online_status))
        .route("/groups/{id}/online-members", get(group_online_members))
        // Posts
        .route("/posts", post(create_post))
        .route("/posts/{id}/like", post(like_post))
        // Notifications
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/mark-all-read", post(mark_all_read))
        .route("/api/v1/health", get(api_health))
        .layer(cors)
        .with_state(state)
}

// ── Session extraction ─────────────────────────────────────────────────

/// The user behind a request's session token.
///
/// Candidates are tried in order: a `token` query parameter (browsers
/// cannot set headers on a WebSocket handshake), the `session_token`
/// cookie, then an `Authorization: Bearer` header. The first one that
/// resolves to a live session wins, so a stale cookie does not mask a valid
/// token. Rejects with 401.
pub struct AuthUser {
    pub user_id: UserId,
    pub token: String,
}

impl FromRequestParts<Arc<SharedState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<SharedState>) -> Result<Self, Self::Rejection> {
        request_tokens(&parts.headers, parts.uri.query())
            .into_iter()
            .find_map(|token| {
                let user_id = state.sessions.resolve_validated(&token, &state.db)?;
                Some(AuthUser { user_id, token })
            })
            .ok_or(ApiError::Unauthorized)
    }
}

fn request_tokens(headers: &HeaderMap, query: Option<&str>) -> Vec<String> {
    let from_query = query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    });
    let from_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    [from_query, cookie_token(headers), from_bearer]
        .into_iter()
        .flatten()
        .filter(|t| !t.is_empty())
        .collect()
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
}

fn session_cookie(state: &SharedState, token: &str, max_age: i64) -> HeaderValue {
    let secure = if state.config.cookie_secure { "; Secure" } else { "" };
    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax{secure}");
    // Token is URL-safe base64 and the rest is ASCII.
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("session_token=; Max-Age=0"))
}

// ── WebSocket ──────────────────────────────────────────────────────────

/// The session is checked before the upgrade so a bad token is a plain 401.
async fn ws_upgrade(auth: AuthUser, ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> Response {
    let max_frame = state.config.max_frame_len;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_ws(socket, state, auth.user_id))
}

async fn handle_ws(socket: WebSocket, state: Arc<SharedState>, user_id: UserId) {
    let send_timeout = Duration::from_secs(state.config.write_timeout_secs.max(1));
    let stream = bridge_ws(socket, send_timeout);
    if let Err(e) = crate::connection::handle_generic(stream, state, user_id).await {
        tracing::error!(user_id, "WebSocket connection error: {e}");
    }
}

// ── Auth ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    #[serde(alias = "password_hash")]
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    /// Username or email.
    username: String,
    password: String,
}

#[derive(Serialize)]
struct UserResponse {
    id: UserId,
    username: String,
}

async fn register(State(state): State<Arc<SharedState>>, Json(req): Json<RegisterRequest>) -> ApiResult<Response> {
    let username = req.username.trim().to_string();
    let email = req.email.trim().to_string();
    if username.is_empty() || email.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest("Username, email and password are required".into()));
    }
    let taken = {
        let db = state.db.lock();
        db.find_user_by_identifier(&username)?.is_some() || db.find_user_by_identifier(&email)?.is_some()
    };
    if taken {
        return Err(ApiError::Conflict("Username or email already taken".into()));
    }

    let cost = state.config.bcrypt_cost;
    let password = req.password;
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| {
            tracing::error!("Password hashing task failed: {e}");
            ApiError::Internal
        })?
        .map_err(|e| {
            tracing::error!("Password hashing failed: {e}");
            ApiError::Internal
        })?;

    let id = state.db.lock().create_user(&username, &email, &hash)?;
    tracing::info!(user_id = id, %username, "User registered");
    let token = state.sessions.create(id);
    Ok(with_session_cookie(&state, &token, StatusCode::CREATED, UserResponse { id, username }))
}

async fn login(State(state): State<Arc<SharedState>>, Json(req): Json<LoginRequest>) -> ApiResult<Response> {
    let user = state
        .db
        .lock()
        .find_user_by_identifier(req.username.trim())?
        .ok_or(ApiError::InvalidCredentials)?;

    let hash = user.password_hash.clone();
    let password = req.password;
    let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| {
            tracing::error!("Password check task failed: {e}");
            ApiError::Internal
        })?
        .unwrap_or(false);
    if !valid {
        return Err(ApiError::InvalidCredentials);
    }

    let token = state.sessions.create(user.id);
    tracing::info!(user_id = user.id, "User logged in");
    Ok(with_session_cookie(
        &state,
        &token,
        StatusCode::OK,
        UserResponse {
            id: user.id,
            username: user.username,
        },
    ))
}

fn with_session_cookie<T: Serialize>(state: &SharedState, token: &str, status: StatusCode, body: T) -> Response {
    let max_age = i64::try_from(state.sessions.ttl().as_secs()).unwrap_or(i64::MAX);
    let mut resp = (status, Json(body)).into_response();
    resp.headers_mut()
        .insert(header::SET_COOKIE, session_cookie(state, token, max_age));
    resp
}

/// Destroy the session and clear the cookie. A live connection for the user
/// is asked to close; its own cleanup announces the user offline.
async fn logout(headers: HeaderMap, State(state): State<Arc<SharedState>>) -> ApiResult<Response> {
    let token = cookie_token(&headers).ok_or_else(|| {
        tracing::debug!("Logout without session cookie");
        ApiError::Unauthorized
    })?;
    if let Some(user_id) = state.sessions.resolve(&token) {
        state.sessions.destroy(&token);
        match state.registry.get(user_id) {
            Some(handle) => handle.close(),
            None => {
                state.presence.announce(user_id, false);
            }
        }
        tracing::info!(user_id, "User logged out");
    }
    let mut resp = Json(json!({ "message": "Logged out successfully" })).into_response();
    resp.headers_mut()
        .insert(header::SET_COOKIE, session_cookie(&state, "", 0));
    Ok(resp)
}

async fn check_auth(auth: AuthUser, State(state): State<Arc<SharedState>>) -> ApiResult<Json<serde_json::Value>> {
    let username = state
        .db
        .lock()
        .username(auth.user_id)?
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(json!({
        "authenticated": true,
        "user_id": auth.user_id,
        "username": username,
    })))
}

// ── Direct messages ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Serialize)]
struct SendMessageResponse {
    message_id: i64,
    message: &'static str,
    delivery_status: &'static str,
    delivered: bool,
    instant_delivery: bool,
}

#[derive(Serialize)]
struct MessagePopup<'a> {
    sender_id: UserId,
    sender_username: &'a str,
    message: String,
    message_id: i64,
    content: &'a str,
    created_at: &'a str,
}

#[derive(Serialize)]
struct DeliveryReceipt {
    message_id: i64,
    delivered_to: UserId,
    delivered_at: String,
    status: &'static str,
}

/// Persist a message, then deliver it instantly when the receiver is online
/// and follows the sender (or is public); otherwise send a popup and leave a
/// notification for reconnect catch-up.
async fn post_message(
    auth: AuthUser,
    State(state): State<Arc<SharedState>>,
    Path(receiver_id): Path<UserId>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    let sender = auth.user_id;
    let sent = send_direct_message(&state, sender, receiver_id, &req.content)?;
    let message = &sent.message;

    let online = sent.receiver_online();
    let instant = state
        .with_db(|db| db.receives_instantly(sender, receiver_id))
        .unwrap_or(false);

    let delivery_status = if online && instant {
        sent.deliver(&state, event::NEW_MESSAGE);
        state.broadcaster.send_to_user(
            sender,
            event::MESSAGE_DELIVERED,
            &DeliveryReceipt {
                message_id: message.id,
                delivered_to: receiver_id,
                delivered_at: timestamp(Utc::now()),
                status: "delivered",
            },
        );
        "delivered_instantly"
    } else {
        if online {
            state.broadcaster.send_to_user(
                receiver_id,
                event::NEW_MESSAGE_POPUP,
                &MessagePopup {
                    sender_id: sender,
                    sender_username: &message.username,
                    message: format!("You have a new message from {} (delayed delivery)", message.username),
                    message_id: message.id,
                    content: &message.content,
                    created_at: &message.created_at,
                },
            );
        }
        let task_state = Arc::clone(&state);
        let message_id = message.id;
        state.tasks.spawn("message_waiting", async move {
            notify::message_waiting(&task_state, sender, receiver_id, message_id)
        });
        if online {
            "delivered_delayed"
        } else {
            "offline_notification_created"
        }
    };
    push_conversation_update(&state, message);

    tracing::debug!(sender, receiver_id, message_id = message.id, delivery_status, "Message sent");
    let body = SendMessageResponse {
        message_id: message.id,
        message: "Message sent successfully",
        delivery_status,
        delivered: online,
        instant_delivery: online && instant,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn read_message(
    auth: AuthUser,
    State(state): State<Arc<SharedState>>,
    Path(message_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let receipt = mark_message_read(&state, auth.user_id, message_id)?;
    Ok(Json(json!({
        "message_id": receipt.message_id,
        "read_at": receipt.read_at,
        "status": "read",
    })))
}

// ── Presence ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct OnlineStatusQuery {
    #[serde(default)]
    user_ids: String,
}

async fn batch_online_status(
    _auth: AuthUser,
    State(state): State<Arc<SharedState>>,
    Query(q): Query<OnlineStatusQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if q.user_ids.trim().is_empty() {
        return Err(ApiError::BadRequest("user_ids parameter is required".into()));
    }
    let ids: Vec<UserId> = q
        .user_ids
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if ids.is_empty() {
        return Err(ApiError::BadRequest("No valid user IDs provided".into()));
    }
    let online = state.registry.online_subset(ids.iter().copied());
    let status: BTreeMap<UserId, bool> = ids.into_iter().map(|id| (id, online.contains(&id))).collect();
    Ok(Json(json!({
        "online_status": status,
        "timestamp": timestamp(Utc::now()),
    })))
}

async fn user_online_status(
    _auth: AuthUser,
    State(state): State<Arc<SharedState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.db.lock().user_exists(user_id)? {
        return Err(ApiError::NotFound("User not found".into()));
    }
    Ok(Json(json!({
        "user_id": user_id,
        "is_online": state.registry.is_online(user_id),
        "timestamp": timestamp(Utc::now()),
    })))
}

async fn group_online_members(
    auth: AuthUser,
    State(state): State<Arc<SharedState>>,
    Path(group_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let members = {
        let db = state.db.lock();
        if !db.is_group_member(group_id, auth.user_id)? {
            return Err(ApiError::Forbidden("Not a group member".into()));
        }
        db.group_members(group_id)?
    };
    let online = state.registry.online_subset(members.iter().copied());
    let online_members: Vec<UserId> = members.into_iter().filter(|id| online.contains(id)).collect();
    Ok(Json(json!({
        "group_id": group_id,
        "count": online_members.len(),
        "online_members": online_members,
    })))
}

// ── Posts ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreatePostRequest {
    content: String,
    #[serde(default)]
    privacy: i64,
}

async fn create_post(
    auth: AuthUser,
    State(state): State<Arc<SharedState>>,
    Json(req): Json<CreatePostRequest>,
) -> ApiResult<Response> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Post content cannot be empty".into()));
    }
    let privacy = Privacy::from_level(req.privacy)
        .ok_or_else(|| ApiError::BadRequest("Invalid privacy level".into()))?;

    let (post, username) = {
        let db = state.db.lock();
        let post = db.create_post(auth.user_id, content, privacy, Utc::now())?;
        (post, db.username(auth.user_id)?.unwrap_or_default())
    };
    let reached = notify::fan_out_post(&state, &post, &username);
    tracing::info!(user_id = auth.user_id, post_id = post.id, reached, "Post created");

    let body = json!({
        "id": post.id,
        "user_id": post.user_id,
        "author_username": username,
        "content": post.content,
        "privacy": post.privacy.level(),
        "created_at": post.created_at,
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

#[derive(Deserialize)]
struct LikeRequest {
    #[serde(default = "default_is_like")]
    is_like: bool,
}

fn default_is_like() -> bool {
    true
}

#[derive(Serialize)]
struct LikeCounts {
    post_id: i64,
    like_count: i64,
    dislike_count: i64,
}

async fn like_post(
    auth: AuthUser,
    State(state): State<Arc<SharedState>>,
    Path(post_id): Path<i64>,
    body: axum::body::Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    // An empty body is a plain like.
    let is_like = if body.is_empty() {
        true
    } else {
        serde_json::from_slice::<LikeRequest>(&body)
            .map_err(|_| ApiError::BadRequest("Invalid like payload".into()))?
            .is_like
    };
    let outcome = state
        .db
        .lock()
        .toggle_like(post_id, auth.user_id, is_like)?
        .ok_or_else(|| ApiError::NotFound("Post not found".into()))?;

    state.broadcaster.send_to_all(
        event::POST_LIKE_UPDATED,
        &LikeCounts {
            post_id,
            like_count: outcome.like_count,
            dislike_count: outcome.dislike_count,
        },
    );
    if outcome.became_like {
        let task_state = Arc::clone(&state);
        let liker = auth.user_id;
        let owner = outcome.post_owner;
        state.tasks.spawn("post_like_notification", async move {
            notify::post_liked(&task_state, liker, owner, post_id)
        });
    }

    Ok(Json(json!({
        "post_id": post_id,
        "liked": outcome.liked,
        "disliked": outcome.disliked,
        "like_count": outcome.like_count,
        "dislike_count": outcome.dislike_count,
    })))
}

// ── Notifications ──────────────────────────────────────────────────────

async fn unread_count(auth: AuthUser, State(state): State<Arc<SharedState>>) -> ApiResult<Json<serde_json::Value>> {
    let count = state.db.lock().unread_notification_count(auth.user_id, None)?;
    Ok(Json(json!({ "unread_count": count })))
}

async fn mark_all_read(auth: AuthUser, State(state): State<Arc<SharedState>>) -> ApiResult<Json<serde_json::Value>> {
    let updated = state.db.lock().mark_notifications_read(auth.user_id, None)?;
    if let Err(e) = notify::push_unread_count(&state, auth.user_id) {
        tracing::error!(user_id = auth.user_id, "Failed to push unread count: {e:#}");
    }
    Ok(Json(json!({ "updated": updated })))
}

// ── Health ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    connections: usize,
    sessions: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connections: state.registry.len(),
        sessions: state.sessions.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
