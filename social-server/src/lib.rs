//! Real-time presence and fan-out core of a social network backend.
//!
//! Live WebSocket connections are tracked in a [`registry::Registry`]; the
//! [`broadcast::Broadcaster`] delivers events to one user, a group, or
//! everyone online; [`presence::PresenceNotifier`] tells related users when
//! someone comes and goes. Authentication state lives in
//! [`session::SessionStore`], persistence in [`db::Db`].

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod event;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;
pub mod tasks;
pub mod web;

/// Primary key of a row in `users`.
pub type UserId = i64;
