//! In-memory session store.
//!
//! Maps opaque bearer tokens to user ids. Tokens carry 256 bits from the
//! thread CSPRNG and expire after a fixed TTL; expired entries stop
//! resolving immediately and are purged by [`SessionStore::sweep`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::RwLock;
use rand::RngCore;

use crate::db::SharedDb;
use crate::UserId;

/// Random bytes per token.
pub const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
struct SessionEntry {
    user_id: UserId,
    expires_at: Instant,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh token for `user_id`.
    pub fn create(&self, user_id: UserId) -> String {
        let token = generate_token();
        let entry = SessionEntry {
            user_id,
            expires_at: Instant::now() + self.ttl,
        };
        self.sessions.write().insert(token.clone(), entry);
        tracing::debug!(user_id, "Session created");
        token
    }

    /// Look up the user behind a token. Unknown and expired tokens are `None`.
    pub fn resolve(&self, token: &str) -> Option<UserId> {
        let sessions = self.sessions.read();
        let entry = sessions.get(token)?;
        (entry.expires_at > Instant::now()).then_some(entry.user_id)
    }

    /// Remove a token. Destroying an unknown token is a no-op.
    pub fn destroy(&self, token: &str) {
        if let Some(entry) = self.sessions.write().remove(token) {
            tracing::debug!(user_id = entry.user_id, "Session destroyed");
        }
    }

    /// Resolve a token and confirm the user still exists in storage.
    /// Sessions for deleted users are destroyed on the spot.
    pub fn resolve_validated(&self, token: &str, db: &SharedDb) -> Option<UserId> {
        let user_id = self.resolve(token)?;
        let exists = match db.lock().user_exists(user_id) {
            Ok(exists) => exists,
            Err(e) => {
                tracing::error!(user_id, "Session user lookup failed: {e}");
                false
            }
        };
        if exists {
            Some(user_id)
        } else {
            tracing::info!(user_id, "Session refers to missing user, destroying");
            self.destroy(token);
            None
        }
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
