//! SQLite persistence layer.
//!
//! Stores users, follow edges, groups, direct and group chat messages,
//! conversations, notifications, posts and likes. The real-time core only
//! reads relationships and flips `is_read` flags; everything else is here so
//! the HTTP surface and tests have something to write into.
//! Uses WAL mode for concurrent reads during writes.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use crate::UserId;

/// Database handle shared between connection tasks and HTTP handlers.
pub type SharedDb = Arc<Mutex<Db>>;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// Status of a directed follow edge, stored as in the `followers.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowStatus {
    Pending,
    Accepted,
}

impl FollowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowStatus::Pending => "pending",
            FollowStatus::Accepted => "accept",
        }
    }
}

/// Status of a group membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Pending,
    Invited,
    Requested,
    Accepted,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Pending => "pending",
            MemberStatus::Invited => "invited",
            MemberStatus::Requested => "requested",
            MemberStatus::Accepted => "accepted",
        }
    }
}

/// Post visibility level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    Public,
    Followers,
    CloseFriends,
}

impl Privacy {
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Privacy::Public),
            1 => Some(Privacy::Followers),
            2 => Some(Privacy::CloseFriends),
            _ => None,
        }
    }

    pub fn level(self) -> i64 {
        match self {
            Privacy::Public => 0,
            Privacy::Followers => 1,
            Privacy::CloseFriends => 2,
        }
    }
}

/// Credentials row used by login.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_private: bool,
}

/// A persisted direct message, joined with the sender's username.
#[derive(Debug, Clone)]
pub struct DirectMessageRow {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub sender_username: String,
    pub content: String,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub created_at: String,
}

/// Conversation aggregate for a user pair (`user1_id < user2_id`).
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub last_message_id: Option<i64>,
    pub updated_at: String,
}

/// Fields for a new notification row.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_id: Option<i64>,
    pub related_type: Option<String>,
    pub actor_id: Option<UserId>,
}

/// A persisted post, as far as fan-out needs it.
#[derive(Debug, Clone)]
pub struct PostRow {
    pub id: i64,
    pub user_id: UserId,
    pub content: String,
    pub privacy: Privacy,
    pub created_at: String,
}

/// Result of toggling a reaction on a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeOutcome {
    pub liked: bool,
    pub disliked: bool,
    pub like_count: i64,
    pub dislike_count: i64,
    pub post_owner: UserId,
    /// The toggle turned into (or switched to) a like.
    pub became_like: bool,
}

/// Format a timestamp for storage. Millisecond RFC 3339 in UTC sorts lexically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn map_direct_message(row: &rusqlite::Row<'_>) -> SqlResult<DirectMessageRow> {
    Ok(DirectMessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        sender_username: row.get(3)?,
        content: row.get(4)?,
        is_read: row.get::<_, i32>(5)? != 0,
        read_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Wrap this handle for sharing across tasks.
    pub fn shared(self) -> SharedDb {
        Arc::new(Mutex::new(self))
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                username      TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                email         TEXT UNIQUE NOT NULL,
                is_private    INTEGER NOT NULL DEFAULT 0,
                avatar        TEXT,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS followers (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                follower_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                followed_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                status      TEXT NOT NULL CHECK(status IN ('pending', 'accept')) DEFAULT 'pending',
                updated_at  TEXT NOT NULL,
                UNIQUE(follower_id, followed_id)
            );

            CREATE TABLE IF NOT EXISTS close_friends (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                close_friend_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                UNIQUE(user_id, close_friend_id)
            );

            CREATE TABLE IF NOT EXISTS groups (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                title      TEXT NOT NULL,
                creator_id INTEGER NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                user_id  INTEGER NOT NULL REFERENCES users(id),
                status   TEXT NOT NULL CHECK(status IN ('pending', 'accepted', 'invited', 'requested')) DEFAULT 'pending',
                UNIQUE(group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS private_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id   INTEGER NOT NULL REFERENCES users(id),
                receiver_id INTEGER NOT NULL REFERENCES users(id),
                content     TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                read_at     TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_private_messages_unread
                ON private_messages(receiver_id, is_read, created_at);

            CREATE TABLE IF NOT EXISTS group_chat_messages (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id   INTEGER NOT NULL REFERENCES groups(id),
                sender_id  INTEGER NOT NULL REFERENCES users(id),
                content    TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user1_id        INTEGER NOT NULL REFERENCES users(id),
                user2_id        INTEGER NOT NULL REFERENCES users(id),
                last_message_id INTEGER REFERENCES private_messages(id),
                updated_at      TEXT NOT NULL,
                UNIQUE(user1_id, user2_id),
                CHECK(user1_id < user2_id)
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id      INTEGER NOT NULL REFERENCES users(id),
                type         TEXT NOT NULL,
                title        TEXT NOT NULL,
                message      TEXT NOT NULL,
                related_id   INTEGER,
                related_type TEXT,
                actor_id     INTEGER REFERENCES users(id),
                is_read      INTEGER NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS posts (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    INTEGER NOT NULL REFERENCES users(id),
                content    TEXT NOT NULL,
                privacy    INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS likes (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id    INTEGER NOT NULL REFERENCES posts(id),
                user_id    INTEGER NOT NULL REFERENCES users(id),
                is_like    INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, post_id)
            );
            ",
        )?;

        // Databases created by the older backend lack read_at.
        // ALTER TABLE ADD COLUMN is idempotent-safe via error suppression.
        let migrations = ["ALTER TABLE private_messages ADD COLUMN read_at TEXT"];
        for sql in &migrations {
            let _ = self.conn.execute(sql, []);
        }

        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Create a user and return its id.
    pub fn create_user(&self, username: &str, email: &str, password_hash: &str) -> SqlResult<UserId> {
        self.conn.execute(
            "INSERT INTO users (username, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, email, password_hash, timestamp(Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Look up a user by username or email (login accepts either).
    pub fn find_user_by_identifier(&self, identifier: &str) -> SqlResult<Option<UserRow>> {
        self.conn
            .query_row(
                "SELECT id, username, email, password_hash, is_private FROM users
                 WHERE username = ?1 OR email = ?1",
                params![identifier],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        password_hash: row.get(3)?,
                        is_private: row.get::<_, i32>(4)? != 0,
                    })
                },
            )
            .optional()
    }

    pub fn user_exists(&self, user_id: UserId) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![user_id],
            |row| row.get(0),
        )
    }

    pub fn username(&self, user_id: UserId) -> SqlResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn set_private(&self, user_id: UserId, is_private: bool) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE users SET is_private = ?1 WHERE id = ?2",
            params![is_private as i32, user_id],
        )?;
        Ok(())
    }

    pub fn delete_user(&self, user_id: UserId) -> SqlResult<()> {
        self.conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        Ok(())
    }

    // ── Relationships ──────────────────────────────────────────────────

    /// Insert or update the follow edge `follower -> followed`.
    pub fn set_follow(&self, follower: UserId, followed: UserId, status: FollowStatus) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO followers (follower_id, followed_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(follower_id, followed_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![follower, followed, status.as_str(), timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Whether `follower` has an accepted follow on `followed`.
    pub fn follows(&self, follower: UserId, followed: UserId) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM followers
                WHERE follower_id = ?1 AND followed_id = ?2 AND status = 'accept')",
            params![follower, followed],
            |row| row.get(0),
        )
    }

    /// Two users may chat if an accepted follow exists in either direction.
    pub fn can_message(&self, a: UserId, b: UserId) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM followers
                WHERE ((follower_id = ?1 AND followed_id = ?2)
                    OR (follower_id = ?2 AND followed_id = ?1))
                  AND status = 'accept')",
            params![a, b],
            |row| row.get(0),
        )
    }

    /// Accepted followers of `user_id` plus users `user_id` follows (accepted).
    pub fn related_users(&self, user_id: UserId) -> SqlResult<BTreeSet<UserId>> {
        let mut stmt = self.conn.prepare(
            "SELECT follower_id FROM followers WHERE followed_id = ?1 AND status = 'accept'
             UNION
             SELECT followed_id FROM followers WHERE follower_id = ?1 AND status = 'accept'",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, UserId>(0))?;
        let mut related = BTreeSet::new();
        for id in rows {
            let id = id?;
            if id != user_id {
                related.insert(id);
            }
        }
        Ok(related)
    }

    /// Instant delivery rule for REST direct messages: the receiver follows
    /// the sender, or the receiver's profile is public.
    pub fn receives_instantly(&self, sender: UserId, receiver: UserId) -> SqlResult<bool> {
        if self.follows(receiver, sender)? {
            return Ok(true);
        }
        let private: Option<i32> = self
            .conn
            .query_row(
                "SELECT is_private FROM users WHERE id = ?1",
                params![receiver],
                |row| row.get(0),
            )
            .optional()?;
        Ok(private == Some(0))
    }

    pub fn add_close_friend(&self, user_id: UserId, friend_id: UserId) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO close_friends (user_id, close_friend_id) VALUES (?1, ?2)",
            params![user_id, friend_id],
        )?;
        Ok(())
    }

    // ── Groups ─────────────────────────────────────────────────────────

    /// Create a group with its creator as an accepted member.
    pub fn create_group(&self, title: &str, creator: UserId) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO groups (title, creator_id, created_at) VALUES (?1, ?2, ?3)",
            params![title, creator, timestamp(Utc::now())],
        )?;
        let group_id = self.conn.last_insert_rowid();
        self.set_group_member(group_id, creator, MemberStatus::Accepted)?;
        Ok(group_id)
    }

    pub fn set_group_member(&self, group_id: i64, user_id: UserId, status: MemberStatus) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO group_members (group_id, user_id, status) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, user_id) DO UPDATE SET status = excluded.status",
            params![group_id, user_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn is_group_member(&self, group_id: i64, user_id: UserId) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM group_members
                WHERE group_id = ?1 AND user_id = ?2 AND status = 'accepted')",
            params![group_id, user_id],
            |row| row.get(0),
        )
    }

    /// Accepted members of a group, in id order.
    pub fn group_members(&self, group_id: i64) -> SqlResult<Vec<UserId>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM group_members
             WHERE group_id = ?1 AND status = 'accepted'
             ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![group_id], |row| row.get(0))?;
        rows.collect()
    }

    // ── Direct messages ────────────────────────────────────────────────

    /// Store a direct message and bump the pair's conversation in one transaction.
    pub fn insert_direct_message(
        &mut self,
        sender: UserId,
        receiver: UserId,
        content: &str,
        at: DateTime<Utc>,
    ) -> SqlResult<i64> {
        let created_at = timestamp(at);
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO private_messages (sender_id, receiver_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![sender, receiver, content, created_at],
        )?;
        let message_id = tx.last_insert_rowid();
        let (user1, user2) = if sender < receiver { (sender, receiver) } else { (receiver, sender) };
        tx.execute(
            "INSERT INTO conversations (user1_id, user2_id, last_message_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user1_id, user2_id) DO UPDATE SET
                last_message_id = excluded.last_message_id,
                updated_at = excluded.updated_at",
            params![user1, user2, message_id, created_at],
        )?;
        tx.commit()?;
        Ok(message_id)
    }

    pub fn direct_message(&self, message_id: i64) -> SqlResult<Option<DirectMessageRow>> {
        self.conn
            .query_row(
                "SELECT m.id, m.sender_id, m.receiver_id, u.username, m.content, m.is_read, m.read_at, m.created_at
                 FROM private_messages m JOIN users u ON u.id = m.sender_id
                 WHERE m.id = ?1",
                params![message_id],
                map_direct_message,
            )
            .optional()
    }

    /// Unread messages addressed to `user_id`, oldest first.
    pub fn unread_direct_messages(&self, user_id: UserId) -> SqlResult<Vec<DirectMessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.sender_id, m.receiver_id, u.username, m.content, m.is_read, m.read_at, m.created_at
             FROM private_messages m JOIN users u ON u.id = m.sender_id
             WHERE m.receiver_id = ?1 AND m.is_read = 0
             ORDER BY m.created_at ASC, m.id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], map_direct_message)?;
        rows.collect()
    }

    /// Highest direct message id stored so far, 0 when there are none.
    pub fn latest_direct_message_id(&self) -> SqlResult<i64> {
        self.conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM private_messages", [], |row| row.get(0))
    }

    pub fn mark_direct_message_read(&self, message_id: i64, at: DateTime<Utc>) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE private_messages SET is_read = 1, read_at = ?1 WHERE id = ?2",
            params![timestamp(at), message_id],
        )?;
        Ok(())
    }

    /// Mark a message read on behalf of its receiver. Returns the original
    /// sender, or `None` if no such message is addressed to `reader`.
    pub fn mark_read_by_receiver(
        &self,
        message_id: i64,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> SqlResult<Option<UserId>> {
        let sender: Option<UserId> = self
            .conn
            .query_row(
                "SELECT sender_id FROM private_messages WHERE id = ?1 AND receiver_id = ?2",
                params![message_id, reader],
                |row| row.get(0),
            )
            .optional()?;
        if sender.is_some() {
            self.mark_direct_message_read(message_id, at)?;
        }
        Ok(sender)
    }

    pub fn conversation(&self, a: UserId, b: UserId) -> SqlResult<Option<ConversationRow>> {
        let (user1, user2) = if a < b { (a, b) } else { (b, a) };
        self.conn
            .query_row(
                "SELECT id, user1_id, user2_id, last_message_id, updated_at FROM conversations
                 WHERE user1_id = ?1 AND user2_id = ?2",
                params![user1, user2],
                |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        user1_id: row.get(1)?,
                        user2_id: row.get(2)?,
                        last_message_id: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    // ── Group chat ─────────────────────────────────────────────────────

    pub fn insert_group_message(
        &self,
        group_id: i64,
        sender: UserId,
        content: &str,
        at: DateTime<Utc>,
    ) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO group_chat_messages (group_id, sender_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_id, sender, content, timestamp(at)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn group_message_count(&self, group_id: i64) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM group_chat_messages WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )
    }

    // ── Notifications ──────────────────────────────────────────────────

    pub fn insert_notification(&self, n: &NewNotification) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO notifications (user_id, type, title, message, related_id, related_type, actor_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                n.user_id,
                n.kind,
                n.title,
                n.message,
                n.related_id,
                n.related_type,
                n.actor_id,
                timestamp(Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Unread notifications for a user, optionally restricted to one type.
    pub fn unread_notification_count(&self, user_id: UserId, kind: Option<&str>) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM notifications
             WHERE user_id = ?1 AND is_read = 0 AND (?2 IS NULL OR type = ?2)",
            params![user_id, kind],
            |row| row.get(0),
        )
    }

    /// Mark notifications read, optionally only one type. Returns rows changed.
    pub fn mark_notifications_read(&self, user_id: UserId, kind: Option<&str>) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE notifications SET is_read = 1
             WHERE user_id = ?1 AND is_read = 0 AND (?2 IS NULL OR type = ?2)",
            params![user_id, kind],
        )
    }

    // ── Posts & likes ──────────────────────────────────────────────────

    pub fn create_post(
        &self,
        user_id: UserId,
        content: &str,
        privacy: Privacy,
        at: DateTime<Utc>,
    ) -> SqlResult<PostRow> {
        let created_at = timestamp(at);
        self.conn.execute(
            "INSERT INTO posts (user_id, content, privacy, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, content, privacy.level(), created_at],
        )?;
        Ok(PostRow {
            id: self.conn.last_insert_rowid(),
            user_id,
            content: content.to_string(),
            privacy,
            created_at,
        })
    }

    /// Same predicate the feed query applies: public, or followers-only and
    /// the viewer is the author or an accepted follower, or close-friends and
    /// the viewer is the author or on the author's close-friends list.
    pub fn can_view_post(&self, viewer: UserId, author: UserId, privacy: Privacy) -> SqlResult<bool> {
        if viewer == author {
            return Ok(true);
        }
        match privacy {
            Privacy::Public => Ok(true),
            Privacy::Followers => self.follows(viewer, author),
            Privacy::CloseFriends => self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM close_friends WHERE user_id = ?1 AND close_friend_id = ?2)",
                params![author, viewer],
                |row| row.get(0),
            ),
        }
    }

    /// Toggle a like or dislike. Same reaction twice removes it, the
    /// opposite reaction switches it. Returns `None` if the post is unknown.
    pub fn toggle_like(&mut self, post_id: i64, user_id: UserId, is_like: bool) -> SqlResult<Option<LikeOutcome>> {
        let tx = self.conn.transaction()?;
        let owner: Option<UserId> = tx
            .query_row("SELECT user_id FROM posts WHERE id = ?1", params![post_id], |row| row.get(0))
            .optional()?;
        let Some(post_owner) = owner else {
            return Ok(None);
        };

        let existing: Option<(i64, bool)> = tx
            .query_row(
                "SELECT id, is_like FROM likes WHERE user_id = ?1 AND post_id = ?2",
                params![user_id, post_id],
                |row| Ok((row.get(0)?, row.get::<_, i32>(1)? != 0)),
            )
            .optional()?;

        let became_like = match existing {
            None => {
                tx.execute(
                    "INSERT INTO likes (post_id, user_id, is_like, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![post_id, user_id, is_like as i32, timestamp(Utc::now())],
                )?;
                is_like
            }
            Some((id, current)) if current == is_like => {
                tx.execute("DELETE FROM likes WHERE id = ?1", params![id])?;
                false
            }
            Some((id, _)) => {
                tx.execute("UPDATE likes SET is_like = ?1 WHERE id = ?2", params![is_like as i32, id])?;
                is_like
            }
        };

        let mine: Option<bool> = tx
            .query_row(
                "SELECT is_like FROM likes WHERE user_id = ?1 AND post_id = ?2",
                params![user_id, post_id],
                |row| Ok(row.get::<_, i32>(0)? != 0),
            )
            .optional()?;
        let like_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM likes WHERE post_id = ?1 AND is_like = 1",
            params![post_id],
            |row| row.get(0),
        )?;
        let dislike_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM likes WHERE post_id = ?1 AND is_like = 0",
            params![post_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(Some(LikeOutcome {
            liked: mine == Some(true),
            disliked: mine == Some(false),
            like_count,
            dislike_count,
            post_owner,
            became_like,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(db: &Db, name: &str) -> UserId {
        db.create_user(name, &format!("{name}@example.com"), "hash").unwrap()
    }

    #[test]
    fn login_accepts_username_or_email() {
        let db = Db::open_memory().unwrap();
        let id = user(&db, "alice");
        assert_eq!(db.find_user_by_identifier("alice").unwrap().unwrap().id, id);
        assert_eq!(db.find_user_by_identifier("alice@example.com").unwrap().unwrap().id, id);
        assert!(db.find_user_by_identifier("nobody").unwrap().is_none());
    }

    #[test]
    fn related_users_are_accepted_edges_both_ways() {
        let db = Db::open_memory().unwrap();
        let u = user(&db, "u");
        let follower = user(&db, "follower");
        let followee = user(&db, "followee");
        let pending = user(&db, "pending");
        db.set_follow(follower, u, FollowStatus::Accepted).unwrap();
        db.set_follow(u, followee, FollowStatus::Accepted).unwrap();
        db.set_follow(pending, u, FollowStatus::Pending).unwrap();

        let related: Vec<_> = db.related_users(u).unwrap().into_iter().collect();
        assert_eq!(related, vec![follower, followee]);
        assert!(db.can_message(u, follower).unwrap());
        assert!(!db.can_message(u, pending).unwrap());
    }

    #[test]
    fn mutual_follow_counts_once() {
        let db = Db::open_memory().unwrap();
        let a = user(&db, "a");
        let b = user(&db, "b");
        db.set_follow(a, b, FollowStatus::Accepted).unwrap();
        db.set_follow(b, a, FollowStatus::Accepted).unwrap();
        assert_eq!(db.related_users(a).unwrap().len(), 1);
    }

    #[test]
    fn direct_message_upserts_ordered_conversation() {
        let mut db = Db::open_memory().unwrap();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let first = db.insert_direct_message(b, a, "hi", Utc::now()).unwrap();
        let second = db.insert_direct_message(a, b, "hey", Utc::now()).unwrap();

        let conv = db.conversation(b, a).unwrap().unwrap();
        assert!(conv.user1_id < conv.user2_id);
        assert_eq!(conv.last_message_id, Some(second));
        assert_ne!(first, second);
    }

    #[test]
    fn unread_messages_come_oldest_first() {
        let mut db = Db::open_memory().unwrap();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let t = |s| Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, s).unwrap();
        let late = db.insert_direct_message(a, b, "late", t(30)).unwrap();
        let early = db.insert_direct_message(a, b, "early", t(10)).unwrap();

        let unread = db.unread_direct_messages(b).unwrap();
        let ids: Vec<_> = unread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![early, late]);
        assert_eq!(unread[0].sender_username, "a");

        db.mark_direct_message_read(early, Utc::now()).unwrap();
        assert_eq!(db.unread_direct_messages(b).unwrap().len(), 1);
        assert!(db.direct_message(early).unwrap().unwrap().read_at.is_some());
    }

    #[test]
    fn only_receiver_can_mark_read() {
        let mut db = Db::open_memory().unwrap();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let id = db.insert_direct_message(a, b, "hi", Utc::now()).unwrap();

        assert_eq!(db.mark_read_by_receiver(id, a, Utc::now()).unwrap(), None);
        assert!(!db.direct_message(id).unwrap().unwrap().is_read);
        assert_eq!(db.mark_read_by_receiver(id, b, Utc::now()).unwrap(), Some(a));
        assert!(db.direct_message(id).unwrap().unwrap().is_read);
    }

    #[test]
    fn group_membership_requires_accepted() {
        let db = Db::open_memory().unwrap();
        let owner = user(&db, "owner");
        let invited = user(&db, "invited");
        let g = db.create_group("g", owner).unwrap();
        db.set_group_member(g, invited, MemberStatus::Invited).unwrap();

        assert!(db.is_group_member(g, owner).unwrap());
        assert!(!db.is_group_member(g, invited).unwrap());
        assert_eq!(db.group_members(g).unwrap(), vec![owner]);
    }

    #[test]
    fn notification_counts_filter_by_type() {
        let db = Db::open_memory().unwrap();
        let u = user(&db, "u");
        for kind in ["new_message", "new_message", "post_like"] {
            db.insert_notification(&NewNotification {
                user_id: u,
                kind: kind.to_string(),
                title: "t".to_string(),
                message: "m".to_string(),
                related_id: None,
                related_type: None,
                actor_id: None,
            })
            .unwrap();
        }
        assert_eq!(db.unread_notification_count(u, Some("new_message")).unwrap(), 2);
        assert_eq!(db.unread_notification_count(u, None).unwrap(), 3);
        assert_eq!(db.mark_notifications_read(u, Some("new_message")).unwrap(), 2);
        assert_eq!(db.unread_notification_count(u, None).unwrap(), 1);
    }

    #[test]
    fn post_visibility_follows_privacy_level() {
        let db = Db::open_memory().unwrap();
        let author = user(&db, "author");
        let fan = user(&db, "fan");
        let friend = user(&db, "friend");
        let stranger = user(&db, "stranger");
        db.set_follow(fan, author, FollowStatus::Accepted).unwrap();
        db.add_close_friend(author, friend).unwrap();

        assert!(db.can_view_post(stranger, author, Privacy::Public).unwrap());
        assert!(db.can_view_post(fan, author, Privacy::Followers).unwrap());
        assert!(!db.can_view_post(stranger, author, Privacy::Followers).unwrap());
        assert!(db.can_view_post(friend, author, Privacy::CloseFriends).unwrap());
        assert!(!db.can_view_post(fan, author, Privacy::CloseFriends).unwrap());
        assert!(db.can_view_post(author, author, Privacy::CloseFriends).unwrap());
    }

    #[test]
    fn like_toggles_and_switches() {
        let mut db = Db::open_memory().unwrap();
        let author = user(&db, "author");
        let fan = user(&db, "fan");
        let post = db.create_post(author, "hello", Privacy::Public, Utc::now()).unwrap();

        let liked = db.toggle_like(post.id, fan, true).unwrap().unwrap();
        assert!(liked.liked && liked.became_like);
        assert_eq!((liked.like_count, liked.dislike_count), (1, 0));

        let switched = db.toggle_like(post.id, fan, false).unwrap().unwrap();
        assert!(switched.disliked && !switched.became_like);
        assert_eq!((switched.like_count, switched.dislike_count), (0, 1));

        let removed = db.toggle_like(post.id, fan, false).unwrap().unwrap();
        assert!(!removed.liked && !removed.disliked);
        assert_eq!(removed.post_owner, author);

        assert!(db.toggle_like(999, fan, true).unwrap().is_none());
    }

    #[test]
    fn receiver_follow_or_public_profile_allows_instant_delivery() {
        let db = Db::open_memory().unwrap();
        let sender = user(&db, "sender");
        let receiver = user(&db, "receiver");
        assert!(db.receives_instantly(sender, receiver).unwrap());
        db.set_private(receiver, true).unwrap();
        assert!(!db.receives_instantly(sender, receiver).unwrap());
        db.set_follow(receiver, sender, FollowStatus::Accepted).unwrap();
        assert!(db.receives_instantly(sender, receiver).unwrap());
    }
}
