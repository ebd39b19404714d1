// Persistent chat state using SQLite
//
// Owns users, friendships, conversations, and messages. Conversation and
// friendship pairs are normalized lower-id-first before they touch a table,
// so each unordered pair maps to at most one row.

use crate::chatserver::error::{ChatError, ChatResult};
use crate::chatserver::protocol::MessageKind;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
}

/// A conversation between two users, participants stored lower-id-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub user_one_id: i64,
    pub user_two_id: i64,
    pub last_message_at: DateTime<Utc>,
}

/// A persisted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

/// One row of the friend listing: friend identity plus conversation preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendSummary {
    pub conversation_id: i64,
    pub friend_id: i64,
    pub friend_username: String,
    pub last_message: Option<String>,
    pub unread_count: i64,
}

/// Scan direction for a bounded history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    OldestFirst,
    NewestFirst,
}

/// Normalize an unordered user pair to the canonical lower-id-first form.
pub fn normalize_pair(a: i64, b: i64) -> (i64, i64) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Chat persistence layer.
pub struct ChatStore {
    db_path: PathBuf,
}

impl ChatStore {
    pub fn new(base_dir: &Path) -> ChatResult<Self> {
        std::fs::create_dir_all(base_dir)
            .map_err(|e| ChatError::Validation(format!("cannot create data dir: {}", e)))?;

        let store = Self {
            db_path: base_dir.join("chat.db"),
        };

        store.initialize_db()?;

        Ok(store)
    }

    fn get_connection(&self) -> ChatResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(conn)
    }

    fn initialize_db(&self) -> ChatResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS friendships (
                user_a_id INTEGER NOT NULL,
                user_b_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'accepted',
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_a_id, user_b_id),
                FOREIGN KEY (user_a_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (user_b_id) REFERENCES users(id) ON DELETE CASCADE
            )",
            [],
        )?;

        // The UNIQUE constraint on the normalized pair is what makes
        // resolve_or_create safe under concurrent first contact.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_one_id INTEGER NOT NULL,
                user_two_id INTEGER NOT NULL,
                last_message_at TEXT NOT NULL,
                UNIQUE (user_one_id, user_two_id),
                FOREIGN KEY (user_one_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (user_two_id) REFERENCES users(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                timestamp TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, timestamp)",
            [],
        )?;

        Ok(())
    }

    // ========== Users ==========

    /// Create a user. The first registered user becomes an admin.
    pub fn create_user(&self, username: &str, password_hash: &str) -> ChatResult<User> {
        if username.is_empty() {
            return Err(ChatError::Validation("username must not be empty".into()));
        }

        let conn = self.get_connection()?;

        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let is_admin = existing == 0;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, password_hash, is_admin) VALUES (?1, ?2, ?3)",
            params![username, password_hash, is_admin as i64],
        )?;

        if inserted == 0 {
            return Err(ChatError::Validation(format!(
                "username '{}' already exists",
                username
            )));
        }

        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            is_admin,
        })
    }

    pub fn get_user(&self, id: i64) -> ChatResult<Option<User>> {
        let conn = self.get_connection()?;

        let user = conn
            .query_row(
                "SELECT id, username, password_hash, is_admin FROM users WHERE id = ?1",
                params![id],
                map_user,
            )
            .optional()?;

        Ok(user)
    }

    pub fn get_user_by_name(&self, username: &str) -> ChatResult<Option<User>> {
        let conn = self.get_connection()?;

        let user = conn
            .query_row(
                "SELECT id, username, password_hash, is_admin FROM users WHERE username = ?1",
                params![username],
                map_user,
            )
            .optional()?;

        Ok(user)
    }

    pub fn list_users(&self) -> ChatResult<Vec<User>> {
        let conn = self.get_connection()?;

        let mut stmt =
            conn.prepare("SELECT id, username, password_hash, is_admin FROM users ORDER BY id")?;
        let users = stmt
            .query_map([], map_user)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(users)
    }

    /// Flip a user's admin flag. Admins may not change their own flag.
    pub fn set_admin(&self, acting_admin: i64, target: i64, is_admin: bool) -> ChatResult<()> {
        if acting_admin == target {
            return Err(ChatError::Forbidden(
                "cannot modify your own admin status".into(),
            ));
        }

        let conn = self.get_connection()?;
        let updated = conn.execute(
            "UPDATE users SET is_admin = ?1 WHERE id = ?2",
            params![is_admin as i64, target],
        )?;

        if updated == 0 {
            return Err(ChatError::NotFound);
        }

        Ok(())
    }

    /// Remove a user and everything attached to them: messages in their
    /// conversations, their friendships, and the conversations themselves.
    pub fn delete_user(&self, acting_admin: i64, target: i64) -> ChatResult<()> {
        if acting_admin == target {
            return Err(ChatError::Forbidden("cannot delete your own account".into()));
        }

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM users WHERE id = ?1", params![target], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(ChatError::NotFound);
        }

        tx.execute(
            "DELETE FROM messages WHERE sender_id = ?1 OR conversation_id IN
                 (SELECT id FROM conversations WHERE user_one_id = ?1 OR user_two_id = ?1)",
            params![target],
        )?;
        tx.execute(
            "DELETE FROM friendships WHERE user_a_id = ?1 OR user_b_id = ?1",
            params![target],
        )?;
        tx.execute(
            "DELETE FROM conversations WHERE user_one_id = ?1 OR user_two_id = ?1",
            params![target],
        )?;
        tx.execute("DELETE FROM users WHERE id = ?1", params![target])?;

        tx.commit()?;
        Ok(())
    }

    // ========== Friendships ==========

    /// Record a friendship and eagerly create the conversation for the pair.
    pub fn add_friend(&self, user_id: i64, friend_id: i64) -> ChatResult<()> {
        if user_id == friend_id {
            return Err(ChatError::Validation("cannot add yourself as friend".into()));
        }

        let (a, b) = normalize_pair(user_id, friend_id);
        let conn = self.get_connection()?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO friendships (user_a_id, user_b_id, status, created_at)
             VALUES (?1, ?2, 'accepted', ?3)",
            params![a, b, Utc::now().to_rfc3339()],
        )?;

        if inserted == 0 {
            return Err(ChatError::Validation("already friends".into()));
        }

        drop(conn);
        self.resolve_or_create_conversation(user_id, friend_id)?;

        Ok(())
    }

    pub fn remove_friend(&self, user_id: i64, friend_id: i64) -> ChatResult<()> {
        let (a, b) = normalize_pair(user_id, friend_id);
        let conn = self.get_connection()?;

        let deleted = conn.execute(
            "DELETE FROM friendships WHERE user_a_id = ?1 AND user_b_id = ?2",
            params![a, b],
        )?;

        if deleted == 0 {
            return Err(ChatError::NotFound);
        }

        Ok(())
    }

    /// Friends of a user with conversation previews, for the contact list.
    pub fn list_friends(&self, user_id: i64) -> ChatResult<Vec<FriendSummary>> {
        let conn = self.get_connection()?;

        let mut stmt = conn.prepare(
            "SELECT u.id, u.username FROM friendships f
             JOIN users u ON u.id = CASE WHEN f.user_a_id = ?1 THEN f.user_b_id ELSE f.user_a_id END
             WHERE (f.user_a_id = ?1 OR f.user_b_id = ?1) AND f.status = 'accepted'
             ORDER BY u.id",
        )?;
        let friends = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut results = Vec::with_capacity(friends.len());
        for (friend_id, friend_username) in friends {
            let conversation = self.resolve_or_create_conversation(user_id, friend_id)?;

            let conn = self.get_connection()?;
            let last_message: Option<String> = conn
                .query_row(
                    "SELECT content FROM messages WHERE conversation_id = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT 1",
                    params![conversation.id],
                    |row| row.get(0),
                )
                .optional()?;

            drop(conn);
            let unread_count = self.unread_count(conversation.id, user_id)?;

            results.push(FriendSummary {
                conversation_id: conversation.id,
                friend_id,
                friend_username,
                last_message,
                unread_count,
            });
        }

        Ok(results)
    }

    // ========== Conversations ==========

    /// Find or create the single conversation for an unordered user pair.
    ///
    /// Safe under concurrent first contact from both directions: the UNIQUE
    /// constraint rejects the losing insert and the loser retries the lookup.
    pub fn resolve_or_create_conversation(&self, a: i64, b: i64) -> ChatResult<Conversation> {
        let (lo, hi) = normalize_pair(a, b);

        if let Some(conversation) = self.lookup_conversation(lo, hi)? {
            return Ok(conversation);
        }

        let conn = self.get_connection()?;
        let insert = conn.execute(
            "INSERT INTO conversations (user_one_id, user_two_id, last_message_at)
             VALUES (?1, ?2, ?3)",
            params![lo, hi, Utc::now().to_rfc3339()],
        );

        match insert {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                drop(conn);
                self.get_conversation(id)?.ok_or(ChatError::NotFound)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                // Lost the race: the row exists now.
                drop(conn);
                self.lookup_conversation(lo, hi)?.ok_or(ChatError::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lookup_conversation(&self, lo: i64, hi: i64) -> ChatResult<Option<Conversation>> {
        let conn = self.get_connection()?;

        let conversation = conn
            .query_row(
                "SELECT id, user_one_id, user_two_id, last_message_at
                 FROM conversations WHERE user_one_id = ?1 AND user_two_id = ?2",
                params![lo, hi],
                map_conversation,
            )
            .optional()?;

        Ok(conversation)
    }

    pub fn get_conversation(&self, id: i64) -> ChatResult<Option<Conversation>> {
        let conn = self.get_connection()?;

        let conversation = conn
            .query_row(
                "SELECT id, user_one_id, user_two_id, last_message_at
                 FROM conversations WHERE id = ?1",
                params![id],
                map_conversation,
            )
            .optional()?;

        Ok(conversation)
    }

    /// Whether `user_id` is one of the two participants.
    pub fn is_participant(&self, conversation_id: i64, user_id: i64) -> ChatResult<bool> {
        let conversation = self
            .get_conversation(conversation_id)?
            .ok_or(ChatError::NotFound)?;
        Ok(conversation.user_one_id == user_id || conversation.user_two_id == user_id)
    }

    // ========== Messages ==========

    /// Persist a message (read=false, server timestamp) and bump the
    /// conversation's last-activity time in the same transaction.
    pub fn append_message(
        &self,
        conversation_id: i64,
        sender_id: i64,
        content: &str,
        kind: MessageKind,
    ) -> ChatResult<StoredMessage> {
        let timestamp = Utc::now();

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO messages (conversation_id, sender_id, content, kind, timestamp, is_read)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                conversation_id,
                sender_id,
                content,
                kind.as_str(),
                timestamp.to_rfc3339()
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
            params![timestamp.to_rfc3339(), conversation_id],
        )?;

        tx.commit()?;

        Ok(StoredMessage {
            id,
            conversation_id,
            sender_id,
            content: content.to_string(),
            kind,
            timestamp,
            is_read: false,
        })
    }

    /// Bulk-flip the read flag for all unread messages in a conversation not
    /// sent by `excluding_sender`. Used when the recipient fetches history.
    pub fn mark_read(&self, conversation_id: i64, excluding_sender: i64) -> ChatResult<usize> {
        let conn = self.get_connection()?;

        let updated = conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE conversation_id = ?1 AND is_read = 0 AND sender_id != ?2",
            params![conversation_id, excluding_sender],
        )?;

        Ok(updated)
    }

    /// Flip the read flag for exactly one message (immediate-delivery ack).
    pub fn mark_single_read(&self, message_id: i64) -> ChatResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "UPDATE messages SET is_read = 1 WHERE id = ?1",
            params![message_id],
        )?;

        Ok(())
    }

    /// A bounded page of messages. Rows come back in scan order: ascending by
    /// time for `OldestFirst`, descending for `NewestFirst`; equal timestamps
    /// break ties by id so listing never contradicts insertion order.
    pub fn list_messages(
        &self,
        conversation_id: i64,
        limit: u32,
        order: Order,
    ) -> ChatResult<Vec<StoredMessage>> {
        let conn = self.get_connection()?;

        let sql = match order {
            Order::OldestFirst => {
                "SELECT id, conversation_id, sender_id, content, kind, timestamp, is_read
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY timestamp ASC, id ASC LIMIT ?2"
            }
            Order::NewestFirst => {
                "SELECT id, conversation_id, sender_id, content, kind, timestamp, is_read
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            }
        };

        let mut stmt = conn.prepare(sql)?;
        let messages = stmt
            .query_map(params![conversation_id, limit], map_message)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    pub fn get_message(&self, id: i64) -> ChatResult<Option<StoredMessage>> {
        let conn = self.get_connection()?;

        let message = conn
            .query_row(
                "SELECT id, conversation_id, sender_id, content, kind, timestamp, is_read
                 FROM messages WHERE id = ?1",
                params![id],
                map_message,
            )
            .optional()?;

        Ok(message)
    }

    /// Messages in a conversation that `for_user` has not read yet.
    pub fn unread_count(&self, conversation_id: i64, for_user: i64) -> ChatResult<i64> {
        let conn = self.get_connection()?;

        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND is_read = 0 AND sender_id != ?2",
            params![conversation_id, for_user],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    /// Remove every message in a conversation in one statement. Only a
    /// participant may clear a conversation.
    pub fn delete_all_messages(&self, conversation_id: i64, acting_user: i64) -> ChatResult<usize> {
        if !self.is_participant(conversation_id, acting_user)? {
            return Err(ChatError::Forbidden(
                "not part of this conversation".into(),
            ));
        }

        let conn = self.get_connection()?;

        let deleted = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;

        Ok(deleted)
    }
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        is_admin: row.get::<_, i64>(3)? != 0,
    })
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_one_id: row.get(1)?,
        user_two_id: row.get(2)?,
        last_message_at: parse_timestamp(3, row.get::<_, String>(3)?)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        kind: MessageKind::from_str(&row.get::<_, String>(4)?),
        timestamp: parse_timestamp(5, row.get::<_, String>(5)?)?,
        is_read: row.get::<_, i64>(6)? != 0,
    })
}

fn parse_timestamp(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
