use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, Row, params};
use std::path::Path;
use std::sync::MutexGuard;

use super::database::Database;
use crate::common::{AttachmentKind, Chat, Message};
use crate::error::{ChatError, Result};

pub(crate) const CHAT_COLUMNS: &str = "id, participant_a, participant_b, last_message_text, \
     last_message_sender, last_message_at, unread_count_a, unread_count_b, \
     last_activity_at, is_active, created_at, updated_at";

pub(crate) const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, attachment_url, \
     attachment_type, is_read, read_at, is_deleted, created_at";

/// Limits the store enforces on its own, whatever the client checked.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_message_chars: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_message_chars: 4000,
        }
    }
}

/// Server-side store for chats, messages and unread counters.
///
/// Operations are grouped by concern in `sessions`, `messages` and `unread`.
pub struct ChatDatabase {
    db: Database,
    limits: StoreLimits,
}

impl ChatDatabase {
    /// Open (or create) the store at `path`.
    pub fn with_path<P: AsRef<Path>>(path: P, limits: StoreLimits) -> Result<Self> {
        let chat_db = Self {
            db: Database::new(path)?,
            limits,
        };
        chat_db.init_schema()?;
        Ok(chat_db)
    }

    pub fn in_memory() -> Result<Self> {
        let chat_db = Self {
            db: Database::in_memory()?,
            limits: StoreLimits::default(),
        };
        chat_db.init_schema()?;
        Ok(chat_db)
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub(super) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.db.connection()
    }

    fn init_schema(&self) -> SqlResult<()> {
        let conn = self.db.connection();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                last_message_text TEXT,
                last_message_sender TEXT,
                last_message_at INTEGER,
                unread_count_a INTEGER NOT NULL DEFAULT 0,
                unread_count_b INTEGER NOT NULL DEFAULT 0,
                last_activity_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK (participant_a <> participant_b)
            )",
            [],
        )?;

        // One active chat per unordered pair.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_active_pair
             ON chats(min(participant_a, participant_b), max(participant_a, participant_b))
             WHERE is_active = 1",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id),
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                attachment_url TEXT,
                attachment_type TEXT CHECK (attachment_type IN ('image', 'file')),
                is_read INTEGER NOT NULL DEFAULT 0,
                read_at INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Indexes
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chats_participant_a ON chats(participant_a)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chats_participant_b ON chats(participant_b)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_chat_order ON messages(chat_id, created_at, id)",
            [],
        )?;

        Ok(())
    }

    /// Load a chat by id.
    pub fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let conn = self.db.connection();
        Ok(load_chat(&conn, chat_id)?)
    }
}

/// Load a chat and check that `user_id` takes part in it.
pub(crate) fn participant_chat(conn: &Connection, chat_id: &str, user_id: &str) -> Result<Chat> {
    let chat =
        load_chat(conn, chat_id)?.ok_or_else(|| ChatError::NotFound(format!("chat {chat_id}")))?;
    if !chat.has_participant(user_id) {
        return Err(ChatError::Permission(format!(
            "{user_id} is not a participant of chat {chat_id}"
        )));
    }
    Ok(chat)
}

pub(crate) fn load_chat(conn: &Connection, chat_id: &str) -> SqlResult<Option<Chat>> {
    conn.query_row(
        &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
        params![chat_id],
        chat_from_row,
    )
    .optional()
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn chat_from_row(row: &Row<'_>) -> SqlResult<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        last_message_text: row.get(3)?,
        last_message_sender: row.get(4)?,
        last_message_at: row.get::<_, Option<i64>>(5)?.map(to_datetime),
        unread_count_a: row.get(6)?,
        unread_count_b: row.get(7)?,
        last_activity_at: to_datetime(row.get(8)?),
        is_active: row.get::<_, i64>(9)? != 0,
        created_at: to_datetime(row.get(10)?),
        updated_at: to_datetime(row.get(11)?),
    })
}

pub(crate) fn message_from_row(row: &Row<'_>) -> SqlResult<Message> {
    let attachment_type = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(
            raw.parse::<AttachmentKind>()
                .map_err(|err| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, err.into()))?,
        ),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        attachment_url: row.get(4)?,
        attachment_type,
        is_read: row.get::<_, i64>(6)? != 0,
        read_at: row.get::<_, Option<i64>>(7)?.map(to_datetime),
        is_deleted: row.get::<_, i64>(8)? != 0,
        created_at: to_datetime(row.get(9)?),
    })
}
