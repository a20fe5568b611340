//! Lookup-or-create of 1:1 chats.

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};
use uuid::Uuid;

use super::chat_db::{CHAT_COLUMNS, ChatDatabase, chat_from_row, load_chat, now_millis, participant_chat};
use crate::common::Chat;
use crate::error::{ChatError, Result};

impl ChatDatabase {
    /// Return the active chat between `user_a` and `user_b`, creating it when missing.
    ///
    /// Argument order does not matter. Callers racing on the same pair all get
    /// the same row: whoever loses the insert picks up the winner's chat.
    pub fn get_or_create_chat(&self, user_a: &str, user_b: &str) -> Result<Chat> {
        check_user_id(user_a)?;
        check_user_id(user_b)?;
        if user_a == user_b {
            return Err(ChatError::Validation(
                "a chat needs two different participants".into(),
            ));
        }

        if let Some(chat) = self.find_active_chat(user_a, user_b)? {
            return Ok(chat);
        }

        match self.insert_chat(user_a, user_b) {
            Ok(chat) => {
                log::info!("Created chat {} for {user_a} and {user_b}", chat.id);
                Ok(chat)
            }
            Err(ChatError::Conflict(reason)) => {
                log::debug!("Chat creation lost a race ({reason}); loading the winner");
                self.find_active_chat(user_a, user_b)?.ok_or_else(|| {
                    ChatError::Internal(format!(
                        "chat for {user_a} and {user_b} vanished after a conflicting insert"
                    ))
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Pair lookup matching both `(a, b)` and `(b, a)`.
    pub fn find_active_chat(&self, user_a: &str, user_b: &str) -> Result<Option<Chat>> {
        let conn = self.connection();
        Ok(find_active_chat(&conn, user_a, user_b)?)
    }

    /// Plain insert. Fails with `Conflict` when an active chat for the pair exists.
    pub(crate) fn insert_chat(&self, user_a: &str, user_b: &str) -> Result<Chat> {
        let conn = self.connection();
        let id = Uuid::new_v4().to_string();
        let now = now_millis();

        let inserted = conn.execute(
            "INSERT INTO chats (id, participant_a, participant_b, last_activity_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
            params![id, user_a, user_b, now],
        );

        match inserted {
            Ok(_) => load_chat(&conn, &id)?
                .ok_or_else(|| ChatError::Internal(format!("chat {id} missing after insert"))),
            Err(err) if ChatError::is_constraint_violation(&err) => Err(ChatError::Conflict(
                format!("active chat already exists for {user_a} and {user_b}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Active chats of `user_id`, most recent activity first.
    pub fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHAT_COLUMNS}
             FROM chats
             WHERE is_active = 1 AND (participant_a = ?1 OR participant_b = ?1)
             ORDER BY last_activity_at DESC, id ASC"
        ))?;

        let chats = stmt
            .query_map(params![user_id], chat_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(chats)
    }

    /// Hide a chat for both participants. Chats are never deleted.
    pub fn deactivate_chat(&self, chat_id: &str, user_id: &str) -> Result<Chat> {
        let conn = self.connection();
        participant_chat(&conn, chat_id, user_id)?;

        conn.execute(
            "UPDATE chats SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![chat_id, now_millis()],
        )?;
        log::info!("Chat {chat_id} deactivated by {user_id}");

        load_chat(&conn, chat_id)?
            .ok_or_else(|| ChatError::NotFound(format!("chat {chat_id}")))
    }
}

/// Ids are compared verbatim everywhere, so padded ids are refused up front.
fn check_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(ChatError::Validation("participant id must not be empty".into()));
    }
    if user_id.trim() != user_id {
        return Err(ChatError::Validation(format!(
            "participant id {user_id:?} has surrounding whitespace"
        )));
    }
    Ok(())
}

fn find_active_chat(conn: &Connection, user_a: &str, user_b: &str) -> SqlResult<Option<Chat>> {
    conn.query_row(
        &format!(
            "SELECT {CHAT_COLUMNS}
             FROM chats
             WHERE is_active = 1
               AND ((participant_a = ?1 AND participant_b = ?2)
                 OR (participant_a = ?2 AND participant_b = ?1))"
        ),
        params![user_a, user_b],
        chat_from_row,
    )
    .optional()
}
