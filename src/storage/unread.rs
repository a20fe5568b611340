//! Unread counter reads and drift repair.
//!
//! The counters on `chats` are only ever moved by SQL deltas inside
//! `send_message` / `mark_as_read`. The repair functions rebuild them from the
//! message table and are not part of the normal write path.

use rusqlite::{Connection, Result as SqlResult, params};

use super::chat_db::{ChatDatabase, load_chat, participant_chat};
use crate::common::Chat;
use crate::error::{ChatError, Result};

const RECOMPUTE_SQL: &str = "UPDATE chats SET
        unread_count_a = (SELECT COUNT(*) FROM messages m
                          WHERE m.chat_id = chats.id AND m.sender_id <> chats.participant_a
                            AND m.is_read = 0 AND m.is_deleted = 0),
        unread_count_b = (SELECT COUNT(*) FROM messages m
                          WHERE m.chat_id = chats.id AND m.sender_id <> chats.participant_b
                            AND m.is_read = 0 AND m.is_deleted = 0)";

impl ChatDatabase {
    /// Counter value for `user_id` in one chat.
    pub fn unread_count(&self, chat_id: &str, user_id: &str) -> Result<i64> {
        let conn = self.connection();
        let chat = participant_chat(&conn, chat_id, user_id)?;
        Ok(chat.unread_for(user_id).unwrap_or_default())
    }

    /// Sum of `user_id`'s counters across active chats.
    pub fn total_unread(&self, user_id: &str) -> Result<i64> {
        let conn = self.connection();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN participant_a = ?1 THEN unread_count_a ELSE unread_count_b END), 0)
             FROM chats
             WHERE is_active = 1 AND (participant_a = ?1 OR participant_b = ?1)",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Rebuild one chat's counters from its messages.
    pub fn recompute_unread(&self, chat_id: &str) -> Result<Chat> {
        let conn = self.connection();
        let before = load_chat(&conn, chat_id)?
            .ok_or_else(|| ChatError::NotFound(format!("chat {chat_id}")))?;

        conn.execute(&format!("{RECOMPUTE_SQL} WHERE id = ?1"), params![chat_id])?;

        let after = load_chat(&conn, chat_id)?
            .ok_or_else(|| ChatError::NotFound(format!("chat {chat_id}")))?;
        if (before.unread_count_a, before.unread_count_b) != (after.unread_count_a, after.unread_count_b) {
            log::warn!(
                "Unread drift repaired in chat {chat_id}: ({}, {}) -> ({}, {})",
                before.unread_count_a,
                before.unread_count_b,
                after.unread_count_a,
                after.unread_count_b
            );
        }
        Ok(after)
    }

    /// Rebuild every chat's counters. Returns the number of chats whose counters changed.
    pub fn repair_all_unread(&self) -> Result<usize> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;

        let before = counter_snapshot(&tx)?;
        tx.execute(RECOMPUTE_SQL, [])?;
        let after = counter_snapshot(&tx)?;
        tx.commit()?;

        let changed = before
            .iter()
            .zip(after.iter())
            .filter(|(old, new)| old != new)
            .count();
        log::info!("Unread repair checked {} chats, fixed {changed}", after.len());
        Ok(changed)
    }
}

fn counter_snapshot(conn: &Connection) -> SqlResult<Vec<(String, i64, i64)>> {
    let mut stmt =
        conn.prepare("SELECT id, unread_count_a, unread_count_b FROM chats ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_sends_and_reads() {
        let db = ChatDatabase::in_memory().unwrap();
        let chat = db.get_or_create_chat("alice", "bob").unwrap();
        let other = db.get_or_create_chat("carol", "bob").unwrap();

        for _ in 0..4 {
            db.send_message(&chat.id, "alice", "ping", None).unwrap();
        }
        db.send_message(&other.id, "carol", "hey", None).unwrap();

        assert_eq!(db.unread_count(&chat.id, "bob").unwrap(), 4);
        assert_eq!(db.total_unread("bob").unwrap(), 5);
        assert_eq!(db.total_unread("alice").unwrap(), 0);

        db.mark_as_read(&chat.id, "bob").unwrap();
        assert_eq!(db.unread_count(&chat.id, "bob").unwrap(), 0);
        assert_eq!(db.total_unread("bob").unwrap(), 1);
    }

    #[test]
    fn recompute_fixes_drift() {
        let db = ChatDatabase::in_memory().unwrap();
        let chat = db.get_or_create_chat("alice", "bob").unwrap();
        let first = db.send_message(&chat.id, "alice", "one", None).unwrap();
        db.send_message(&chat.id, "alice", "two", None).unwrap();

        // Deleting an unread message leaves the counter one too high.
        db.soft_delete_message(&first.id, "alice").unwrap();
        assert_eq!(db.unread_count(&chat.id, "bob").unwrap(), 2);

        let repaired = db.recompute_unread(&chat.id).unwrap();
        assert_eq!(repaired.unread_for("bob"), Some(1));
        assert_eq!(repaired.unread_for("alice"), Some(0));
    }

    #[test]
    fn repair_all_reports_changed_chats() {
        let db = ChatDatabase::in_memory().unwrap();
        let chat = db.get_or_create_chat("alice", "bob").unwrap();
        db.get_or_create_chat("alice", "carol").unwrap();
        db.send_message(&chat.id, "bob", "hi", None).unwrap();

        {
            let conn = db.connection();
            conn.execute(
                "UPDATE chats SET unread_count_a = 7 WHERE id = ?1",
                params![chat.id],
            )
            .unwrap();
        }

        assert_eq!(db.repair_all_unread().unwrap(), 1);
        assert_eq!(db.unread_count(&chat.id, "alice").unwrap(), 1);
        assert_eq!(db.repair_all_unread().unwrap(), 0);
    }
}
