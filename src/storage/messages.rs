use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};
use uuid::Uuid;

use super::chat_db::{
    ChatDatabase, MESSAGE_COLUMNS, message_from_row, now_millis, participant_chat, to_datetime,
};
use crate::common::{Attachment, AttachmentKind, Chat, Message};
use crate::error::{ChatError, Result};

impl ChatDatabase {
    // ========== Messages ==========

    /// Persist a message and apply its chat side effects in one transaction:
    /// the chat's `last_message_*` / `last_activity_at` columns and the
    /// recipient's unread counter.
    pub fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        attachment: Option<&Attachment>,
    ) -> Result<Message> {
        self.check_content(content, attachment.is_some())?;
        if attachment.is_some_and(|a| a.url.trim().is_empty()) {
            return Err(ChatError::Validation("attachment url is empty".into()));
        }

        let mut conn = self.connection();
        let tx = conn.transaction()?;
        let chat = sendable_chat(&tx, chat_id, sender_id)?;

        // Keep per-chat store order equal to insertion order even when the clock stalls.
        let now = now_millis();
        let created_at = match chat.last_message_at {
            Some(last) => now.max(last.timestamp_millis() + 1),
            None => now,
        };

        let id = Uuid::new_v4().to_string();
        let attachment_url = attachment.map(|a| a.url.as_str());
        let attachment_type = attachment.map(|a| a.kind.as_str());

        tx.execute(
            "INSERT INTO messages (id, chat_id, sender_id, content, attachment_url, attachment_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, chat_id, sender_id, content, attachment_url, attachment_type, created_at],
        )?;

        let preview = match attachment {
            Some(a) if content.trim().is_empty() => attachment_preview(a.kind).to_string(),
            _ => content.to_string(),
        };

        tx.execute(
            "UPDATE chats SET
                last_message_text = ?2,
                last_message_sender = ?3,
                last_message_at = ?4,
                last_activity_at = ?4,
                updated_at = ?5,
                unread_count_a = unread_count_a + CASE WHEN participant_a = ?3 THEN 0 ELSE 1 END,
                unread_count_b = unread_count_b + CASE WHEN participant_b = ?3 THEN 0 ELSE 1 END
             WHERE id = ?1",
            params![chat_id, preview, sender_id, created_at, now],
        )?;

        tx.commit()?;

        log::debug!("Stored message {id} in chat {chat_id} from {sender_id}");

        Ok(Message {
            id,
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            attachment_url: attachment.map(|a| a.url.clone()),
            attachment_type: attachment.map(|a| a.kind),
            is_read: false,
            read_at: None,
            is_deleted: false,
            created_at: to_datetime(created_at),
        })
    }

    /// Run every check `send_message` would, without writing anything.
    ///
    /// Lets a client refuse a send before it uploads an attachment the store
    /// would never reference.
    pub fn check_can_send(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        has_attachment: bool,
    ) -> Result<()> {
        self.check_content(content, has_attachment)?;
        let conn = self.connection();
        sendable_chat(&conn, chat_id, sender_id)?;
        Ok(())
    }

    /// Content rules. Blank text counts as empty; stored text keeps its whitespace.
    fn check_content(&self, content: &str, has_attachment: bool) -> Result<()> {
        if content.trim().is_empty() && !has_attachment {
            return Err(ChatError::Validation(
                "message needs text or an attachment".into(),
            ));
        }
        let max_chars = self.limits().max_message_chars;
        if content.chars().count() > max_chars {
            return Err(ChatError::Validation(format!(
                "message is longer than {max_chars} characters"
            )));
        }
        Ok(())
    }

    /// Visible messages of a chat ordered by `(created_at, id)`.
    pub fn get_messages(&self, chat_id: &str, requester_id: &str) -> Result<Vec<Message>> {
        let conn = self.connection();
        participant_chat(&conn, chat_id, requester_id)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE chat_id = ?1 AND is_deleted = 0
             ORDER BY created_at ASC, id ASC"
        ))?;

        let messages = stmt
            .query_map(params![chat_id], message_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(messages)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.connection();
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![message_id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Mark everything the other side sent as read and zero the reader's counter.
    ///
    /// Returns how many messages flipped to read; calling it again is a no-op
    /// that returns 0.
    pub fn mark_as_read(&self, chat_id: &str, reader_id: &str) -> Result<usize> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        participant_chat(&tx, chat_id, reader_id)?;

        let now = now_millis();
        let flipped = tx.execute(
            "UPDATE messages SET is_read = 1, read_at = ?3
             WHERE chat_id = ?1 AND sender_id <> ?2 AND is_read = 0",
            params![chat_id, reader_id, now],
        )?;

        tx.execute(
            "UPDATE chats SET
                unread_count_a = CASE WHEN participant_a = ?2 THEN 0 ELSE unread_count_a END,
                unread_count_b = CASE WHEN participant_b = ?2 THEN 0 ELSE unread_count_b END
             WHERE id = ?1",
            params![chat_id, reader_id],
        )?;

        tx.commit()?;

        if flipped > 0 {
            log::debug!("{reader_id} read {flipped} messages in chat {chat_id}");
        }
        Ok(flipped)
    }

    /// Hide a message from history. Only its sender may do this.
    ///
    /// Unread counters are left alone; `recompute_unread` brings them back in line.
    pub fn soft_delete_message(&self, message_id: &str, sender_id: &str) -> Result<()> {
        let message = self
            .get_message(message_id)?
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        if message.sender_id != sender_id {
            return Err(ChatError::Permission(format!(
                "{sender_id} did not send message {message_id}"
            )));
        }

        let conn = self.connection();
        conn.execute(
            "UPDATE messages SET is_deleted = 1 WHERE id = ?1",
            params![message_id],
        )?;
        Ok(())
    }
}

/// The chat `sender_id` may write to: a participant, and still active.
fn sendable_chat(conn: &Connection, chat_id: &str, sender_id: &str) -> Result<Chat> {
    let chat = participant_chat(conn, chat_id, sender_id)?;
    if !chat.is_active {
        return Err(ChatError::Validation(format!("chat {chat_id} is inactive")));
    }
    Ok(chat)
}

fn attachment_preview(kind: AttachmentKind) -> &'static str {
    match kind {
        AttachmentKind::Image => "Sent an image",
        AttachmentKind::File => "Sent a file",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ChatDatabase, Chat) {
        let db = ChatDatabase::in_memory().unwrap();
        let chat = db.get_or_create_chat("alice", "bob").unwrap();
        (db, chat)
    }

    #[test]
    fn text_message_updates_chat_summary() {
        let (db, chat) = setup();
        let message = db.send_message(&chat.id, "alice", "hello", None).unwrap();

        assert_eq!(message.attachment_url, None);
        assert_eq!(message.attachment_type, None);
        assert_eq!(message.content, "hello");

        let chat = db.get_chat(&chat.id).unwrap().unwrap();
        assert_eq!(chat.last_message_text.as_deref(), Some("hello"));
        assert_eq!(chat.last_message_sender.as_deref(), Some("alice"));
        assert_eq!(chat.last_message_at, Some(message.created_at));
        assert_eq!(chat.unread_for("bob"), Some(1));
        assert_eq!(chat.unread_for("alice"), Some(0));
    }

    #[test]
    fn empty_message_without_attachment_is_rejected() {
        let (db, chat) = setup();
        let err = db.send_message(&chat.id, "alice", "   ", None).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(db.get_messages(&chat.id, "alice").unwrap().is_empty());

        let chat = db.get_chat(&chat.id).unwrap().unwrap();
        assert_eq!(chat.last_message_text, None);
        assert_eq!(chat.unread_count_b, 0);
    }

    #[test]
    fn attachment_only_message_gets_preview_text() {
        let (db, chat) = setup();
        let attachment = Attachment {
            url: "https://blobs.local/c/1-ab.jpg".into(),
            kind: AttachmentKind::Image,
        };
        let message = db
            .send_message(&chat.id, "alice", "", Some(&attachment))
            .unwrap();
        assert_eq!(message.content, "");
        assert_eq!(message.attachment_type, Some(AttachmentKind::Image));

        let stored = db.get_message(&message.id).unwrap().unwrap();
        assert_eq!(stored, message);

        let chat = db.get_chat(&chat.id).unwrap().unwrap();
        assert_eq!(chat.last_message_text.as_deref(), Some("Sent an image"));
    }

    #[test]
    fn outsiders_cannot_write_or_read() {
        let (db, chat) = setup();
        assert!(matches!(
            db.send_message(&chat.id, "mallory", "hi", None),
            Err(ChatError::Permission(_))
        ));
        assert!(matches!(
            db.get_messages(&chat.id, "mallory"),
            Err(ChatError::Permission(_))
        ));
        assert!(matches!(
            db.mark_as_read(&chat.id, "mallory"),
            Err(ChatError::Permission(_))
        ));
    }

    #[test]
    fn overlong_message_is_rejected_by_store() {
        let (db, chat) = setup();
        let text = "x".repeat(db.limits().max_message_chars + 1);
        assert!(matches!(
            db.send_message(&chat.id, "alice", &text, None),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn history_is_ordered_and_skips_deleted() {
        let (db, chat) = setup();
        let first = db.send_message(&chat.id, "alice", "one", None).unwrap();
        let second = db.send_message(&chat.id, "bob", "two", None).unwrap();
        let third = db.send_message(&chat.id, "alice", "three", None).unwrap();
        assert!(first.created_at < second.created_at);
        assert!(second.created_at < third.created_at);

        db.soft_delete_message(&second.id, "bob").unwrap();
        assert!(matches!(
            db.soft_delete_message(&third.id, "bob"),
            Err(ChatError::Permission(_))
        ));

        let history = db.get_messages(&chat.id, "bob").unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "three"]);
    }

    #[test]
    fn mark_as_read_resets_only_the_reader() {
        let (db, chat) = setup();
        for text in ["a", "b", "c"] {
            db.send_message(&chat.id, "alice", text, None).unwrap();
        }
        db.send_message(&chat.id, "bob", "reply", None).unwrap();

        let before = db.get_chat(&chat.id).unwrap().unwrap();
        assert_eq!(before.unread_for("bob"), Some(3));
        assert_eq!(before.unread_for("alice"), Some(1));

        assert_eq!(db.mark_as_read(&chat.id, "bob").unwrap(), 3);
        let after = db.get_chat(&chat.id).unwrap().unwrap();
        assert_eq!(after.unread_for("bob"), Some(0));
        assert_eq!(after.unread_for("alice"), Some(1));

        // Second call changes nothing.
        assert_eq!(db.mark_as_read(&chat.id, "bob").unwrap(), 0);

        let history = db.get_messages(&chat.id, "bob").unwrap();
        for message in history {
            if message.sender_id == "alice" {
                assert!(message.is_read);
                assert!(message.read_at.is_some());
            } else {
                assert!(!message.is_read);
            }
        }
    }

    #[test]
    fn inactive_chat_refuses_messages() {
        let (db, chat) = setup();
        db.deactivate_chat(&chat.id, "alice").unwrap();
        assert!(matches!(
            db.send_message(&chat.id, "bob", "anyone?", None),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn surrounding_whitespace_is_kept() {
        let (db, chat) = setup();
        let message = db
            .send_message(&chat.id, "alice", "  indented code\n", None)
            .unwrap();
        assert_eq!(message.content, "  indented code\n");

        let stored = db.get_message(&message.id).unwrap().unwrap();
        assert_eq!(stored.content, "  indented code\n");
    }

    #[test]
    fn send_precheck_matches_send_rules() {
        let (db, chat) = setup();
        let long = "x".repeat(db.limits().max_message_chars + 1);

        assert!(db.check_can_send(&chat.id, "alice", "hi", false).is_ok());
        assert!(db.check_can_send(&chat.id, "alice", "", true).is_ok());
        assert!(matches!(
            db.check_can_send(&chat.id, "alice", " ", false),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            db.check_can_send(&chat.id, "alice", &long, true),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            db.check_can_send(&chat.id, "mallory", "hi", false),
            Err(ChatError::Permission(_))
        ));

        db.deactivate_chat(&chat.id, "bob").unwrap();
        assert!(matches!(
            db.check_can_send(&chat.id, "alice", "hi", true),
            Err(ChatError::Validation(_))
        ));
        assert!(db.get_messages(&chat.id, "alice").unwrap().is_empty());
    }
}
