use std::cmp::Ordering;

use crate::common::{Chat, Message, PresenceEntry};

/// Local view owned by one session actor.
pub struct SessionState {
    user_id: String,
    active_chat: Option<Chat>,
    /// Sorted by `(created_at, id)`, unique by id.
    messages: Vec<Message>,
    typing_users: Vec<String>,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            active_chat: None,
            messages: Vec::new(),
            typing_users: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn active_chat(&self) -> Option<&Chat> {
        self.active_chat.as_ref()
    }

    pub fn active_chat_id(&self) -> Option<&str> {
        self.active_chat.as_ref().map(|chat| chat.id.as_str())
    }

    pub fn open_chat(&mut self, chat: Chat) {
        self.active_chat = Some(chat);
        self.messages.clear();
        self.typing_users.clear();
    }

    pub fn close_chat(&mut self) {
        self.active_chat = None;
        self.messages.clear();
        self.typing_users.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|message| message.id == message_id)
    }

    /// Idempotent merge keyed by message id.
    ///
    /// Returns false when the message was already present or belongs to
    /// another chat; the view is left untouched in both cases.
    pub fn merge(&mut self, message: Message) -> bool {
        if self.active_chat_id() != Some(message.chat_id.as_str()) {
            return false;
        }
        if self.contains(&message.id) {
            return false;
        }

        let position = self
            .messages
            .partition_point(|existing| existing.order_cmp(&message) == Ordering::Less);
        self.messages.insert(position, message);
        true
    }

    /// Merge a fetched history. Returns the messages that were new.
    pub fn merge_history(&mut self, history: Vec<Message>) -> Vec<Message> {
        history
            .into_iter()
            .filter(|message| self.merge(message.clone()))
            .collect()
    }

    pub fn typing_users(&self) -> &[String] {
        &self.typing_users
    }

    /// Recompute the typing set from a presence sync: everyone typing except self.
    /// Returns true when the set changed.
    pub fn apply_presence(&mut self, entries: &[PresenceEntry]) -> bool {
        let mut typing: Vec<String> = entries
            .iter()
            .filter(|entry| entry.typing && entry.user_id != self.user_id)
            .map(|entry| entry.user_id.clone())
            .collect();
        typing.sort();
        typing.dedup();

        if typing == self.typing_users {
            return false;
        }
        self.typing_users = typing;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn chat() -> Chat {
        let now = Utc::now();
        Chat {
            id: "chat".into(),
            participant_a: "alice".into(),
            participant_b: "bob".into(),
            last_message_text: None,
            last_message_sender: None,
            last_message_at: None,
            unread_count_a: 0,
            unread_count_b: 0,
            last_activity_at: now,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn message(id: &str, millis: i64) -> Message {
        Message {
            id: id.into(),
            chat_id: "chat".into(),
            sender_id: "bob".into(),
            content: format!("content {id}"),
            attachment_url: None,
            attachment_type: None,
            is_read: false,
            read_at: None,
            is_deleted: false,
            created_at: DateTime::from_timestamp_millis(millis).unwrap(),
        }
    }

    fn presence(user_id: &str, typing: bool) -> PresenceEntry {
        PresenceEntry {
            chat_id: "chat".into(),
            user_id: user_id.into(),
            typing,
            announced_at: Utc::now(),
        }
    }

    fn ids(state: &SessionState) -> Vec<&str> {
        state.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn duplicate_event_is_discarded() {
        let mut state = SessionState::new("alice");
        state.open_chat(chat());

        assert!(state.merge(message("m1", 100)));
        let once: Vec<Message> = state.messages().to_vec();
        assert!(!state.merge(message("m1", 100)));
        assert_eq!(state.messages(), once.as_slice());
    }

    #[test]
    fn out_of_order_arrivals_end_up_sorted() {
        let mut state = SessionState::new("alice");
        state.open_chat(chat());

        for (id, millis) in [("c", 300), ("a", 100), ("e", 300), ("b", 200), ("d", 300), ("a", 100)] {
            state.merge(message(id, millis));
        }

        assert_eq!(ids(&state), ["a", "b", "c", "d", "e"]);
        assert!(state
            .messages()
            .windows(2)
            .all(|pair| pair[0].order_cmp(&pair[1]) == Ordering::Less));
    }

    #[test]
    fn same_id_wins_over_differing_payload() {
        let mut state = SessionState::new("alice");
        state.open_chat(chat());
        state.merge(message("m1", 100));

        let mut echoed = message("m1", 500);
        echoed.content = "tampered".into();
        assert!(!state.merge(echoed));
        assert_eq!(state.messages()[0].content, "content m1");
    }

    #[test]
    fn stray_chat_events_are_ignored() {
        let mut state = SessionState::new("alice");
        assert!(!state.merge(message("m1", 100)));

        state.open_chat(chat());
        let mut other = message("m2", 100);
        other.chat_id = "elsewhere".into();
        assert!(!state.merge(other));
        assert!(state.messages().is_empty());
    }

    #[test]
    fn history_merge_reports_only_new_messages() {
        let mut state = SessionState::new("alice");
        state.open_chat(chat());
        state.merge(message("m2", 200));

        let fresh = state.merge_history(vec![message("m1", 100), message("m2", 200), message("m3", 300)]);
        let fresh_ids: Vec<_> = fresh.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(fresh_ids, ["m1", "m3"]);
        assert_eq!(ids(&state), ["m1", "m2", "m3"]);
    }

    #[test]
    fn typing_set_excludes_self_and_idle_members() {
        let mut state = SessionState::new("alice");
        state.open_chat(chat());

        assert!(state.apply_presence(&[presence("alice", true), presence("bob", true)]));
        assert_eq!(state.typing_users(), ["bob"]);

        assert!(!state.apply_presence(&[presence("bob", true)]));

        assert!(state.apply_presence(&[presence("bob", false)]));
        assert!(state.typing_users().is_empty());
    }
}
