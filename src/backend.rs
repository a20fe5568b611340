//! Async facade over the chat store and the realtime bus.
//!
//! Store calls run on the blocking pool. A committed send is published to
//! the bus afterwards, the way a database change feed would announce it.

use std::sync::Arc;

use tokio::task;

use crate::common::{Attachment, Chat, Message};
use crate::error::Result;
use crate::network::RealtimeBus;
use crate::storage::ChatDatabase;

#[derive(Clone)]
pub struct ChatBackend {
    db: Arc<ChatDatabase>,
    bus: RealtimeBus,
}

impl ChatBackend {
    pub fn new(db: ChatDatabase, bus: RealtimeBus) -> Self {
        Self {
            db: Arc::new(db),
            bus,
        }
    }

    pub fn bus(&self) -> &RealtimeBus {
        &self.bus
    }

    pub fn database(&self) -> &ChatDatabase {
        &self.db
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ChatDatabase) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || op(db.as_ref())).await?
    }

    pub async fn get_or_create_chat(&self, user_a: &str, user_b: &str) -> Result<Chat> {
        let (user_a, user_b) = (user_a.to_string(), user_b.to_string());
        self.run(move |db| db.get_or_create_chat(&user_a, &user_b))
            .await
    }

    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>> {
        let user_id = user_id.to_string();
        self.run(move |db| db.list_chats(&user_id)).await
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let chat_id = chat_id.to_string();
        self.run(move |db| db.get_chat(&chat_id)).await
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<Message> {
        let (chat_id, sender_id, content) =
            (chat_id.to_string(), sender_id.to_string(), content.to_string());
        let message = self
            .run(move |db| db.send_message(&chat_id, &sender_id, &content, attachment.as_ref()))
            .await?;

        let reached = self.bus.publish_insert(&message);
        log::debug!(
            "Message {} in chat {} fanned out to {reached} subscribers",
            message.id,
            message.chat_id
        );
        Ok(message)
    }

    /// Whether a send would be accepted, without writing anything.
    pub async fn check_can_send(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        has_attachment: bool,
    ) -> Result<()> {
        let (chat_id, sender_id, content) =
            (chat_id.to_string(), sender_id.to_string(), content.to_string());
        self.run(move |db| db.check_can_send(&chat_id, &sender_id, &content, has_attachment))
            .await
    }

    pub async fn get_messages(&self, chat_id: &str, requester_id: &str) -> Result<Vec<Message>> {
        let (chat_id, requester_id) = (chat_id.to_string(), requester_id.to_string());
        self.run(move |db| db.get_messages(&chat_id, &requester_id))
            .await
    }

    pub async fn mark_as_read(&self, chat_id: &str, reader_id: &str) -> Result<usize> {
        let (chat_id, reader_id) = (chat_id.to_string(), reader_id.to_string());
        self.run(move |db| db.mark_as_read(&chat_id, &reader_id))
            .await
    }

    pub async fn unread_count(&self, chat_id: &str, user_id: &str) -> Result<i64> {
        let (chat_id, user_id) = (chat_id.to_string(), user_id.to_string());
        self.run(move |db| db.unread_count(&chat_id, &user_id))
            .await
    }

    pub async fn total_unread(&self, user_id: &str) -> Result<i64> {
        let user_id = user_id.to_string();
        self.run(move |db| db.total_unread(&user_id)).await
    }

    pub async fn repair_all_unread(&self) -> Result<usize> {
        self.run(|db| db.repair_all_unread()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LiveEvent;

    #[tokio::test]
    async fn committed_send_is_published() {
        let backend = ChatBackend::new(ChatDatabase::in_memory().unwrap(), RealtimeBus::default());
        let chat = backend.get_or_create_chat("alice", "bob").await.unwrap();
        let mut live = backend.bus().subscribe_messages(&chat.id).unwrap();

        let sent = backend
            .send_message(&chat.id, "alice", "hello", None)
            .await
            .unwrap();

        match live.recv().await {
            LiveEvent::Inserted(message) => assert_eq!(message.id, sent.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_send_publishes_nothing() {
        let backend = ChatBackend::new(ChatDatabase::in_memory().unwrap(), RealtimeBus::default());
        let chat = backend.get_or_create_chat("alice", "bob").await.unwrap();
        let mut live = backend.bus().subscribe_messages(&chat.id).unwrap();

        assert!(backend.send_message(&chat.id, "alice", "", None).await.is_err());
        let sent = backend
            .send_message(&chat.id, "alice", "second try", None)
            .await
            .unwrap();

        // The first thing on the channel is the accepted message.
        match live.recv().await {
            LiveEvent::Inserted(message) => assert_eq!(message.id, sent.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_start_from_both_sides_agrees() {
        let backend = ChatBackend::new(ChatDatabase::in_memory().unwrap(), RealtimeBus::default());
        let (left, right) = tokio::join!(
            backend.get_or_create_chat("alice", "bob"),
            backend.get_or_create_chat("bob", "alice"),
        );
        assert_eq!(left.unwrap().id, right.unwrap().id);
    }
}
