use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::presence::{PresenceGroup, PresenceMember};
use crate::common::Message;
use crate::error::{ChatError, Result};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// What a message subscription yields.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// A message with this id now exists in the chat.
    Inserted(Message),
    /// The subscriber fell behind and lost this many events.
    Missed(u64),
    /// The channel is gone (bus shut down).
    Closed,
}

/// In-process realtime fan-out: one message channel and one presence group per chat.
#[derive(Clone)]
pub struct RealtimeBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    capacity: usize,
    closed: AtomicBool,
    message_channels: Mutex<HashMap<String, broadcast::Sender<Message>>>,
    presence_groups: Mutex<HashMap<String, Arc<PresenceGroup>>>,
}

impl Default for RealtimeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl RealtimeBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                message_channels: Mutex::new(HashMap::new()),
                presence_groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to message-insert events of `chat_id`.
    pub fn subscribe_messages(&self, chat_id: &str) -> Result<MessageSubscription> {
        self.ensure_open()?;
        let mut channels = lock(&self.inner.message_channels);
        let sender = channels
            .entry(chat_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0);

        log::debug!("Subscribed to messages of chat {chat_id}");
        Ok(MessageSubscription {
            chat_id: chat_id.to_string(),
            receiver: sender.subscribe(),
        })
    }

    /// Fan an inserted message out to every subscriber of its chat.
    /// Returns how many subscribers were reached.
    pub fn publish_insert(&self, message: &Message) -> usize {
        if self.is_closed() {
            return 0;
        }
        let mut channels = lock(&self.inner.message_channels);
        let Some(sender) = channels.get(&message.chat_id) else {
            return 0;
        };

        match sender.send(message.clone()) {
            Ok(reached) => reached,
            Err(_) => {
                // Nobody listening anymore.
                channels.remove(&message.chat_id);
                0
            }
        }
    }

    /// Join the presence group of `chat_id` as `user_id`.
    pub fn join_presence(&self, chat_id: &str, user_id: &str) -> Result<PresenceMember> {
        self.ensure_open()?;
        let mut groups = lock(&self.inner.presence_groups);
        groups.retain(|_, group| Arc::strong_count(group) > 1);
        let group = groups
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(PresenceGroup::new(chat_id, self.inner.capacity)))
            .clone();

        log::debug!("{user_id} joined presence of chat {chat_id}");
        Ok(PresenceMember::join(group, user_id))
    }

    pub fn subscriber_count(&self, chat_id: &str) -> usize {
        lock(&self.inner.message_channels)
            .get(chat_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Close every message channel; later subscribe/join calls fail.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        lock(&self.inner.message_channels).clear();
        lock(&self.inner.presence_groups).clear();
        log::info!("Realtime bus shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ChatError::Network("realtime bus is shut down".into()))
        } else {
            Ok(())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receiving end of one chat's message channel.
pub struct MessageSubscription {
    chat_id: String,
    receiver: broadcast::Receiver<Message>,
}

impl MessageSubscription {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub async fn recv(&mut self) -> LiveEvent {
        match self.receiver.recv().await {
            Ok(message) => LiveEvent::Inserted(message),
            Err(RecvError::Lagged(missed)) => LiveEvent::Missed(missed),
            Err(RecvError::Closed) => LiveEvent::Closed,
        }
    }
}
