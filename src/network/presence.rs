use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::common::PresenceEntry;

/// Ephemeral keyed membership set for one chat.
///
/// Every change broadcasts the full membership to all joined members.
pub struct PresenceGroup {
    chat_id: String,
    members: Mutex<HashMap<String, PresenceEntry>>,
    sync_sender: broadcast::Sender<Vec<PresenceEntry>>,
}

impl PresenceGroup {
    pub(crate) fn new(chat_id: &str, capacity: usize) -> Self {
        let (sync_sender, _) = broadcast::channel(capacity.max(1));
        Self {
            chat_id: chat_id.to_string(),
            members: Mutex::new(HashMap::new()),
            sync_sender,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Current membership sorted by user id.
    pub fn state(&self) -> Vec<PresenceEntry> {
        snapshot(&self.lock_members())
    }

    fn track(&self, user_id: &str, typing: bool) {
        let mut members = self.lock_members();
        members.insert(
            user_id.to_string(),
            PresenceEntry {
                chat_id: self.chat_id.clone(),
                user_id: user_id.to_string(),
                typing,
                announced_at: Utc::now(),
            },
        );
        self.publish(&members);
    }

    fn untrack(&self, user_id: &str) -> bool {
        let mut members = self.lock_members();
        let removed = members.remove(user_id).is_some();
        if removed {
            self.publish(&members);
        }
        removed
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<PresenceEntry>> {
        self.sync_sender.subscribe()
    }

    // Sent while the member lock is held so syncs go out in change order.
    fn publish(&self, members: &HashMap<String, PresenceEntry>) {
        let _ = self.sync_sender.send(snapshot(members));
    }

    fn lock_members(&self) -> MutexGuard<'_, HashMap<String, PresenceEntry>> {
        self.members
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn snapshot(members: &HashMap<String, PresenceEntry>) -> Vec<PresenceEntry> {
    let mut entries: Vec<PresenceEntry> = members.values().cloned().collect();
    entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    entries
}

/// One connection's membership in a presence group.
///
/// Dropping it counts as a disconnect and removes the member's entry.
pub struct PresenceMember {
    group: Arc<PresenceGroup>,
    user_id: String,
    sync_receiver: broadcast::Receiver<Vec<PresenceEntry>>,
}

impl PresenceMember {
    pub(crate) fn join(group: Arc<PresenceGroup>, user_id: &str) -> Self {
        let sync_receiver = group.subscribe();
        Self {
            group,
            user_id: user_id.to_string(),
            sync_receiver,
        }
    }

    pub fn chat_id(&self) -> &str {
        self.group.chat_id()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Publish (or refresh) this member's entry.
    pub fn track(&self, typing: bool) {
        self.group.track(&self.user_id, typing);
    }

    /// Retract this member's entry. Returns false when nothing was tracked.
    pub fn untrack(&self) -> bool {
        self.group.untrack(&self.user_id)
    }

    pub fn presence_state(&self) -> Vec<PresenceEntry> {
        self.group.state()
    }

    /// Next full-membership sync. A lagged receiver gets the current state
    /// instead of the missed intermediate ones.
    pub async fn next_sync(&mut self) -> Option<Vec<PresenceEntry>> {
        match self.sync_receiver.recv().await {
            Ok(entries) => Some(entries),
            Err(RecvError::Lagged(skipped)) => {
                log::debug!(
                    "Presence sync for chat {} lagged by {skipped}; resyncing",
                    self.chat_id()
                );
                self.sync_receiver = self.sync_receiver.resubscribe();
                Some(self.group.state())
            }
            Err(RecvError::Closed) => None,
        }
    }
}

impl Drop for PresenceMember {
    fn drop(&mut self) {
        if self.group.untrack(&self.user_id) {
            log::debug!(
                "Presence entry of {} in chat {} dropped on disconnect",
                self.user_id,
                self.chat_id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_carries_full_membership() {
        let group = Arc::new(PresenceGroup::new("chat", 16));
        let alice = PresenceMember::join(group.clone(), "alice");
        let mut bob = PresenceMember::join(group.clone(), "bob");

        alice.track(true);
        let sync = bob.next_sync().await.unwrap();
        assert_eq!(sync.len(), 1);
        assert_eq!(sync[0].user_id, "alice");
        assert!(sync[0].typing);

        bob.track(true);
        let sync = bob.next_sync().await.unwrap();
        let users: Vec<_> = sync.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, ["alice", "bob"]);

        assert!(alice.untrack());
        assert!(!alice.untrack());
        let sync = bob.next_sync().await.unwrap();
        let users: Vec<_> = sync.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, ["bob"]);
    }

    #[tokio::test]
    async fn dropping_member_removes_entry() {
        let group = Arc::new(PresenceGroup::new("chat", 16));
        let alice = PresenceMember::join(group.clone(), "alice");
        let mut bob = PresenceMember::join(group.clone(), "bob");

        alice.track(true);
        bob.next_sync().await.unwrap();

        drop(alice);
        let sync = bob.next_sync().await.unwrap();
        assert!(sync.is_empty());
        assert!(group.state().is_empty());
    }
}
