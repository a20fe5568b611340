use super::types::{Chat, Message};

/// Notifications a session actor pushes to the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ChatSelected(Chat),
    /// A message was added to the local view (own send, history or live event).
    MessageMerged(Message),
    /// Users other than self currently typing in the open chat.
    TypingChanged(Vec<String>),
    /// Live updates for the open chat stopped; history is still fetchable.
    LiveUpdatesUnavailable(String),
}
