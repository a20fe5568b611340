use tokio::sync::oneshot;

use super::types::{Chat, Message, PendingFile};
use crate::error::Result;

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests a session handle sends to its actor.
#[derive(Debug)]
pub enum SessionCommand {
    ListChats {
        reply: Reply<Vec<Chat>>,
    },
    /// Look up or create the chat with another user, then open it.
    StartChat {
        other_user_id: String,
        reply: Reply<Chat>,
    },
    /// Tear down the current chat's subscriptions and open `chat`.
    SelectChat {
        chat: Chat,
        reply: Reply<Vec<Message>>,
    },
    SendMessage {
        content: String,
        file: Option<PendingFile>,
        reply: Reply<Message>,
    },
    MarkRead {
        chat_id: String,
        reply: Reply<usize>,
    },
    /// Snapshot of the local ordered view.
    Messages {
        reply: Reply<Vec<Message>>,
    },
    Keystroke,
    StopTyping,
    Close {
        reply: Reply<()>,
    },
}
