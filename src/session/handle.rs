use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::common::commands::Reply;
use crate::common::{Chat, Message, PendingFile, SessionCommand};
use crate::error::{ChatError, Result};

/// Cloneable front door to a running [`super::ChatSession`].
///
/// All calls are forwarded to the session actor; the handle holds no chat state.
#[derive(Clone)]
pub struct ChatSessionHandle {
    user_id: String,
    command_sender: mpsc::Sender<SessionCommand>,
    typing_receiver: watch::Receiver<Vec<String>>,
}

impl ChatSessionHandle {
    pub(crate) fn new(
        user_id: String,
        command_sender: mpsc::Sender<SessionCommand>,
        typing_receiver: watch::Receiver<Vec<String>>,
    ) -> Self {
        Self {
            user_id,
            command_sender,
            typing_receiver,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command_sender
            .send(build(reply))
            .await
            .map_err(|_| ChatError::SessionClosed)?;
        response.await.map_err(|_| ChatError::SessionClosed)?
    }

    async fn notify(&self, command: SessionCommand) -> Result<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| ChatError::SessionClosed)
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        self.request(|reply| SessionCommand::ListChats { reply })
            .await
    }

    /// Find or create the chat with `other_user_id` and open it.
    pub async fn start_chat(&self, other_user_id: &str) -> Result<Chat> {
        let other_user_id = other_user_id.to_string();
        self.request(|reply| SessionCommand::StartChat {
            other_user_id,
            reply,
        })
        .await
    }

    /// Open `chat`, replacing whatever chat was open. Returns its history.
    pub async fn select_chat(&self, chat: Chat) -> Result<Vec<Message>> {
        self.request(|reply| SessionCommand::SelectChat { chat, reply })
            .await
    }

    /// Send into the open chat. `file` is uploaded first; a failed upload
    /// aborts the send.
    pub async fn send_message(&self, content: &str, file: Option<PendingFile>) -> Result<Message> {
        let content = content.to_string();
        self.request(|reply| SessionCommand::SendMessage {
            content,
            file,
            reply,
        })
        .await
    }

    pub async fn mark_read(&self, chat_id: &str) -> Result<usize> {
        let chat_id = chat_id.to_string();
        self.request(|reply| SessionCommand::MarkRead { chat_id, reply })
            .await
    }

    /// Local ordered view of the open chat.
    pub async fn messages(&self) -> Result<Vec<Message>> {
        self.request(|reply| SessionCommand::Messages { reply })
            .await
    }

    pub async fn keystroke(&self) -> Result<()> {
        self.notify(SessionCommand::Keystroke).await
    }

    pub async fn stop_typing(&self) -> Result<()> {
        self.notify(SessionCommand::StopTyping).await
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.typing_receiver.borrow().clone()
    }

    pub fn typing_watch(&self) -> watch::Receiver<Vec<String>> {
        self.typing_receiver.clone()
    }

    /// Call `callback` with the typing set every time it changes.
    /// The task ends when the session stops.
    pub fn on_typing_change<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<String>) + Send + 'static,
    {
        let mut typing = self.typing_receiver.clone();
        tokio::spawn(async move {
            while typing.changed().await.is_ok() {
                let users = typing.borrow_and_update().clone();
                callback(users);
            }
        })
    }

    /// Stop the session, releasing its subscriptions and presence entry.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Close { reply }).await
    }
}
