use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use super::attachment::{self, MAX_CLIENT_FILE_BYTES};
use super::handle::ChatSessionHandle;
use super::state::SessionState;
use crate::auth::AuthProvider;
use crate::backend::ChatBackend;
use crate::common::{Chat, Message, PendingFile, PresenceEntry, SessionCommand, SessionEvent};
use crate::error::{ChatError, Result};
use crate::network::{BlobStore, LiveEvent, MessageSubscription, PresenceMember};

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after the last keystroke before the typing entry is retracted.
    pub typing_idle_timeout: Duration,
    pub max_upload_bytes: usize,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            typing_idle_timeout: DEFAULT_TYPING_IDLE,
            max_upload_bytes: MAX_CLIENT_FILE_BYTES,
            command_capacity: 64,
            event_capacity: 256,
        }
    }
}

/// Actor behind a [`ChatSessionHandle`].
///
/// Owns the local message view, at most one live message subscription and
/// one presence membership, and the typing timer. Nothing else touches them.
pub struct ChatSession {
    backend: ChatBackend,
    blobs: Arc<dyn BlobStore>,
    config: SessionConfig,
    state: SessionState,
    command_receiver: mpsc::Receiver<SessionCommand>,
    event_sender: mpsc::Sender<SessionEvent>,
    typing_sender: watch::Sender<Vec<String>>,
    live: Option<MessageSubscription>,
    presence: Option<PresenceMember>,
    typing_deadline: Option<Instant>,
}

impl ChatSession {
    /// Start a session actor for the signed-in user.
    ///
    /// Returns the handle used to drive it and the receiver of UI events.
    pub fn spawn(
        backend: ChatBackend,
        blobs: Arc<dyn BlobStore>,
        auth: &dyn AuthProvider,
        config: SessionConfig,
    ) -> Result<(ChatSessionHandle, mpsc::Receiver<SessionEvent>)> {
        let user = auth.current_user()?;

        let (command_sender, command_receiver) = mpsc::channel(config.command_capacity.max(1));
        let (event_sender, event_receiver) = mpsc::channel(config.event_capacity.max(1));
        let (typing_sender, typing_receiver) = watch::channel(Vec::new());

        let session = ChatSession {
            backend,
            blobs,
            config,
            state: SessionState::new(user.user_id.clone()),
            command_receiver,
            event_sender,
            typing_sender,
            live: None,
            presence: None,
            typing_deadline: None,
        };
        tokio::spawn(session.run());

        Ok((
            ChatSessionHandle::new(user.user_id, command_sender, typing_receiver),
            event_receiver,
        ))
    }

    async fn run(mut self) {
        log::info!("Chat session for {} started", self.state.user_id());

        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(SessionCommand::Close { reply }) => {
                            self.leave_chat();
                            let _ = reply.send(Ok(()));
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                event = next_live_event(&mut self.live) => {
                    self.handle_live_event(event).await;
                }
                sync = next_presence_sync(&mut self.presence) => {
                    self.handle_presence_sync(sync);
                }
                _ = typing_expired(self.typing_deadline) => {
                    log::debug!("Typing idle timeout for {}", self.state.user_id());
                    self.stop_typing();
                }
            }
        }

        self.leave_chat();
        log::info!("Chat session for {} stopped", self.state.user_id());
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ListChats { reply } => {
                let result = self.backend.list_chats(self.state.user_id()).await;
                let _ = reply.send(result);
            }
            SessionCommand::StartChat {
                other_user_id,
                reply,
            } => {
                let _ = reply.send(self.start_chat(&other_user_id).await);
            }
            SessionCommand::SelectChat { chat, reply } => {
                let _ = reply.send(self.select_chat(chat).await);
            }
            SessionCommand::SendMessage {
                content,
                file,
                reply,
            } => {
                let _ = reply.send(self.send_message(content, file).await);
            }
            SessionCommand::MarkRead { chat_id, reply } => {
                let result = self
                    .backend
                    .mark_as_read(&chat_id, self.state.user_id())
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::Messages { reply } => {
                let _ = reply.send(Ok(self.state.messages().to_vec()));
            }
            SessionCommand::Keystroke => self.keystroke(),
            SessionCommand::StopTyping => self.stop_typing(),
            SessionCommand::Close { reply } => {
                // Intercepted by the run loop.
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn start_chat(&mut self, other_user_id: &str) -> Result<Chat> {
        let chat = self
            .backend
            .get_or_create_chat(self.state.user_id(), other_user_id)
            .await?;
        self.select_chat(chat.clone()).await?;
        Ok(chat)
    }

    /// Switch to `chat`: the previous chat's channel and presence membership are
    /// released before anything for the new chat is created.
    ///
    /// Only the stored chat record is trusted for the participant check.
    async fn select_chat(&mut self, chat: Chat) -> Result<Vec<Message>> {
        let user_id = self.state.user_id().to_string();
        let chat = self
            .backend
            .get_chat(&chat.id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("chat {}", chat.id)))?;
        if !chat.has_participant(&user_id) {
            return Err(ChatError::Permission(format!(
                "{user_id} is not a participant of chat {}",
                chat.id
            )));
        }

        self.leave_chat();
        self.state.open_chat(chat.clone());

        match self.backend.bus().subscribe_messages(&chat.id) {
            Ok(subscription) => self.live = Some(subscription),
            Err(err) => {
                log::warn!("No live messages for chat {}: {err}", chat.id);
                self.emit(SessionEvent::LiveUpdatesUnavailable(err.to_string()));
            }
        }
        match self.backend.bus().join_presence(&chat.id, &user_id) {
            Ok(member) => {
                let current = member.presence_state();
                self.presence = Some(member);
                self.handle_presence_sync(Some(current));
            }
            Err(err) => {
                log::warn!("No typing indicators for chat {}: {err}", chat.id);
                self.emit(SessionEvent::LiveUpdatesUnavailable(format!(
                    "typing indicators unavailable: {err}"
                )));
            }
        }
        self.emit(SessionEvent::ChatSelected(chat.clone()));

        if let Err(err) = self.refresh_history().await {
            self.leave_chat();
            return Err(err);
        }

        if let Err(err) = self.backend.mark_as_read(&chat.id, &user_id).await {
            log::warn!("Failed to mark chat {} read: {err}", chat.id);
        }

        log::info!(
            "{user_id} opened chat {} ({} messages)",
            chat.id,
            self.state.messages().len()
        );
        Ok(self.state.messages().to_vec())
    }

    /// Re-fetch the open chat's history and merge it into the local view.
    async fn refresh_history(&mut self) -> Result<()> {
        let Some(chat_id) = self.state.active_chat_id().map(str::to_string) else {
            return Ok(());
        };
        let history = self
            .backend
            .get_messages(&chat_id, self.state.user_id())
            .await?;
        for message in self.state.merge_history(history) {
            self.emit(SessionEvent::MessageMerged(message));
        }
        Ok(())
    }

    async fn send_message(&mut self, content: String, file: Option<PendingFile>) -> Result<Message> {
        let chat_id = self
            .state
            .active_chat_id()
            .map(str::to_string)
            .ok_or_else(|| ChatError::Validation("no chat selected".into()))?;
        if content.trim().is_empty() && file.is_none() {
            return Err(ChatError::Validation(
                "message needs text or an attachment".into(),
            ));
        }

        let attachment = match file {
            Some(file) => {
                attachment::check_file_size(&file, self.config.max_upload_bytes)?;
                // Nothing is uploaded for a send the store would refuse.
                self.backend
                    .check_can_send(&chat_id, self.state.user_id(), &content, true)
                    .await?;
                let uploaded = attachment::upload_attachment(
                    self.blobs.as_ref(),
                    &chat_id,
                    file,
                    self.config.max_upload_bytes,
                )
                .await?;
                Some(uploaded)
            }
            None => None,
        };

        let message = self
            .backend
            .send_message(&chat_id, self.state.user_id(), &content, attachment)
            .await?;

        // Confirmed by the store, so it goes into the view right away; the
        // realtime echo of the same id is dropped by the merge.
        if self.state.merge(message.clone()) {
            self.emit(SessionEvent::MessageMerged(message.clone()));
        }
        self.stop_typing();
        Ok(message)
    }

    async fn handle_live_event(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Inserted(message) => {
                let id = message.id.clone();
                if self.state.merge(message.clone()) {
                    self.emit(SessionEvent::MessageMerged(message));
                } else {
                    log::debug!("Discarded duplicate delivery of message {id}");
                }
            }
            LiveEvent::Missed(count) => {
                log::warn!("Live channel dropped {count} events; re-fetching history");
                if let Err(err) = self.refresh_history().await {
                    log::warn!("History re-fetch failed: {err}");
                }
            }
            LiveEvent::Closed => {
                self.live = None;
                log::warn!("Live message channel closed; continuing without live updates");
                self.emit(SessionEvent::LiveUpdatesUnavailable(
                    "message channel closed".into(),
                ));
            }
        }
    }

    fn handle_presence_sync(&mut self, sync: Option<Vec<PresenceEntry>>) {
        let Some(entries) = sync else {
            log::warn!("Presence channel closed; typing indicators disabled");
            self.presence = None;
            return;
        };
        if self.state.apply_presence(&entries) {
            let typing = self.state.typing_users().to_vec();
            self.typing_sender.send_replace(typing.clone());
            self.emit(SessionEvent::TypingChanged(typing));
        }
    }

    fn keystroke(&mut self) {
        let Some(presence) = &self.presence else {
            return;
        };
        presence.track(true);
        self.typing_deadline = Some(Instant::now() + self.config.typing_idle_timeout);
    }

    fn stop_typing(&mut self) {
        self.typing_deadline = None;
        if let Some(presence) = &self.presence {
            if presence.untrack() {
                log::debug!("{} stopped typing", self.state.user_id());
            }
        }
    }

    /// Drop the open chat's subscriptions, synchronously.
    fn leave_chat(&mut self) {
        self.stop_typing();
        self.live = None;
        self.presence = None;
        if self.state.active_chat().is_some() {
            self.state.close_chat();
            if !self.typing_sender.borrow().is_empty() {
                self.typing_sender.send_replace(Vec::new());
                self.emit(SessionEvent::TypingChanged(Vec::new()));
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        match self.event_sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::warn!("Session event queue full; dropping {event:?}");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn next_live_event(live: &mut Option<MessageSubscription>) -> LiveEvent {
    match live {
        Some(subscription) => subscription.recv().await,
        None => future::pending().await,
    }
}

async fn next_presence_sync(presence: &mut Option<PresenceMember>) -> Option<Vec<PresenceEntry>> {
    match presence {
        Some(member) => member.next_sync().await,
        None => future::pending().await,
    }
}

async fn typing_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
