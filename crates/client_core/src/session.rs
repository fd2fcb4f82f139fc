//! Chat session orchestrator.
//!
//! Drives the send workflow (upload, optional chat creation, query, merge)
//! and owns the thinking state. Every mutation made on behalf of an async
//! operation first checks that the operation still owns its [`CancelToken`];
//! a superseded operation becomes inert at its next suspension point.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{ChatSummary, MessagePayload, QueryRequest, UserSummary},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    cancellation::{CancelToken, RequestCanceller},
    config::ClientSettings,
    error::{Cancelled, SessionError, StagingError},
    events::{SendFailure, SendStage, SessionEvent, ThinkingTarget},
    messages::{self, MessageIdClock},
    registry::{ChatAge, ChatRegistry},
    staging::{
        AttachmentStager, InMemoryPreviewStore, LocalFile, OutgoingAttachments, PreviewStore,
        StagedAttachment, StagedAttachmentId,
    },
    ChatBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    /// No text and nothing staged.
    Empty,
    /// Another send is in flight.
    Busy,
    NoActiveUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Rejected(SubmitRejection),
    Completed { chat_id: ChatId },
    Failed(SendFailure),
    /// A newer operation took over; nothing from this send was applied.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub user_id: Option<UserId>,
    pub selected: Option<ChatId>,
    pub chats: Vec<ChatSummary>,
    pub messages: Vec<MessagePayload>,
    pub thinking: Option<ThinkingTarget>,
    pub staged: Vec<StagedAttachment>,
}

#[derive(Debug, Clone)]
enum SendPhase {
    Idle,
    Sending {
        target: ThinkingTarget,
        token: CancelToken,
    },
}

impl SendPhase {
    fn target(&self) -> Option<ThinkingTarget> {
        match self {
            Self::Idle => None,
            Self::Sending { target, .. } => Some(*target),
        }
    }
}

struct SessionState {
    registry: ChatRegistry,
    phase: SendPhase,
    send_canceller: RequestCanceller,
    history_canceller: RequestCanceller,
    chats_canceller: RequestCanceller,
    stager: AttachmentStager,
    ids: MessageIdClock,
}

/// Inputs captured when a send starts. Later steps read only these, never
/// the live selection.
struct SendRequest {
    token: CancelToken,
    optimistic_id: MessageId,
    user_id: UserId,
    chat_id: Option<ChatId>,
    text: String,
    attachments: OutgoingAttachments,
}

enum StepError {
    Cancelled,
    Failed {
        stage: SendStage,
        target: ThinkingTarget,
        error: SessionError,
    },
}

impl From<Cancelled> for StepError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    error_reply: String,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: &ClientSettings) -> Arc<Self> {
        Self::with_previews(backend, settings, Arc::new(InMemoryPreviewStore::new()))
    }

    pub fn with_previews(
        backend: Arc<dyn ChatBackend>,
        settings: &ClientSettings,
        previews: Arc<dyn PreviewStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Arc::new(Self {
            backend,
            error_reply: settings.error_reply.clone(),
            inner: Mutex::new(SessionState {
                registry: ChatRegistry::new(),
                phase: SendPhase::Idle,
                send_canceller: RequestCanceller::new(),
                history_canceller: RequestCanceller::new(),
                chats_canceller: RequestCanceller::new(),
                stager: AttachmentStager::new(previews),
                ids: MessageIdClock::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock().await;
        SessionSnapshot {
            user_id: state.registry.user_id(),
            selected: state.registry.selected(),
            chats: state.registry.chats().to_vec(),
            messages: state.registry.messages().to_vec(),
            thinking: state.phase.target(),
            staged: state.stager.attachments().to_vec(),
        }
    }

    pub async fn chats_by_age(&self, now: DateTime<Utc>) -> Vec<(ChatAge, Vec<ChatSummary>)> {
        let state = self.inner.lock().await;
        state
            .registry
            .grouped_by_age(now)
            .into_iter()
            .map(|(age, chats)| (age, chats.into_iter().cloned().collect()))
            .collect()
    }

    pub async fn thinking(&self) -> Option<ThinkingTarget> {
        self.inner.lock().await.phase.target()
    }

    /// The compose box stays locked while any send is in flight.
    pub async fn is_input_locked(&self) -> bool {
        self.thinking().await.is_some()
    }

    pub async fn is_thinking_on_displayed_chat(&self) -> bool {
        let state = self.inner.lock().await;
        match state.phase.target() {
            Some(ThinkingTarget::Chat(chat_id)) => state.registry.is_displaying(chat_id),
            Some(ThinkingTarget::PendingNew) => state.registry.selected().is_none(),
            None => false,
        }
    }

    pub async fn stage_files(&self, files: Vec<LocalFile>) -> Vec<StagedAttachmentId> {
        let mut state = self.inner.lock().await;
        let ids = state.stager.add_files(files);
        self.emit(SessionEvent::AttachmentsChanged {
            count: state.stager.len(),
        });
        ids
    }

    pub async fn stage_url(&self, raw: &str) -> Result<StagedAttachmentId, StagingError> {
        let mut state = self.inner.lock().await;
        let id = state.stager.add_url(raw)?;
        self.emit(SessionEvent::AttachmentsChanged {
            count: state.stager.len(),
        });
        Ok(id)
    }

    pub async fn unstage(&self, id: StagedAttachmentId) -> bool {
        let mut state = self.inner.lock().await;
        let removed = state.stager.remove(id);
        if removed {
            self.emit(SessionEvent::AttachmentsChanged {
                count: state.stager.len(),
            });
        }
        removed
    }

    pub async fn clear_staged(&self) {
        let mut state = self.inner.lock().await;
        self.clear_stager(&mut state);
    }

    fn clear_stager(&self, state: &mut SessionState) {
        if !state.stager.is_empty() {
            state.stager.clear();
            self.emit(SessionEvent::AttachmentsChanged { count: 0 });
        }
    }

    fn set_idle(&self, state: &mut SessionState) {
        if !matches!(state.phase, SendPhase::Idle) {
            state.phase = SendPhase::Idle;
            self.emit(SessionEvent::ThinkingChanged { target: None });
        }
    }

    /// Sends unless another send is in flight.
    pub async fn submit(self: &Arc<Self>, text: &str) -> SubmitOutcome {
        self.submit_with(text, false).await
    }

    /// Cancels any in-flight send, then sends.
    pub async fn submit_superseding(self: &Arc<Self>, text: &str) -> SubmitOutcome {
        self.submit_with(text, true).await
    }

    async fn submit_with(self: &Arc<Self>, text: &str, supersede: bool) -> SubmitOutcome {
        let request = match self.begin_send(text, supersede).await {
            Ok(request) => request,
            Err(rejection) => {
                debug!(?rejection, "submit rejected");
                return SubmitOutcome::Rejected(rejection);
            }
        };
        let token = request.token.clone();
        let optimistic_id = request.optimistic_id;

        // The send owns its own task: dropping this future must not strand
        // the phase in `Sending`.
        let session = Arc::clone(self);
        let task_token = token.clone();
        let send = tokio::spawn(async move {
            let result = session.run_send(request).await;
            session.finish_send(&task_token, optimistic_id, result).await
        });
        match send.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(generation = token.generation(), error = %err, "send task aborted");
                self.abandon_send(&token).await;
                SubmitOutcome::Superseded
            }
        }
    }

    async fn abandon_send(&self, token: &CancelToken) {
        let mut state = self.inner.lock().await;
        if state.send_canceller.release(token) {
            self.set_idle(&mut state);
        }
    }

    async fn begin_send(
        &self,
        text: &str,
        supersede: bool,
    ) -> Result<SendRequest, SubmitRejection> {
        let text = text.trim();
        let mut state = self.inner.lock().await;
        if text.is_empty() && state.stager.is_empty() {
            return Err(SubmitRejection::Empty);
        }
        if !supersede && !matches!(state.phase, SendPhase::Idle) {
            return Err(SubmitRejection::Busy);
        }
        let user_id = state
            .registry
            .user_id()
            .ok_or(SubmitRejection::NoActiveUser)?;

        let token = state.send_canceller.begin();
        let staged = state.stager.take();
        if !staged.is_empty() {
            self.emit(SessionEvent::AttachmentsChanged { count: 0 });
        }
        let chat_id = state.registry.selected();
        let target = chat_id.map_or(ThinkingTarget::PendingNew, ThinkingTarget::Chat);
        state.phase = SendPhase::Sending {
            target,
            token: token.clone(),
        };
        self.emit(SessionEvent::ThinkingChanged {
            target: Some(target),
        });
        info!(
            generation = token.generation(),
            chat_id = chat_id.map(|id| id.0),
            attachments = staged.len(),
            "send started"
        );

        let attachments = OutgoingAttachments::from_staged(staged);
        let optimistic_id = state.ids.next_id();
        let message = messages::user_message(
            optimistic_id,
            chat_id.unwrap_or(messages::PENDING_CHAT_ID),
            text,
            attachments.placeholders(),
        );
        let shown = match chat_id {
            Some(_) => state.registry.append_message(message.clone()),
            None => state.registry.append_pending(message.clone()),
        };
        if shown {
            self.emit(SessionEvent::MessageAppended { message });
        }

        Ok(SendRequest {
            token,
            optimistic_id,
            user_id,
            chat_id,
            text: text.to_string(),
            attachments,
        })
    }

    async fn run_send(&self, request: SendRequest) -> Result<ChatId, StepError> {
        let SendRequest {
            token,
            optimistic_id,
            user_id,
            chat_id,
            text,
            mut attachments,
        } = request;
        let initial_target = chat_id.map_or(ThinkingTarget::PendingNew, ThinkingTarget::Chat);
        let upload_failed = |error: anyhow::Error| StepError::Failed {
            stage: SendStage::Upload,
            target: initial_target,
            error: SessionError::Upload(error),
        };

        let uploading = attachments.needs_upload();
        let uploaded = if uploading {
            let files = attachments.take_files();
            token
                .guard(self.backend.upload_attachments(files))
                .await?
                .map_err(upload_failed)?
        } else {
            Vec::new()
        };
        let records = attachments.commit(uploaded).map_err(upload_failed)?;

        if uploading {
            self.mutate_owned(&token, |state| {
                let mut updated = None;
                state.registry.update_message(optimistic_id, |message| {
                    message.attachments = records.clone();
                    updated = Some(message.clone());
                });
                if let Some(message) = updated {
                    self.emit(SessionEvent::MessageUpdated { message });
                }
            })
            .await?;
        }

        let chat_id = match chat_id {
            Some(chat_id) => chat_id,
            None => {
                let seed = messages::summary_seed(&text);
                let created = token
                    .guard(self.backend.create_chat(user_id, &seed))
                    .await?
                    .map_err(|error| StepError::Failed {
                        stage: SendStage::CreateChat,
                        target: ThinkingTarget::PendingNew,
                        error: SessionError::CreateChat(error),
                    })?;
                self.adopt_created_chat(&token, created, seed).await?
            }
        };

        let query = QueryRequest {
            question: text.clone(),
            language: None,
            user_id,
            chat_id,
            attachments: (!records.is_empty()).then_some(records),
        };
        let response = token
            .guard(self.backend.send_query(query))
            .await?
            .map_err(|source| StepError::Failed {
                stage: SendStage::Query,
                target: ThinkingTarget::Chat(chat_id),
                error: SessionError::Query { chat_id, source },
            })?;

        self.mutate_owned(&token, |state| {
            let summary = messages::summary_after_reply(&response, &text);
            if state.registry.set_summary(chat_id, summary.clone()) {
                state.registry.promote(chat_id);
                self.emit(SessionEvent::ChatSummaryUpdated { chat_id, summary });
            }
            let reply = messages::assistant_reply(state.ids.next_id(), chat_id, &response);
            if state.registry.append_message(reply.clone()) {
                self.emit(SessionEvent::MessageAppended { message: reply });
            }
        })
        .await?;

        Ok(chat_id)
    }

    /// Registers a chat created by the current send. It takes the selection,
    /// and the pending user turn, only if the user is still in welcome mode.
    async fn adopt_created_chat(
        &self,
        token: &CancelToken,
        mut chat: ChatSummary,
        seed: String,
    ) -> Result<ChatId, StepError> {
        self.mutate_owned(token, |state| {
            if chat.summary.as_deref().map_or(true, str::is_empty) {
                chat.summary = Some(seed);
            }
            let chat_id = chat.id;
            state.registry.prepend(chat.clone());
            self.emit(SessionEvent::ChatCreated { chat });

            if state.registry.adopt_pending(chat_id) {
                self.emit(SessionEvent::ChatSelected {
                    chat_id: Some(chat_id),
                });
            } else {
                debug!(
                    chat_id = chat_id.0,
                    "selection changed during chat creation; continuing in background"
                );
            }

            let target = ThinkingTarget::Chat(chat_id);
            state.phase = SendPhase::Sending {
                target,
                token: token.clone(),
            };
            self.emit(SessionEvent::ThinkingChanged {
                target: Some(target),
            });
            chat_id
        })
        .await
    }

    async fn mutate_owned<R>(
        &self,
        token: &CancelToken,
        f: impl FnOnce(&mut SessionState) -> R,
    ) -> Result<R, StepError> {
        let mut state = self.inner.lock().await;
        if !state.send_canceller.owns(token) {
            self.emit(SessionEvent::StaleResultDropped {
                generation: token.generation(),
            });
            return Err(StepError::Cancelled);
        }
        Ok(f(&mut *state))
    }

    async fn finish_send(
        &self,
        token: &CancelToken,
        optimistic_id: MessageId,
        result: Result<ChatId, StepError>,
    ) -> SubmitOutcome {
        let mut state = self.inner.lock().await;
        if !state.send_canceller.owns(token) {
            debug!(generation = token.generation(), "send superseded");
            return SubmitOutcome::Superseded;
        }
        state.send_canceller.release(token);

        let outcome = match result {
            Ok(chat_id) => {
                info!(generation = token.generation(), chat_id = chat_id.0, "send completed");
                SubmitOutcome::Completed { chat_id }
            }
            // Unreachable while the token is still owned.
            Err(StepError::Cancelled) => SubmitOutcome::Superseded,
            Err(StepError::Failed {
                stage,
                target,
                error,
            }) => {
                warn!(
                    generation = token.generation(),
                    stage = stage.as_str(),
                    error = %error,
                    "send failed"
                );
                match target {
                    ThinkingTarget::PendingNew => {
                        // No durable chat exists; drop back to welcome mode.
                        if state.registry.selected().is_none() {
                            state.registry.clear_messages();
                        }
                    }
                    ThinkingTarget::Chat(chat_id) => {
                        // Nothing was sent, so only the error turn stays.
                        if stage == SendStage::Upload
                            && state.registry.remove_message(optimistic_id)
                        {
                            self.emit(SessionEvent::MessageRemoved {
                                message_id: optimistic_id,
                            });
                        }
                        let message = messages::assistant_error(
                            state.ids.next_id(),
                            chat_id,
                            &self.error_reply,
                        );
                        if state.registry.append_message(message.clone()) {
                            self.emit(SessionEvent::MessageAppended { message });
                        }
                    }
                }
                let failure = SendFailure {
                    stage,
                    target,
                    message: error.to_string(),
                };
                self.emit(SessionEvent::SendFailed(failure.clone()));
                SubmitOutcome::Failed(failure)
            }
        };

        self.set_idle(&mut state);
        outcome
    }

    /// "New chat": abandons the in-flight send and returns to welcome mode.
    pub async fn start_new_chat(&self) {
        let mut state = self.inner.lock().await;
        if state.send_canceller.cancel_current() {
            debug!("in-flight send cancelled by new chat");
        }
        self.set_idle(&mut state);
        state.history_canceller.cancel_current();
        if state.registry.select(None) {
            self.emit(SessionEvent::ChatSelected { chat_id: None });
        }
        state.registry.clear_messages();
        self.clear_stager(&mut state);
    }

    /// Selects a chat (or welcome mode) and loads its history. An in-flight
    /// send for another chat keeps running.
    pub async fn select_chat(&self, chat_id: Option<ChatId>) -> Result<(), SessionError> {
        let (chat_id, token) = {
            let mut state = self.inner.lock().await;
            if !state.registry.select(chat_id) {
                return Ok(());
            }
            self.clear_stager(&mut state);
            self.emit(SessionEvent::ChatSelected { chat_id });
            match chat_id {
                Some(chat_id) => (chat_id, state.history_canceller.begin()),
                None => {
                    state.history_canceller.cancel_current();
                    return Ok(());
                }
            }
        };

        let Ok(result) = token.guard(self.backend.list_messages(chat_id)).await else {
            return Ok(());
        };

        let mut state = self.inner.lock().await;
        if !state.history_canceller.owns(&token) || !state.registry.is_displaying(chat_id) {
            self.emit(SessionEvent::StaleResultDropped {
                generation: token.generation(),
            });
            return Ok(());
        }
        state.history_canceller.release(&token);

        match result {
            Ok(messages) => {
                let count = messages.len();
                state.registry.load_history(chat_id, messages);
                self.emit(SessionEvent::HistoryLoaded { chat_id, count });
                Ok(())
            }
            Err(source) => {
                warn!(chat_id = chat_id.0, error = %source, "failed to load chat history");
                state.registry.load_history(chat_id, Vec::new());
                Err(SessionError::ListMessages { chat_id, source })
            }
        }
    }

    /// Switches to another user and replaces the chat list wholesale.
    pub async fn switch_user(&self, user_id: UserId) -> Result<(), SessionError> {
        {
            let mut state = self.inner.lock().await;
            state.send_canceller.cancel_current();
            self.set_idle(&mut state);
            state.history_canceller.cancel_current();
            let had_selection = state.registry.selected().is_some();
            state.registry.switch_user(user_id);
            if had_selection {
                self.emit(SessionEvent::ChatSelected { chat_id: None });
            }
            self.clear_stager(&mut state);
        }
        info!(user_id = user_id.0, "switched user");
        self.refresh_chats().await
    }

    /// Re-fetches the current user's chats.
    pub async fn refresh_chats(&self) -> Result<(), SessionError> {
        let (user_id, token) = {
            let mut state = self.inner.lock().await;
            let user_id = state
                .registry
                .user_id()
                .ok_or(SessionError::NoActiveUser)?;
            (user_id, state.chats_canceller.begin())
        };

        let Ok(result) = token.guard(self.backend.list_chats(user_id)).await else {
            return Ok(());
        };

        let mut state = self.inner.lock().await;
        if !state.chats_canceller.owns(&token) {
            self.emit(SessionEvent::StaleResultDropped {
                generation: token.generation(),
            });
            return Ok(());
        }
        state.chats_canceller.release(&token);

        let (chats, outcome) = match result {
            Ok(chats) => (chats, Ok(())),
            Err(source) => {
                warn!(user_id = user_id.0, error = %source, "failed to fetch chats");
                (Vec::new(), Err(SessionError::ListChats { user_id, source }))
            }
        };
        let count = chats.len();
        if state.registry.replace_chats(user_id, chats) {
            self.emit(SessionEvent::ChatsReplaced { user_id, count });
        }
        outcome
    }

    pub async fn delete_chat(&self, chat_id: ChatId) -> Result<(), SessionError> {
        if let Err(source) = self.backend.delete_chat(chat_id).await {
            warn!(chat_id = chat_id.0, error = %source, "failed to delete chat");
            return Err(SessionError::DeleteChat { chat_id, source });
        }

        let mut state = self.inner.lock().await;
        let was_selected = state.registry.is_displaying(chat_id);
        state.registry.remove(chat_id);
        if was_selected {
            state.history_canceller.cancel_current();
            self.clear_stager(&mut state);
            self.emit(SessionEvent::ChatSelected { chat_id: None });
        }
        self.emit(SessionEvent::ChatDeleted { chat_id });
        info!(chat_id = chat_id.0, "chat deleted");
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<UserSummary>, SessionError> {
        self.backend.list_users().await.map_err(|err| {
            warn!(error = %err, "failed to fetch users");
            SessionError::ListUsers(err)
        })
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
