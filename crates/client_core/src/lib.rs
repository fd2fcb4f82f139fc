use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use shared::{
    domain::{ChatId, UserId},
    error::ApiException,
    protocol::{
        AttachmentPayload, ChatSummary, CreateChatRequest, MessagePayload, QueryRequest,
        QueryResponse, UserSummary,
    },
};
use tracing::debug;

pub mod cancellation;
pub mod config;
pub mod error;
pub mod events;
pub mod messages;
pub mod registry;
mod session;
pub mod staging;

pub use cancellation::{CancelToken, RequestCanceller};
pub use config::{load_settings, load_settings_from, normalize_base_url, ClientSettings};
pub use error::{Cancelled, SessionError, StagingError};
pub use events::{SendFailure, SendStage, SessionEvent, ThinkingTarget};
pub use registry::{ChatAge, ChatRegistry};
pub use session::{ChatSession, SessionSnapshot, SubmitOutcome, SubmitRejection};
pub use staging::{
    AttachmentStager, InMemoryPreviewStore, LocalFile, PreviewHandle, PreviewStore,
    StagedAttachment, StagedAttachmentId,
};

/// Remote chat backend consumed by the session orchestrator.
///
/// Implementations perform one HTTP-style call each and never retry. The
/// orchestrator runs every call under a [`CancelToken`] and drops results that
/// arrive after the token was superseded.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_users(&self) -> Result<Vec<UserSummary>>;
    async fn list_chats(&self, user_id: UserId) -> Result<Vec<ChatSummary>>;
    async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<MessagePayload>>;
    async fn create_chat(&self, user_id: UserId, summary_seed: &str) -> Result<ChatSummary>;
    async fn upload_attachments(&self, files: Vec<LocalFile>) -> Result<Vec<AttachmentPayload>>;
    async fn send_query(&self, request: QueryRequest) -> Result<QueryResponse>;
    async fn delete_chat(&self, chat_id: ChatId) -> Result<()>;
}

pub struct HttpChatBackend {
    http: Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn checked(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(ApiException::from_body(status.as_u16(), &body).into())
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let res = self.http.get(self.url("/users")).send().await?;
        let users = checked(res).await?.json().await?;
        Ok(users)
    }

    async fn list_chats(&self, user_id: UserId) -> Result<Vec<ChatSummary>> {
        let res = self
            .http
            .get(self.url(&format!("/user_chats/{user_id}")))
            .send()
            .await?;
        let chats = checked(res)
            .await?
            .json()
            .await
            .with_context(|| format!("malformed chat list for user {user_id}"))?;
        Ok(chats)
    }

    async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<MessagePayload>> {
        let res = self
            .http
            .get(self.url(&format!("/chat_messages/{chat_id}")))
            .send()
            .await?;
        let messages = checked(res)
            .await?
            .json()
            .await
            .with_context(|| format!("malformed message list for chat {chat_id}"))?;
        Ok(messages)
    }

    async fn create_chat(&self, user_id: UserId, summary_seed: &str) -> Result<ChatSummary> {
        let res = self
            .http
            .post(self.url("/user_chat"))
            .json(&CreateChatRequest {
                user_id,
                summary: summary_seed.to_string(),
            })
            .send()
            .await?;
        let chat: ChatSummary = checked(res).await?.json().await?;
        debug!(chat_id = chat.id.0, user_id = user_id.0, "backend created chat");
        Ok(chat)
    }

    async fn upload_attachments(&self, files: Vec<LocalFile>) -> Result<Vec<AttachmentPayload>> {
        let count = files.len();
        let mut form = Form::new();
        for file in files {
            let LocalFile {
                file_name,
                mime_type,
                bytes,
            } = file;
            let mut part = Part::bytes(bytes).file_name(file_name);
            if let Some(mime_type) = mime_type {
                part = part
                    .mime_str(&mime_type)
                    .with_context(|| format!("invalid mime type '{mime_type}'"))?;
            }
            form = form.part("files", part);
        }

        let res = self
            .http
            .post(self.url("/attachments/upload"))
            .multipart(form)
            .send()
            .await?;
        let uploaded: Vec<AttachmentPayload> = checked(res).await?.json().await?;
        debug!(files = count, records = uploaded.len(), "uploaded attachments");
        Ok(uploaded)
    }

    async fn send_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let chat_id = request.chat_id;
        let res = self
            .http
            .post(self.url("/query"))
            .json(&request)
            .send()
            .await?;
        let response = checked(res)
            .await?
            .json()
            .await
            .with_context(|| format!("malformed query response for chat {chat_id}"))?;
        Ok(response)
    }

    async fn delete_chat(&self, chat_id: ChatId) -> Result<()> {
        let res = self
            .http
            .delete(self.url(&format!("/chat/{chat_id}")))
            .send()
            .await?;
        checked(res).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
