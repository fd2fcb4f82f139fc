use shared::domain::{ChatId, UserId};
use thiserror::Error;

/// The operation's token was superseded; its results must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    #[error("attachment url is empty")]
    EmptyUrl,
    #[error("invalid attachment url '{raw}': {reason}")]
    InvalidUrl { raw: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active user; select a user first")]
    NoActiveUser,
    #[error("failed to upload attachments: {0:#}")]
    Upload(anyhow::Error),
    #[error("failed to create chat: {0:#}")]
    CreateChat(anyhow::Error),
    #[error("query failed for chat {chat_id}: {source:#}")]
    Query {
        chat_id: ChatId,
        source: anyhow::Error,
    },
    #[error("failed to list users: {0:#}")]
    ListUsers(anyhow::Error),
    #[error("failed to list chats for user {user_id}: {source:#}")]
    ListChats {
        user_id: UserId,
        source: anyhow::Error,
    },
    #[error("failed to load messages for chat {chat_id}: {source:#}")]
    ListMessages {
        chat_id: ChatId,
        source: anyhow::Error,
    },
    #[error("failed to delete chat {chat_id}: {source:#}")]
    DeleteChat {
        chat_id: ChatId,
        source: anyhow::Error,
    },
}
