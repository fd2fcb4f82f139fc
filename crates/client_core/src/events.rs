//! Observable session transitions for the host application.

use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{ChatSummary, MessagePayload},
};

/// What a send is waiting on: an existing chat, or one not yet created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingTarget {
    PendingNew,
    Chat(ChatId),
}

impl ThinkingTarget {
    pub fn chat_id(self) -> Option<ChatId> {
        match self {
            Self::PendingNew => None,
            Self::Chat(chat_id) => Some(chat_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    Upload,
    CreateChat,
    Query,
}

impl SendStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::CreateChat => "create_chat",
            Self::Query => "query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub stage: SendStage,
    pub target: ThinkingTarget,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ThinkingChanged {
        target: Option<ThinkingTarget>,
    },
    ChatSelected {
        chat_id: Option<ChatId>,
    },
    ChatsReplaced {
        user_id: UserId,
        count: usize,
    },
    ChatCreated {
        chat: ChatSummary,
    },
    ChatDeleted {
        chat_id: ChatId,
    },
    ChatSummaryUpdated {
        chat_id: ChatId,
        summary: String,
    },
    HistoryLoaded {
        chat_id: ChatId,
        count: usize,
    },
    MessageAppended {
        message: MessagePayload,
    },
    /// The optimistic user turn received its committed attachment records.
    MessageUpdated {
        message: MessagePayload,
    },
    MessageRemoved {
        message_id: MessageId,
    },
    AttachmentsChanged {
        count: usize,
    },
    SendFailed(SendFailure),
    /// A superseded operation finished and its result was discarded.
    StaleResultDropped {
        generation: u64,
    },
}
