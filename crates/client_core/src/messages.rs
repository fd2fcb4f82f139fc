//! Optimistic message construction and chat summary rules.

use chrono::Utc;
use shared::{
    domain::{ChatId, MessageId, Role},
    protocol::{AttachmentPayload, ContextItem, MessagePayload, QueryResponse},
};

/// Characters of the first message used to seed a new chat's summary.
pub const SUMMARY_SEED_CHARS: usize = 30;
/// Characters kept when a summary falls back to the answer or question text.
pub const SUMMARY_FALLBACK_CHARS: usize = 40;

/// Chat id carried by the user turn of a send whose chat is still being
/// created. Replaced with the backend's id once the chat exists.
pub const PENDING_CHAT_ID: ChatId = ChatId(-1);

const UNKNOWN_SOURCE: &str = "unknown";

/// Client-side message ids: wall-clock milliseconds, strictly increasing.
#[derive(Debug, Default)]
pub struct MessageIdClock {
    last: i64,
}

impl MessageIdClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> MessageId {
        let now = Utc::now().timestamp_millis();
        self.last = now.max(self.last + 1);
        MessageId(self.last)
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

pub fn summary_seed(text: &str) -> String {
    truncate_chars(text, SUMMARY_SEED_CHARS).to_string()
}

/// Server summary, else the truncated answer, else the truncated question.
pub fn summary_after_reply(response: &QueryResponse, question: &str) -> String {
    if let Some(summary) = response.summary.as_deref().filter(|s| !s.is_empty()) {
        return summary.to_string();
    }
    let answer = truncate_chars(&response.answer, SUMMARY_FALLBACK_CHARS);
    if !answer.is_empty() {
        return answer.to_string();
    }
    truncate_chars(question, SUMMARY_FALLBACK_CHARS).to_string()
}

/// Distinct string source labels in first-seen order, skipping `unknown`.
pub fn context_labels(context: &[ContextItem]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for label in context.iter().filter_map(ContextItem::source_label) {
        if label != UNKNOWN_SOURCE && !labels.iter().any(|seen| seen == label) {
            labels.push(label.to_string());
        }
    }
    labels
}

pub fn user_message(
    id: MessageId,
    chat_id: ChatId,
    text: &str,
    attachments: Vec<AttachmentPayload>,
) -> MessagePayload {
    MessagePayload {
        id,
        chat_id,
        text: text.to_string(),
        role: Role::User,
        context: None,
        attachments,
    }
}

pub fn assistant_reply(id: MessageId, chat_id: ChatId, response: &QueryResponse) -> MessagePayload {
    let labels = context_labels(&response.context);
    MessagePayload {
        id,
        chat_id,
        text: response.answer.clone(),
        role: Role::Assistant,
        context: (!labels.is_empty()).then_some(labels),
        attachments: Vec::new(),
    }
}

pub fn assistant_error(id: MessageId, chat_id: ChatId, text: &str) -> MessagePayload {
    MessagePayload {
        id,
        chat_id,
        text: text.to_string(),
        role: Role::Assistant,
        context: None,
        attachments: Vec::new(),
    }
}
