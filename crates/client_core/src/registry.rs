//! In-memory cache of the current user's chats and the selected chat's history.

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{ChatSummary, MessagePayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChatAge {
    Today,
    Yesterday,
    DayBeforeYesterday,
    Earlier,
    Undated,
}

impl ChatAge {
    pub fn of(created_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(created_at) = created_at else {
            return Self::Undated;
        };
        let today = now.date_naive();
        let day = created_at.date_naive();
        if day == today {
            Self::Today
        } else if day == today - Duration::days(1) {
            Self::Yesterday
        } else if day == today - Duration::days(2) {
            Self::DayBeforeYesterday
        } else {
            Self::Earlier
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::Yesterday => "Yesterday",
            Self::DayBeforeYesterday => "Day before yesterday",
            Self::Earlier => "Earlier",
            Self::Undated => "Undated",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChatRegistry {
    user_id: Option<UserId>,
    chats: Vec<ChatSummary>,
    selected: Option<ChatId>,
    messages: Vec<MessagePayload>,
}

impl ChatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn chats(&self) -> &[ChatSummary] {
        &self.chats
    }

    pub fn selected(&self) -> Option<ChatId> {
        self.selected
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn is_displaying(&self, chat_id: ChatId) -> bool {
        self.selected == Some(chat_id)
    }

    /// Resets everything for a new user; chats arrive later via `replace_chats`.
    pub fn switch_user(&mut self, user_id: UserId) {
        self.user_id = Some(user_id);
        self.chats.clear();
        self.selected = None;
        self.messages.clear();
    }

    /// Wholesale replacement. Ignored if the registry moved on to another user.
    pub fn replace_chats(&mut self, user_id: UserId, chats: Vec<ChatSummary>) -> bool {
        if self.user_id != Some(user_id) {
            return false;
        }
        self.chats = chats;
        true
    }

    pub fn prepend(&mut self, chat: ChatSummary) {
        self.chats.retain(|existing| existing.id != chat.id);
        self.chats.insert(0, chat);
    }

    /// Removes a chat; returns to welcome mode if it was selected.
    pub fn remove(&mut self, chat_id: ChatId) -> bool {
        let before = self.chats.len();
        self.chats.retain(|chat| chat.id != chat_id);
        if self.selected == Some(chat_id) {
            self.selected = None;
            self.messages.clear();
        }
        self.chats.len() != before
    }

    pub fn set_summary(&mut self, chat_id: ChatId, summary: String) -> bool {
        match self.chats.iter_mut().find(|chat| chat.id == chat_id) {
            Some(chat) => {
                chat.summary = Some(summary);
                true
            }
            None => false,
        }
    }

    /// Moves a chat to the front, keeping the relative order of the rest.
    pub fn promote(&mut self, chat_id: ChatId) {
        if let Some(index) = self.chats.iter().position(|chat| chat.id == chat_id) {
            let chat = self.chats.remove(index);
            self.chats.insert(0, chat);
        }
    }

    /// Changes the selection, clearing history when it actually changes.
    pub fn select(&mut self, chat_id: Option<ChatId>) -> bool {
        if self.selected == chat_id {
            return false;
        }
        self.selected = chat_id;
        self.messages.clear();
        true
    }

    /// Installs a loaded history. Turns appended locally while the load was
    /// in flight are kept after it.
    pub fn load_history(&mut self, chat_id: ChatId, history: Vec<MessagePayload>) -> bool {
        if !self.is_displaying(chat_id) {
            return false;
        }
        let local = std::mem::replace(&mut self.messages, history);
        for message in local {
            if message.chat_id == chat_id
                && !self.messages.iter().any(|loaded| loaded.id == message.id)
            {
                self.messages.push(message);
            }
        }
        true
    }

    /// Appends only when the message belongs to the displayed chat.
    pub fn append_message(&mut self, message: MessagePayload) -> bool {
        if !self.is_displaying(message.chat_id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Appends a turn for a chat that does not exist yet. Only welcome mode
    /// displays such turns.
    pub fn append_pending(&mut self, message: MessagePayload) -> bool {
        if self.selected.is_some() {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Selects a freshly created chat and re-tags the pending turns with its
    /// id. Does nothing once the user has left welcome mode.
    pub fn adopt_pending(&mut self, chat_id: ChatId) -> bool {
        if self.selected.is_some() {
            return false;
        }
        self.selected = Some(chat_id);
        for message in &mut self.messages {
            message.chat_id = chat_id;
        }
        true
    }

    pub fn remove_message(&mut self, message_id: MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| message.id != message_id);
        self.messages.len() != before
    }

    pub fn update_message(
        &mut self,
        message_id: MessageId,
        update: impl FnOnce(&mut MessagePayload),
    ) -> bool {
        match self.messages.iter_mut().find(|message| message.id == message_id) {
            Some(message) => {
                update(message);
                true
            }
            None => false,
        }
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// Chats grouped by age, newest first inside each group.
    pub fn grouped_by_age(&self, now: DateTime<Utc>) -> Vec<(ChatAge, Vec<&ChatSummary>)> {
        let mut sorted: Vec<&ChatSummary> = self.chats.iter().collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut groups: Vec<(ChatAge, Vec<&ChatSummary>)> = Vec::new();
        for chat in sorted {
            let age = ChatAge::of(chat.created_at, now);
            match groups.iter_mut().find(|(group, _)| *group == age) {
                Some((_, chats)) => chats.push(chat),
                None => groups.push((age, vec![chat])),
            }
        }
        groups.sort_by_key(|(age, _)| *age);
        groups
    }
}
