//! Prompt assembly: stored history + new question → chat-completion messages.

use serde::Serialize;

use crate::relay::history::HistoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Build the message list for one completion request.
///
/// Layout: optional system message, then each stored exchange as a
/// user/assistant pair (oldest first), then the new question.
pub fn assemble(system_prompt: Option<&str>, record: &HistoryRecord, question: &str) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(record.len() * 2 + 2);

    if let Some(system) = system_prompt {
        messages.push(PromptMessage::system(system));
    }

    for exchange in &record.exchanges {
        messages.push(PromptMessage::user(exchange.question.as_str()));
        messages.push(PromptMessage::assistant(exchange.answer.as_str()));
    }

    messages.push(PromptMessage::user(question));
    messages
}
