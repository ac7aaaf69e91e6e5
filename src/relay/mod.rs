//! Relay module - forwards Telegram messages to a chat-completion API.

pub mod completion;
pub mod engine;
pub mod generator;
pub mod history;
pub mod prompt;
pub mod telegram;
pub mod whisper;

#[cfg(test)]
mod tests;

pub use completion::{CompletionBackend, CompletionError, OpenAiClient};
pub use engine::{Command, InboundEvent, RelayEngine};
pub use generator::{GenerateError, ResponseGenerator};
pub use history::{Exchange, HistoryRecord, HistoryStore, StorageError};
pub use telegram::{TelegramClient, TransportError};
pub use whisper::{SpeechToText, TranscriptionError, Whisper};
