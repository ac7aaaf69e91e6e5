//! Relay engine - turns inbound bot events into reply text.
//!
//! Every failure is caught here, logged with the user and stage, and turned
//! into a short message for the user. Nothing propagates to the dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

use crate::relay::generator::{GenerateError, ResponseGenerator};
use crate::relay::history::HistoryStore;
use crate::relay::whisper::{SpeechToText, TranscriptionError};

pub const REGISTERED_REPLY: &str = "You are ready to go 🚀";
pub const RESET_REPLY: &str = "Conversation history cleared.";
pub const GENERATION_FAILED_REPLY: &str = "Sorry, I couldn't generate an answer right now. Please try again later.";
pub const TRANSCRIPTION_FAILED_REPLY: &str = "Sorry, I couldn't understand that voice message.";
pub const VOICE_DISABLED_REPLY: &str = "Voice messages are not supported on this bot.";
pub const STORAGE_FAILED_REPLY: &str = "Sorry, something went wrong on my side. Please try again later.";

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "register to the service.")]
    Start,
    #[command(description = "show this text.")]
    Help,
    #[command(description = "forget the conversation so far.")]
    Reset,
}

/// What a user sent, stripped of transport details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Register,
    Help,
    Reset,
    Text(String),
    /// Local path of a downloaded voice file.
    Voice(PathBuf),
}

impl From<Command> for InboundEvent {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Start => Self::Register,
            Command::Help => Self::Help,
            Command::Reset => Self::Reset,
        }
    }
}

impl InboundEvent {
    /// Whether handling this event may take long enough to show "typing...".
    pub fn is_slow(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Voice(_))
    }
}

pub fn help_text() -> String {
    format!("{}\n\nType /start to register to the service", Command::descriptions())
}

pub struct RelayEngine {
    store: Arc<HistoryStore>,
    generator: ResponseGenerator,
    transcriber: Option<Arc<dyn SpeechToText>>,
    transcription_timeout: Duration,
}

impl RelayEngine {
    pub fn new(
        store: Arc<HistoryStore>,
        generator: ResponseGenerator,
        transcriber: Option<Arc<dyn SpeechToText>>,
        transcription_timeout: Duration,
    ) -> Self {
        Self {
            store,
            generator,
            transcriber,
            transcription_timeout,
        }
    }

    /// Handle one event and return the reply for the user.
    pub async fn handle(&self, user_id: i64, event: InboundEvent) -> String {
        match event {
            InboundEvent::Register => match self.store.register(user_id) {
                Ok(_) => REGISTERED_REPLY.to_string(),
                Err(e) => {
                    warn!("[storage] register failed for user {}: {e}", user_id);
                    STORAGE_FAILED_REPLY.to_string()
                }
            },
            InboundEvent::Help => help_text(),
            InboundEvent::Reset => match self.store.reset(user_id) {
                Ok(_) => RESET_REPLY.to_string(),
                Err(e) => {
                    warn!("[storage] reset failed for user {}: {e}", user_id);
                    STORAGE_FAILED_REPLY.to_string()
                }
            },
            InboundEvent::Text(text) => self.answer(user_id, &text).await,
            InboundEvent::Voice(path) => match self.transcribe(path).await {
                Ok(text) if text.trim().is_empty() => {
                    info!("🎤 Voice from {} produced no text", user_id);
                    TRANSCRIPTION_FAILED_REPLY.to_string()
                }
                Ok(text) => {
                    info!("🎤 Voice from {} transcribed ({} chars)", user_id, text.chars().count());
                    self.answer(user_id, &text).await
                }
                Err(TranscriptionError::Unavailable) => VOICE_DISABLED_REPLY.to_string(),
                Err(e) => {
                    warn!("[transcription] user {}: {e}", user_id);
                    TRANSCRIPTION_FAILED_REPLY.to_string()
                }
            },
        }
    }

    async fn answer(&self, user_id: i64, question: &str) -> String {
        match self.generator.generate(user_id, question).await {
            Ok(answer) => answer,
            Err(GenerateError::Completion(e)) => {
                warn!("[completion] user {}: {e}", user_id);
                GENERATION_FAILED_REPLY.to_string()
            }
            Err(GenerateError::Storage(e)) => {
                warn!("[storage] user {}: {e}", user_id);
                GENERATION_FAILED_REPLY.to_string()
            }
        }
    }

    async fn transcribe(&self, path: PathBuf) -> Result<String, TranscriptionError> {
        let transcriber = self.transcriber.clone().ok_or(TranscriptionError::Unavailable)?;

        let task = tokio::task::spawn_blocking(move || transcriber.transcribe_file(&path));
        match tokio::time::timeout(self.transcription_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TranscriptionError::Task(join_err.to_string())),
            Err(_) => {
                // The blocking job cannot be cancelled; it runs to completion and its result is dropped.
                warn!(
                    "Transcription exceeded {:?}, abandoning the background job",
                    self.transcription_timeout
                );
                Err(TranscriptionError::Timeout)
            }
        }
    }
}
