//! Telegram client using teloxide.

use std::path::Path;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, FileId};
use thiserror::Error;
use tracing::{debug, warn};

/// Telegram measures message length in UTF-16 code units.
const MAX_MESSAGE_UNITS: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
    #[error("file download failed: {0}")]
    Download(#[from] teloxide::DownloadError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Telegram API client.
#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Send `text`, split into several messages if it is too long for one.
    pub async fn send_reply(&self, chat_id: ChatId, text: &str) -> Result<(), TransportError> {
        for chunk in split_message(text, MAX_MESSAGE_UNITS) {
            self.bot.send_message(chat_id, chunk).await?;
        }
        Ok(())
    }

    /// Show "typing..." in the chat. Fire-and-forget: failures are only logged.
    pub fn send_typing(&self, chat_id: ChatId) {
        let bot = self.bot.clone();
        tokio::spawn(async move {
            if let Err(e) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
                warn!("Failed to send typing action to {}: {e}", chat_id.0);
            }
        });
    }

    /// Download a Telegram file to `dest`.
    pub async fn download_file(&self, file_id: &FileId, dest: &Path) -> Result<(), TransportError> {
        let file = self.bot.get_file(file_id.clone()).await?;
        let mut out = tokio::fs::File::create(dest).await?;
        self.bot.download_file(&file.path, &mut out).await?;
        debug!("📥 Downloaded {} ({} bytes) to {:?}", file.path, file.size, dest);
        Ok(())
    }
}

/// Split into chunks of at most `max_units` UTF-16 units, never inside a
/// char, preferring to break after the last newline that fits.
fn split_message(text: &str, max_units: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let mut units = 0;
        let mut end = rest.len();
        let mut after_newline = None;
        for (idx, c) in rest.char_indices() {
            if units + c.len_utf16() > max_units {
                end = idx;
                break;
            }
            units += c.len_utf16();
            if c == '\n' {
                after_newline = Some(idx + 1);
            }
        }
        if end < rest.len()
            && let Some(nl) = after_newline
        {
            end = nl;
        }
        if end == 0 {
            // A single char wider than the limit still has to go somewhere.
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }

        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk.to_string());
        rest = tail;
    }

    chunks
}
