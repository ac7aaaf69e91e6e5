//! Tracing layer that mirrors log events into a Telegram chat.
//!
//! WARN and ERROR go out immediately; INFO lines are batched and flushed
//! on a timer or when the batch fills up. DEBUG and TRACE are never sent.

use std::fmt::Write as _;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BATCH: usize = 50;
const MAX_TEXT_CHARS: usize = 4000;

#[derive(Debug, PartialEq, Eq)]
enum Entry {
    Urgent(String),
    Batched(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<Entry>,
}

impl TelegramLogLayer {
    /// Must be called inside a Tokio runtime; spawns the sender task.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(bot, chat_id, rx));
        Self { tx }
    }
}

async fn forward(bot: Bot, chat_id: ChatId, mut rx: mpsc::UnboundedReceiver<Entry>) {
    let mut batch: Vec<String> = Vec::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(Entry::Urgent(text)) => post(&bot, chat_id, &text).await,
                Some(Entry::Batched(text)) => {
                    batch.push(text);
                    if batch.len() >= MAX_BATCH {
                        post(&bot, chat_id, &batch.join("\n")).await;
                        batch.clear();
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    post(&bot, chat_id, &batch.join("\n")).await;
                    batch.clear();
                }
            }
        }
    }
}

async fn post(bot: &Bot, chat_id: ChatId, text: &str) {
    let text = clip(text, MAX_TEXT_CHARS);
    // Logging from here would feed back into this layer.
    if let Err(e) = bot.send_message(chat_id, text).await {
        eprintln!("Failed to mirror log to Telegram: {e}");
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    extra: String,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let sep = if self.extra.is_empty() { "" } else { ", " };
            let _ = write!(self.extra, "{sep}{} = {:?}", field.name(), value);
        }
    }
}

impl FieldCollector {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.extra.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.extra,
            (false, false) => format!("{} ({})", self.message, self.extra),
        }
    }
}

fn entry_for(level: Level, text: String) -> Option<Entry> {
    match level {
        Level::ERROR => Some(Entry::Urgent(format!("❌ {text}"))),
        Level::WARN => Some(Entry::Urgent(format!("⚠️ {text}"))),
        Level::INFO => Some(Entry::Batched(text)),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        if let Some(entry) = entry_for(level, fields.finish())
            && self.tx.send(entry).is_err()
        {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
