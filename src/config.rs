use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use teloxide::types::ChatId;
use thiserror::Error;

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_PORT: u16 = 3978;
const DEFAULT_HISTORY_WINDOW: usize = 5;
const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TRANSCRIPTION_TIMEOUT_SECS: u64 = 120;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// Values parse but don't make sense together.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// How updates reach the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Polling,
    Webhook,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" => Ok(Self::Polling),
            "webhook" => Ok(Self::Webhook),
            other => Err(format!("expected 'polling' or 'webhook', got '{other}'")),
        }
    }
}

/// Process configuration, built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub openai_api_key: String,
    pub completion_model: String,
    pub openai_base_url: String,
    pub mode: TransportMode,
    /// Public base URL; the bot token is appended as the secret path.
    pub webhook_url: Option<String>,
    pub port: u16,
    pub log_level: tracing::Level,
    /// Chat that receives mirrored WARN/ERROR (and batched INFO) logs.
    pub log_chat_id: Option<ChatId>,
    /// Directory for the history database and log files.
    pub data_dir: PathBuf,
    /// Number of exchanges kept per user.
    pub history_window: usize,
    pub system_prompt: Option<String>,
    /// Voice messages are rejected when this is unset.
    pub whisper_model_path: Option<PathBuf>,
    pub whisper_language: Option<String>,
    pub completion_timeout: Duration,
    pub transcription_timeout: Duration,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_bot_token = get("API_TELEGRAM").ok_or(ConfigError::Missing("API_TELEGRAM"))?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "API_TELEGRAM appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let openai_api_key = get("OPENAI_TOKEN").ok_or(ConfigError::Missing("OPENAI_TOKEN"))?;

        let mode = match get("MODE") {
            Some(raw) => raw.parse::<TransportMode>().map_err(|reason| ConfigError::Invalid {
                key: "MODE",
                value: raw,
                reason,
            })?,
            None => TransportMode::Polling,
        };

        let webhook_url = get("WEBHOOK_URL");
        if mode == TransportMode::Webhook && webhook_url.is_none() {
            return Err(ConfigError::Validation("WEBHOOK_URL is required in webhook mode".into()));
        }

        let log_level = match get("LOG_LEVEL") {
            Some(raw) => raw.parse::<tracing::Level>().map_err(|e| ConfigError::Invalid {
                key: "LOG_LEVEL",
                value: raw,
                reason: e.to_string(),
            })?,
            None => tracing::Level::INFO,
        };

        let history_window = parse_or(&get, "HISTORY_WINDOW", DEFAULT_HISTORY_WINDOW)?;
        if history_window == 0 {
            return Err(ConfigError::Validation("HISTORY_WINDOW must be at least 1".into()));
        }

        Ok(Self {
            telegram_bot_token,
            openai_api_key,
            completion_model: get("CHATGPT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            mode,
            webhook_url,
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            log_level,
            log_chat_id: parse_opt::<i64>(&get, "LOG_CHAT_ID")?.map(ChatId),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            history_window,
            system_prompt: get("SYSTEM_PROMPT"),
            whisper_model_path: get("WHISPER_MODEL_PATH").map(PathBuf::from),
            whisper_language: get("WHISPER_LANGUAGE"),
            completion_timeout: Duration::from_secs(parse_or(
                &get,
                "COMPLETION_TIMEOUT_SECS",
                DEFAULT_COMPLETION_TIMEOUT_SECS,
            )?),
            transcription_timeout: Duration::from_secs(parse_or(
                &get,
                "TRANSCRIPTION_TIMEOUT_SECS",
                DEFAULT_TRANSCRIPTION_TIMEOUT_SECS,
            )?),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("history.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Full webhook URL registered with Telegram: `WEBHOOK_URL/<token>`.
    pub fn webhook_endpoint(&self) -> Option<String> {
        self.webhook_url
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), self.telegram_bot_token))
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value: raw,
            })
        })
        .transpose()
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}
