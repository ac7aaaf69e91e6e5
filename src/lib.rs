pub mod config;
pub mod relay;
pub mod telegram_log;
