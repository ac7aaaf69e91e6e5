use std::sync::Arc;

use teloxide::dispatching::{HandlerExt, UpdateFilterExt};
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use talkrelay::config::{Config, TransportMode};
use talkrelay::relay::{
    Command, HistoryStore, InboundEvent, OpenAiClient, RelayEngine, ResponseGenerator, SpeechToText,
    TelegramClient, Whisper,
};
use talkrelay::telegram_log::TelegramLogLayer;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct BotState {
    engine: RelayEngine,
    telegram: TelegramClient,
}

impl BotState {
    fn new(config: &Config, bot: &Bot) -> Result<Self, BoxError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(HistoryStore::open(&config.database_path())?);

        let completion = OpenAiClient::new(
            config.openai_api_key.clone(),
            config.completion_model.clone(),
            &config.openai_base_url,
            config.completion_timeout,
        )?;
        info!("Completion model: {}", completion.model());

        let generator = ResponseGenerator::new(
            store.clone(),
            Arc::new(completion),
            config.system_prompt.clone(),
            config.history_window,
        );

        let transcriber: Option<Arc<dyn SpeechToText>> = match config.whisper_model_path {
            Some(ref path) => Some(Arc::new(Whisper::new(path, config.whisper_language.as_deref())?)),
            None => {
                warn!("WHISPER_MODEL_PATH not set, voice messages are disabled");
                None
            }
        };

        Ok(Self {
            engine: RelayEngine::new(store, generator, transcriber, config.transcription_timeout),
            telegram: TelegramClient::new(bot.clone()),
        })
    }
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    let _log_guard = match init_logging(&config, &bot) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, bot).await {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

fn init_logging(config: &Config, bot: &Bot) -> Result<WorkerGuard, std::io::Error> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("talkrelay.log"))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);

    let level = config.log_level;
    let filter = move || tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter()),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        let tg_layer = TelegramLogLayer::new(bot.clone(), log_chat_id).with_filter(filter());
        registry.with(tg_layer).init();
    } else {
        registry.init();
    }

    Ok(guard)
}

async fn run(config: Config, bot: Bot) -> Result<(), BoxError> {
    info!("🚀 Starting talkrelay...");
    info!("History window: {} exchange(s), data dir: {:?}", config.history_window, config.data_dir);

    let state = Arc::new(BotState::new(&config, &bot)?);

    let handler = Update::filter_message()
        .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
        .branch(dptree::filter(|msg: Message| msg.voice().is_some()).endpoint(handle_voice))
        .branch(dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text));

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!("Ignoring update {}", upd.id.0);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("An error has occurred in the dispatcher"))
        .enable_ctrlc_handler()
        .build();

    match config.mode {
        TransportMode::Polling => {
            info!("Start polling mode");
            dispatcher.dispatch().await;
        }
        TransportMode::Webhook => {
            let endpoint = config
                .webhook_endpoint()
                .ok_or("webhook mode requires WEBHOOK_URL")?;
            let url: reqwest::Url = endpoint.parse()?;
            let listener = webhooks::axum(bot, webhooks::Options::new(config.listen_addr(), url)).await?;

            info!("Start webhook mode on port {}", config.port);
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await;
        }
    }

    info!("Shut down");
    Ok(())
}

async fn handle_command(msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    relay(&state, &msg, InboundEvent::from(cmd)).await;
    Ok(())
}

async fn handle_text(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    relay(&state, &msg, InboundEvent::Text(text.to_string())).await;
    Ok(())
}

async fn handle_voice(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(voice) = msg.voice() else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    // Deleted when dropped, after the reply has been sent.
    let audio = match tempfile::Builder::new().prefix("voice-").suffix(".ogg").tempfile() {
        Ok(file) => file,
        Err(e) => {
            warn!("[transport] chat {}: failed to create temp file: {e}", chat_id.0);
            return Ok(());
        }
    };

    if let Err(e) = state.telegram.download_file(&voice.file.id, audio.path()).await {
        warn!("[transport] chat {}: voice download failed: {e}", chat_id.0);
        return Ok(());
    }

    relay(&state, &msg, InboundEvent::Voice(audio.path().to_path_buf())).await;
    Ok(())
}

/// Run one event through the engine and deliver the reply.
async fn relay(state: &BotState, msg: &Message, event: InboundEvent) {
    let chat_id = msg.chat.id;
    if event.is_slow() {
        state.telegram.send_typing(chat_id);
    }

    let reply = state.engine.handle(chat_id.0, event).await;

    if let Err(e) = state.telegram.send_reply(chat_id, &reply).await {
        warn!("[transport] chat {}: failed to send reply: {e}", chat_id.0);
    }
}
