//! Scenario tests for the relay: history, prompt assembly, generation and
//! event handling working together.
//!
//! Run with: cargo test relay

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::engine::{
    GENERATION_FAILED_REPLY, REGISTERED_REPLY, RESET_REPLY, STORAGE_FAILED_REPLY, TRANSCRIPTION_FAILED_REPLY,
    VOICE_DISABLED_REPLY,
};
use super::prompt::{PromptMessage, Role};
use super::*;

/// Completion backend that replays scripted results and records every prompt.
#[derive(Default)]
struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<Vec<PromptMessage>>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    fn with_replies(replies: Vec<Result<String, CompletionError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    fn answering(answers: &[&str]) -> Arc<Self> {
        Self::with_replies(answers.iter().map(|a| Ok(a.to_string())).collect())
    }

    fn prompts(&self) -> Vec<Vec<PromptMessage>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CompletionError::Empty))
    }
}

struct FakeTranscriber {
    result: fn() -> Result<String, TranscriptionError>,
    seen: Mutex<Vec<PathBuf>>,
}

impl SpeechToText for FakeTranscriber {
    fn transcribe_file(&self, path: &Path) -> Result<String, TranscriptionError> {
        self.seen.lock().unwrap().push(path.to_path_buf());
        (self.result)()
    }
}

struct Harness {
    store: Arc<HistoryStore>,
    backend: Arc<ScriptedBackend>,
    engine: RelayEngine,
}

fn harness_with(
    backend: Arc<ScriptedBackend>,
    system_prompt: Option<&str>,
    window: usize,
    transcriber: Option<Arc<dyn SpeechToText>>,
) -> Harness {
    build_harness(backend, system_prompt, window, transcriber, Duration::from_secs(5))
}

fn build_harness(
    backend: Arc<ScriptedBackend>,
    system_prompt: Option<&str>,
    window: usize,
    transcriber: Option<Arc<dyn SpeechToText>>,
    transcription_timeout: Duration,
) -> Harness {
    let store = Arc::new(HistoryStore::open_in_memory().unwrap());
    let generator = ResponseGenerator::new(
        store.clone(),
        backend.clone(),
        system_prompt.map(str::to_string),
        window,
    );
    let engine = RelayEngine::new(store.clone(), generator, transcriber, transcription_timeout);
    Harness { store, backend, engine }
}

/// Make every insert into `exchanges` fail, leaving reads intact.
fn refuse_exchange_inserts(store: &HistoryStore) {
    store
        .execute_raw(
            "CREATE TRIGGER refuse_exchanges BEFORE INSERT ON exchanges
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
}

fn harness(backend: Arc<ScriptedBackend>) -> Harness {
    harness_with(backend, None, 5, None)
}

// =============================================================================
// RESPONSE GENERATION
// =============================================================================

mod generation {
    use super::*;

    #[tokio::test]
    async fn test_two_turn_conversation() {
        let h = harness_with(ScriptedBackend::answering(&["Hi there", "Fine, thanks"]), Some("sys"), 5, None);

        assert_eq!(h.engine.handle(1, InboundEvent::Text("Hello".into())).await, "Hi there");
        assert_eq!(h.store.load(1).unwrap().exchanges, vec![Exchange::new("Hello", "Hi there")]);

        assert_eq!(h.engine.handle(1, InboundEvent::Text("How are you?".into())).await, "Fine, thanks");

        let prompts = h.backend.prompts();
        assert_eq!(prompts[0], vec![PromptMessage::system("sys"), PromptMessage::user("Hello")]);
        assert_eq!(
            prompts[1],
            vec![
                PromptMessage::system("sys"),
                PromptMessage::user("Hello"),
                PromptMessage::assistant("Hi there"),
                PromptMessage::user("How are you?"),
            ]
        );
    }

    #[tokio::test]
    async fn test_success_appends_exactly_one_exchange() {
        let h = harness(ScriptedBackend::answering(&["a1", "a2"]));
        h.engine.handle(1, InboundEvent::Text("q1".into())).await;
        let before = h.store.load(1).unwrap().len();

        h.engine.handle(1, InboundEvent::Text("q2".into())).await;
        let after = h.store.load(1).unwrap();

        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last(), Some(&Exchange::new("q2", "a2")));
    }

    #[tokio::test]
    async fn test_failed_completion_leaves_history_unchanged() {
        let backend = ScriptedBackend::with_replies(vec![
            Ok("first".into()),
            Err(CompletionError::Api { status: 429, body: "quota".into() }),
        ]);
        let h = harness(backend);

        h.engine.handle(1, InboundEvent::Text("q1".into())).await;
        let before = h.store.load(1).unwrap();

        let reply = h.engine.handle(1, InboundEvent::Text("q2".into())).await;
        assert_eq!(reply, GENERATION_FAILED_REPLY);
        assert_eq!(h.store.load(1).unwrap(), before);
    }

    #[tokio::test]
    async fn test_generator_surfaces_completion_error() {
        let store = Arc::new(HistoryStore::open_in_memory().unwrap());
        let backend = ScriptedBackend::with_replies(vec![Err(CompletionError::Timeout(Duration::from_secs(1)))]);
        let generator = ResponseGenerator::new(store.clone(), backend, None, 5);

        let err = generator.generate(1, "q").await.unwrap_err();
        assert!(matches!(err, GenerateError::Completion(CompletionError::Timeout(_))));
        assert!(store.load(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_window_trims_oldest_exchange() {
        let h = harness_with(ScriptedBackend::answering(&["a1", "a2", "a3", "a4"]), None, 2, None);
        for q in ["q1", "q2", "q3", "q4"] {
            h.engine.handle(1, InboundEvent::Text(q.into())).await;
        }

        let record = h.store.load(1).unwrap();
        assert_eq!(record.exchanges, vec![Exchange::new("q3", "a3"), Exchange::new("q4", "a4")]);

        // Last prompt saw only the two newest exchanges before q4.
        let last = h.backend.prompts().pop().unwrap();
        assert_eq!(last.len(), 5);
        assert_eq!(last[0], PromptMessage::user("q2"));
    }

    #[tokio::test]
    async fn test_users_do_not_share_history() {
        let h = harness(ScriptedBackend::answering(&["for alice", "for bob"]));
        h.engine.handle(1, InboundEvent::Text("alice asks".into())).await;
        h.engine.handle(2, InboundEvent::Text("bob asks".into())).await;

        let bob_prompt = &h.backend.prompts()[1];
        assert_eq!(bob_prompt, &vec![PromptMessage::user("bob asks")]);
    }

    #[tokio::test]
    async fn test_same_user_requests_are_serialized() {
        let backend = Arc::new(ScriptedBackend {
            replies: Mutex::new(vec![Ok("a1".to_string()), Ok("a2".to_string())].into()),
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let h = harness(backend);

        let (r1, r2) = tokio::join!(
            h.engine.handle(1, InboundEvent::Text("q1".into())),
            h.engine.handle(1, InboundEvent::Text("q2".into())),
        );
        assert_eq!((r1.as_str(), r2.as_str()), ("a1", "a2"));

        // The second request waited for the first and saw its exchange.
        let prompts = h.backend.prompts();
        assert_eq!(prompts[0].len(), 1);
        assert_eq!(prompts[1].len(), 3);
        assert_eq!(h.store.load(1).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_user_locks_are_released() {
        let store = Arc::new(HistoryStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend {
            replies: Mutex::new(vec![Ok("a1".to_string()), Ok("a2".to_string()), Ok("b1".to_string())].into()),
            delay: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        let generator = ResponseGenerator::new(store, backend, None, 5);

        let (r1, r2, r3) = tokio::join!(
            generator.generate(1, "q1"),
            generator.generate(1, "q2"),
            generator.generate(2, "q1"),
        );
        assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());
        assert_eq!(generator.tracked_users().await, 0);

        let err = generator.generate(3, "no more replies").await.unwrap_err();
        assert!(matches!(err, GenerateError::Completion(CompletionError::Empty)));
        assert_eq!(generator.tracked_users().await, 0);
    }
}

// =============================================================================
// STORAGE FAILURES
// =============================================================================

mod storage {
    use super::*;

    #[tokio::test]
    async fn test_failed_append_reports_generation_failure() {
        let h = harness(ScriptedBackend::answering(&["a1", "a2"]));
        h.engine.handle(1, InboundEvent::Text("q1".into())).await;
        let before = h.store.load(1).unwrap();

        refuse_exchange_inserts(&h.store);
        let reply = h.engine.handle(1, InboundEvent::Text("q2".into())).await;

        assert_eq!(reply, GENERATION_FAILED_REPLY);
        assert_eq!(h.backend.prompts().len(), 2);
        assert_eq!(h.store.load(1).unwrap(), before);
    }

    #[tokio::test]
    async fn test_generator_surfaces_storage_error() {
        let store = Arc::new(HistoryStore::open_in_memory().unwrap());
        refuse_exchange_inserts(&store);
        let generator = ResponseGenerator::new(store.clone(), ScriptedBackend::answering(&["a"]), None, 5);

        let err = generator.generate(1, "q").await.unwrap_err();
        assert!(matches!(err, GenerateError::Storage(StorageError::Sqlite(_))));
        assert!(store.load(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_history_skips_completion() {
        let h = harness(ScriptedBackend::answering(&["unused"]));
        h.store.execute_raw("DROP TABLE exchanges;").unwrap();

        let reply = h.engine.handle(1, InboundEvent::Text("q".into())).await;
        assert_eq!(reply, GENERATION_FAILED_REPLY);
        assert!(h.backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_reset_report_storage_failure() {
        let h = harness(ScriptedBackend::answering(&[]));
        h.store.execute_raw("DROP TABLE exchanges; DROP TABLE users;").unwrap();

        assert_eq!(h.engine.handle(5, InboundEvent::Register).await, STORAGE_FAILED_REPLY);
        assert_eq!(h.engine.handle(5, InboundEvent::Reset).await, STORAGE_FAILED_REPLY);
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

mod commands {
    use super::*;
    use teloxide::utils::command::BotCommands;

    #[tokio::test]
    async fn test_register_creates_user() {
        let h = harness(ScriptedBackend::answering(&[]));
        assert!(!h.store.is_registered(5).unwrap());

        assert_eq!(h.engine.handle(5, InboundEvent::Register).await, REGISTERED_REPLY);
        assert!(h.store.is_registered(5).unwrap());
        assert!(h.backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_register_twice_keeps_history() {
        let h = harness(ScriptedBackend::answering(&["a"]));
        h.engine.handle(5, InboundEvent::Text("q".into())).await;
        h.engine.handle(5, InboundEvent::Register).await;
        assert_eq!(h.store.load(5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_help_lists_commands() {
        let h = harness(ScriptedBackend::answering(&[]));
        let reply = h.engine.handle(5, InboundEvent::Help).await;
        assert!(reply.contains("/start"));
        assert!(reply.contains("/reset"));
        assert!(reply.contains("Type /start to register to the service"));
    }

    #[tokio::test]
    async fn test_reset_returns_to_no_history_case() {
        let h = harness(ScriptedBackend::answering(&["a1", "a2"]));
        h.engine.handle(5, InboundEvent::Text("q1".into())).await;

        assert_eq!(h.engine.handle(5, InboundEvent::Reset).await, RESET_REPLY);
        assert!(h.store.is_registered(5).unwrap());
        assert!(h.store.load(5).unwrap().is_empty());

        h.engine.handle(5, InboundEvent::Text("q2".into())).await;
        assert_eq!(h.backend.prompts()[1], vec![PromptMessage::user("q2")]);
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("/start", "relaybot").unwrap(), Command::Start);
        assert_eq!(Command::parse("/reset@relaybot", "relaybot").unwrap(), Command::Reset);
        assert!(Command::parse("/unknown", "relaybot").is_err());
        assert_eq!(InboundEvent::from(Command::Help), InboundEvent::Help);
    }
}

// =============================================================================
// VOICE MESSAGES
// =============================================================================

mod voice {
    use super::*;

    fn transcriber(result: fn() -> Result<String, TranscriptionError>) -> Arc<FakeTranscriber> {
        Arc::new(FakeTranscriber {
            result,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_voice_is_answered_like_text() {
        let stt = transcriber(|| Ok("what time is it".into()));
        let h = harness_with(ScriptedBackend::answering(&["noon"]), None, 5, Some(stt.clone()));

        let reply = h.engine.handle(3, InboundEvent::Voice(PathBuf::from("/tmp/v.ogg"))).await;

        assert_eq!(reply, "noon");
        assert_eq!(stt.seen.lock().unwrap().as_slice(), &[PathBuf::from("/tmp/v.ogg")]);
        assert_eq!(h.backend.prompts()[0], vec![PromptMessage::user("what time is it")]);
        assert_eq!(h.store.load(3).unwrap().exchanges, vec![Exchange::new("what time is it", "noon")]);
    }

    #[tokio::test]
    async fn test_transcription_failure_skips_generation() {
        let stt = transcriber(|| Err(TranscriptionError::Decode("bad ogg".into())));
        let h = harness_with(ScriptedBackend::answering(&["unused"]), None, 5, Some(stt));

        let reply = h.engine.handle(3, InboundEvent::Voice(PathBuf::from("/tmp/v.ogg"))).await;

        assert_eq!(reply, TRANSCRIPTION_FAILED_REPLY);
        assert!(h.backend.prompts().is_empty());
        assert!(h.store.load(3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_transcription_is_a_failure() {
        let stt = transcriber(|| Ok("   ".into()));
        let h = harness_with(ScriptedBackend::answering(&["unused"]), None, 5, Some(stt));

        let reply = h.engine.handle(3, InboundEvent::Voice(PathBuf::from("/tmp/v.ogg"))).await;
        assert_eq!(reply, TRANSCRIPTION_FAILED_REPLY);
        assert!(h.backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_slow_transcription_times_out() {
        let stt = transcriber(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok("too late".into())
        });
        let h = build_harness(
            ScriptedBackend::answering(&["unused"]),
            None,
            5,
            Some(stt),
            Duration::from_millis(20),
        );

        let reply = h.engine.handle(3, InboundEvent::Voice(PathBuf::from("/tmp/v.ogg"))).await;

        assert_eq!(reply, TRANSCRIPTION_FAILED_REPLY);
        assert!(h.backend.prompts().is_empty());
        assert!(h.store.load(3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_crashed_transcription_task() {
        let stt = transcriber(|| panic!("decoder crashed"));
        let h = harness_with(ScriptedBackend::answering(&["unused"]), None, 5, Some(stt));

        let reply = h.engine.handle(3, InboundEvent::Voice(PathBuf::from("/tmp/v.ogg"))).await;

        assert_eq!(reply, TRANSCRIPTION_FAILED_REPLY);
        assert!(h.backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_voice_without_model() {
        let h = harness(ScriptedBackend::answering(&["unused"]));
        let reply = h.engine.handle(3, InboundEvent::Voice(PathBuf::from("/tmp/v.ogg"))).await;
        assert_eq!(reply, VOICE_DISABLED_REPLY);
    }

    #[test]
    fn test_slow_events() {
        assert!(InboundEvent::Text("x".into()).is_slow());
        assert!(InboundEvent::Voice(PathBuf::from("v.ogg")).is_slow());
        assert!(!InboundEvent::Reset.is_slow());
        assert_eq!(PromptMessage::user("x").role, Role::User);
    }
}
