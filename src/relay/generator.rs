//! Response generation: history → prompt → completion → history.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::relay::completion::{CompletionBackend, CompletionError};
use crate::relay::history::{Exchange, HistoryStore, StorageError};
use crate::relay::prompt;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct ResponseGenerator {
    store: Arc<HistoryStore>,
    backend: Arc<dyn CompletionBackend>,
    system_prompt: Option<String>,
    window: usize,
    /// One lock per user with a request in flight; held across
    /// fetch → complete → append and removed once nobody holds it.
    user_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ResponseGenerator {
    pub fn new(
        store: Arc<HistoryStore>,
        backend: Arc<dyn CompletionBackend>,
        system_prompt: Option<String>,
        window: usize,
    ) -> Self {
        Self {
            store,
            backend,
            system_prompt,
            window: window.max(1),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user_id).or_default().clone()
    }

    async fn release_user_lock(&self, user_id: i64, lock: Arc<Mutex<()>>) {
        let mut locks = self.user_locks.lock().await;
        drop(lock);
        // Waiters clone the Arc under the map lock, so a count of one means the map holds the last reference.
        if locks.get(&user_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&user_id);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_users(&self) -> usize {
        self.user_locks.lock().await.len()
    }

    /// Answer `question` in the context of the user's recent exchanges.
    ///
    /// The exchange is recorded only when the completion succeeds.
    pub async fn generate(&self, user_id: i64, question: &str) -> Result<String, GenerateError> {
        let lock = self.user_lock(user_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.generate_locked(user_id, question).await
        };
        self.release_user_lock(user_id, lock).await;
        result
    }

    async fn generate_locked(&self, user_id: i64, question: &str) -> Result<String, GenerateError> {
        let record = self.store.load(user_id)?;
        let messages = prompt::assemble(self.system_prompt.as_deref(), &record, question);

        let answer = self.backend.complete(&messages).await?;

        info!("Question from {}: {}", user_id, truncate(question, 200));
        info!("Got answer for {}: {}", user_id, truncate(&answer, 200));

        self.store.append(user_id, &Exchange::new(question, answer.as_str()), self.window)?;
        Ok(answer)
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}
