//! Persistent per-user conversation history backed by SQLite.
//!
//! Each user has one row in `users` and at most `window` rows in `exchanges`.
//! Exchanges are returned oldest-first; the oldest are dropped when a new one
//! pushes the count over the window.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

/// One question and the answer it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

impl Exchange {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// A user's recent exchanges, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub user_id: i64,
    pub exchanges: Vec<Exchange>,
}

impl HistoryRecord {
    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            exchanges: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn last(&self) -> Option<&Exchange> {
        self.exchanges.last()
    }
}

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!("Opened history database at {:?} ({} users)", path, store.user_count()?);
        Ok(store)
    }

    /// In-memory store, used by tests and when no data dir is writable.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(user_id),
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_exchanges_user_id ON exchanges(user_id, id);
        "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Create the user row if absent. Returns true when the user is new.
    pub fn register(&self, user_id: i64) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let inserted = insert_user(&conn, user_id)?;
        if inserted {
            info!("👤 Registered user {}", user_id);
        }
        Ok(inserted)
    }

    pub fn is_registered(&self, user_id: i64) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let found = conn
            .query_row("SELECT 1 FROM users WHERE user_id = ?1", params![user_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Fetch a user's history, creating an empty record for unseen users.
    pub fn load(&self, user_id: i64) -> Result<HistoryRecord, StorageError> {
        let conn = self.lock()?;
        insert_user(&conn, user_id)?;

        let mut stmt = conn.prepare(
            "SELECT question, answer FROM exchanges WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let exchanges = stmt
            .query_map(params![user_id], |row| {
                Ok(Exchange {
                    question: row.get(0)?,
                    answer: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(HistoryRecord { user_id, exchanges })
    }

    /// Append an exchange and drop the oldest ones beyond `window`.
    pub fn append(&self, user_id: i64, exchange: &Exchange, window: usize) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_user(&tx, user_id)?;
        tx.execute(
            "INSERT INTO exchanges (user_id, question, answer, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, exchange.question, exchange.answer, now()],
        )?;
        let trimmed = tx.execute(
            "DELETE FROM exchanges WHERE user_id = ?1 AND id NOT IN (
                SELECT id FROM exchanges WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![user_id, window as i64],
        )?;
        tx.commit()?;

        if trimmed > 0 {
            debug!("Trimmed {} old exchange(s) for user {}", trimmed, user_id);
        }
        Ok(())
    }

    /// Clear a user's exchanges. The user row stays.
    pub fn reset(&self, user_id: i64) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        insert_user(&conn, user_id)?;
        let removed = conn.execute("DELETE FROM exchanges WHERE user_id = ?1", params![user_id])?;
        info!("🧹 Reset history for user {} ({} exchanges removed)", user_id, removed);
        Ok(removed)
    }

    pub fn user_count(&self) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
impl HistoryStore {
    /// Run raw SQL on the connection, used to simulate a broken database.
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StorageError> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

fn insert_user(conn: &Connection, user_id: i64) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO users (user_id, created_at) VALUES (?1, ?2)",
        params![user_id, now()],
    )?;
    Ok(n > 0)
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
