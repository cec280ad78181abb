//! Durable question/answer transcript in SQLite.
//!
//! Rows are append-only. Ordering is by the storage-assigned row id, so a
//! user who fires several questions at once may see answers rendered out of
//! step with their questions.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Local, TimeZone};
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, TranscriptError>;

/// Question rows are `1`, answer rows are `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Answer = 0,
    Question = 1,
}

impl ChatType {
    fn from_i64(v: i64) -> Self {
        if v == 1 { ChatType::Question } else { ChatType::Answer }
    }
}

/// A stored transcript row.
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: i64,
    pub username: String,
    pub chat_type: ChatType,
    pub content: String,
    pub created_at: DateTime<Local>,
}

/// Selection criteria for [`TranscriptStore::exists`].
#[derive(Debug, Clone, Default)]
pub struct ChatFilter {
    pub username: Option<String>,
    pub chat_type: Option<ChatType>,
}

impl ChatFilter {
    pub fn username(name: &str) -> Self {
        Self { username: Some(name.to_string()), chat_type: None }
    }
}

/// Append-only transcript store.
pub struct TranscriptStore {
    conn: Mutex<Connection>,
}

impl TranscriptStore {
    /// Create a new in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self::from_connection(Connection::open(path)?)?;
        info!("Loaded transcript database from {:?} ({} records)", path, store.count()?);
        Ok(store)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                chat_type INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chats_username ON chats(username);
        "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one record and return its row id. Each append is a single
    /// atomic insert.
    pub fn append(&self, username: &str, chat_type: ChatType, content: &str) -> Result<i64> {
        self.append_at(username, chat_type, content, chrono::Utc::now().timestamp_millis())
    }

    /// Append with an explicit clock reading. The stored timestamp never
    /// precedes the user's latest one, so a clock stepping backwards cannot
    /// reorder a user's records by time.
    pub fn append_at(&self, username: &str, chat_type: ChatType, content: &str, now_ms: i64) -> Result<i64> {
        let conn = self.lock();
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(created_at) FROM chats WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        let created_at = latest.map_or(now_ms, |latest| latest.max(now_ms));
        conn.execute(
            "INSERT INTO chats (username, chat_type, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, chat_type as i64, content, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All records for `username`, oldest first.
    pub fn list(&self, username: &str) -> Result<Vec<ChatRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, chat_type, content, created_at
             FROM chats WHERE username = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![username], |row| {
            let millis: i64 = row.get(4)?;
            Ok(ChatRecord {
                id: row.get(0)?,
                username: row.get(1)?,
                chat_type: ChatType::from_i64(row.get(2)?),
                content: row.get(3)?,
                created_at: Local
                    .timestamp_millis_opt(millis)
                    .single()
                    .unwrap_or_else(Local::now),
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(TranscriptError::from)
    }

    /// Read-only probe; never creates rows.
    pub fn exists(&self, filter: &ChatFilter) -> Result<bool> {
        let conn = self.lock();
        let found: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM chats
                WHERE (?1 IS NULL OR username = ?1) AND (?2 IS NULL OR chat_type = ?2)
            )",
            params![filter.username, filter.chat_type.map(|t| t as i64)],
            |row| row.get(0),
        )?;
        Ok(found != 0)
    }

    /// Delete every record for `username`, returning how many were removed.
    pub fn delete_all(&self, username: &str) -> Result<usize> {
        let conn = self.lock();
        let removed = conn.execute("DELETE FROM chats WHERE username = ?1", params![username])?;
        info!("🗑️ Deleted {} transcript records for {}", removed, username);
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM chats", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Render records as one markdown document.
pub fn render_markdown(records: &[ChatRecord]) -> String {
    let mut doc = String::new();
    for record in records {
        let ctime = record.created_at.format("%Y-%m-%d %H:%M:%S");
        match record.chat_type {
            ChatType::Question => doc.push_str(&format!(
                "## 🙋 {} 问\n\n**时间:** {}\n\n**问题为:** {}\n\n",
                record.username, ctime, record.content
            )),
            ChatType::Answer => doc.push_str(&format!(
                "## 🤖 机器人 答\n\n**时间:** {}\n\n**回答如下：** \n\n{}\n\n",
                ctime, record.content
            )),
        }
    }
    doc
}
