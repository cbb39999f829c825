pub mod models;

use crate::content::{MessageContent, Role};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use models::{Conversation, Message};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database connection lock poisoned")]
    Poisoned,
    #[error("Database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Durable home of conversations and their messages.
///
/// Messages are append-only; `list_messages` returns them oldest first.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_conversation(
        &self,
        owner_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError>;

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &MessageContent,
    ) -> Result<Message, StoreError>;

    /// Messages of a conversation owned by `owner_id`. A conversation that is
    /// missing or owned by someone else is `ConversationNotFound`.
    async fn list_messages(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError>;

    /// Conversations owned by `owner_id`, newest first.
    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), StoreError>;
}

/// SQLite store. Synchronous methods run on the caller's thread; the
/// `ChatStore` impl moves each call onto the blocking pool.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(app_dir: &std::path::Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(app_dir)?;
        let db_path = app_dir.join("code-helper.db");
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn(migrate)?;
        Ok(db)
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = lock(&self.conn)?;
        op(&conn)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            op(&conn)
        })
        .await?
    }

    // ── Conversations ──

    pub fn create_conversation(&self, owner_id: &str, title: &str) -> Result<Conversation, StoreError> {
        self.with_conn(|conn| insert_conversation(conn, owner_id, title))
    }

    pub fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
        self.with_conn(|conn| select_conversations(conn, owner_id))
    }

    pub fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| remove_conversation(conn, id))
    }

    // ── Messages ──

    pub fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &MessageContent,
    ) -> Result<Message, StoreError> {
        self.with_conn(|conn| insert_message(conn, conversation_id, role, content))
    }

    /// All messages of a conversation, regardless of owner.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.with_conn(|conn| select_messages(conn, conversation_id))
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
            Ok(())
        })
    }
}

#[async_trait]
impl ChatStore for Database {
    async fn create_conversation(
        &self,
        owner_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let (owner_id, title) = (owner_id.to_string(), title.to_string());
        self.blocking(move |conn| insert_conversation(conn, &owner_id, &title))
            .await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &MessageContent,
    ) -> Result<Message, StoreError> {
        let (conversation_id, content) = (conversation_id.to_string(), content.clone());
        self.blocking(move |conn| insert_message(conn, &conversation_id, role, &content))
            .await
    }

    async fn list_messages(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let (owner_id, conversation_id) = (owner_id.to_string(), conversation_id.to_string());
        self.blocking(move |conn| select_owned_messages(conn, &owner_id, &conversation_id))
            .await
    }

    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let owner_id = owner_id.to_string();
        self.blocking(move |conn| select_conversations(conn, &owner_id))
            .await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), StoreError> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| remove_conversation(conn, &conversation_id))
            .await
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::Poisoned)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, created_at);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn insert_conversation(
    conn: &Connection,
    owner_id: &str,
    title: &str,
) -> Result<Conversation, StoreError> {
    let conv = Conversation {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: owner_id.to_string(),
        title: title.to_string(),
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO chats (id, user_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![conv.id, conv.user_id, conv.title, timestamp(&conv.created_at)],
    )?;
    Ok(conv)
}

fn select_conversations(conn: &Connection, owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, title, created_at FROM chats WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map(params![owner_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    rows.map(|row| -> Result<Conversation, StoreError> {
        let (id, user_id, title, created_at) = row?;
        Ok(Conversation {
            id,
            user_id,
            title,
            created_at: parse_timestamp(&created_at)?,
        })
    })
    .collect()
}

fn select_owner(conn: &Connection, id: &str) -> Result<Option<String>, StoreError> {
    let owner = conn
        .query_row(
            "SELECT user_id FROM chats WHERE id = ?1",
            params![id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(owner)
}

fn remove_conversation(conn: &Connection, id: &str) -> Result<(), StoreError> {
    let removed = conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
    if removed == 0 {
        return Err(StoreError::ConversationNotFound(id.to_string()));
    }
    Ok(())
}

fn insert_message(
    conn: &Connection,
    conversation_id: &str,
    role: Role,
    content: &MessageContent,
) -> Result<Message, StoreError> {
    let msg = Message {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        role,
        content: content.clone(),
        created_at: Utc::now(),
    };
    let inserted = conn.execute(
        "INSERT INTO messages (id, chat_id, role, content, created_at)
         SELECT ?1, id, ?3, ?4, ?5 FROM chats WHERE id = ?2",
        params![
            msg.id,
            msg.conversation_id,
            role.as_str(),
            serde_json::to_string(content)?,
            timestamp(&msg.created_at)
        ],
    )?;
    if inserted == 0 {
        return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
    }
    Ok(msg)
}

fn select_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, chat_id, role, content, created_at FROM messages WHERE chat_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![conversation_id], RawMessage::from_row)?;
    rows.map(|row| row?.into_message()).collect()
}

fn select_owned_messages(
    conn: &Connection,
    owner_id: &str,
    conversation_id: &str,
) -> Result<Vec<Message>, StoreError> {
    match select_owner(conn, conversation_id)? {
        Some(owner) if owner == owner_id => select_messages(conn, conversation_id),
        _ => Err(StoreError::ConversationNotFound(conversation_id.to_string())),
    }
}

/// Microsecond precision keeps lexical order equal to time order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

struct RawMessage {
    id: String,
    chat_id: String,
    role: String,
    content: String,
    created_at: String,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_message(self) -> Result<Message, StoreError> {
        Ok(Message {
            role: self.role.parse().map_err(StoreError::Corrupt)?,
            content: serde_json::from_str(&self.content)?,
            created_at: parse_timestamp(&self.created_at)?,
            id: self.id,
            conversation_id: self.chat_id,
        })
    }
}
