//! SQLite store.
//!
//! One database file, four tables:
//! - `owners` - session id → owner id
//! - `conversation_messages` - general chat threads
//! - `documents` - ingested document text and metadata
//! - `document_messages` - document chat threads, cascade-deleted with their document
//!
//! Sequence numbers are allocated inside the INSERT itself, so two appends
//! to the same thread can never observe the same `MAX(seq)`.

use async_trait::async_trait;
use chatminds_core::document::{DocumentRecord, NewDocument};
use chatminds_core::error::StoreError;
use chatminds_core::message::{
    truncate_chars, ConversationId, ConversationSummary, DocumentId, Message, OwnerId, Role,
    ThreadKey, PREVIEW_CHARS,
};
use chatminds_core::store::{DocumentStore, MessageStore, OwnerStore};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A production SQLite store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let in_memory = path.contains(":memory:");
        if !in_memory {
            ensure_parent_dir(path).await?;
        }

        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // Every connection to `:memory:` is a separate database.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Close the pool. Later calls fail with [`StoreError::Unavailable`].
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements: [(&str, &str); 8] = [
            (
                "owners table",
                r#"
                CREATE TABLE IF NOT EXISTS owners (
                    id          TEXT PRIMARY KEY,
                    session_id  TEXT UNIQUE NOT NULL,
                    created_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "conversation_messages table",
                r#"
                CREATE TABLE IF NOT EXISTS conversation_messages (
                    iid              INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id         TEXT NOT NULL,
                    conversation_id  TEXT NOT NULL,
                    seq              INTEGER NOT NULL,
                    role             TEXT NOT NULL,
                    content          TEXT NOT NULL,
                    created_at       TEXT NOT NULL,
                    UNIQUE (owner_id, conversation_id, seq)
                )
                "#,
            ),
            (
                "documents table",
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    id            TEXT PRIMARY KEY,
                    owner_id      TEXT NOT NULL,
                    title         TEXT NOT NULL,
                    content       TEXT NOT NULL,
                    storage_path  TEXT,
                    page_count    INTEGER,
                    created_at    TEXT NOT NULL
                )
                "#,
            ),
            (
                "document_messages table",
                r#"
                CREATE TABLE IF NOT EXISTS document_messages (
                    iid          INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id     TEXT NOT NULL,
                    document_id  TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                    seq          INTEGER NOT NULL,
                    role         TEXT NOT NULL,
                    content      TEXT NOT NULL,
                    created_at   TEXT NOT NULL,
                    UNIQUE (owner_id, document_id, seq)
                )
                "#,
            ),
            (
                "conversation owner index",
                "CREATE INDEX IF NOT EXISTS idx_conversation_messages_owner ON conversation_messages(owner_id)",
            ),
            (
                "document owner index",
                "CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id, created_at DESC)",
            ),
            (
                "document messages index",
                "CREATE INDEX IF NOT EXISTS idx_document_messages_document ON document_messages(document_id)",
            ),
            (
                "owners session index",
                "CREATE INDEX IF NOT EXISTS idx_owners_session ON owners(session_id)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_message(
        row: &sqlx::sqlite::SqliteRow,
        owner: &OwnerId,
        key: &ThreadKey,
    ) -> Result<Message, StoreError> {
        let role: String = row
            .try_get("role")
            .map_err(|e| StoreError::QueryFailed(format!("role column: {e}")))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?;
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| StoreError::QueryFailed(format!("created_at column: {e}")))?;
        let sequence: i64 = row
            .try_get("seq")
            .map_err(|e| StoreError::QueryFailed(format!("seq column: {e}")))?;

        Ok(Message {
            owner: owner.clone(),
            key: key.clone(),
            role: Role::from_str(&role).map_err(StoreError::QueryFailed)?,
            content,
            created_at: parse_timestamp(&created_at),
            sequence,
        })
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord, StoreError> {
        let get = |col: &str| -> Result<String, StoreError> {
            row.try_get(col)
                .map_err(|e| StoreError::QueryFailed(format!("{col} column: {e}")))
        };
        let storage_path: Option<String> = row
            .try_get("storage_path")
            .map_err(|e| StoreError::QueryFailed(format!("storage_path column: {e}")))?;
        let page_count: Option<i64> = row
            .try_get("page_count")
            .map_err(|e| StoreError::QueryFailed(format!("page_count column: {e}")))?;

        Ok(DocumentRecord {
            owner: OwnerId(get("owner_id")?),
            id: DocumentId(get("id")?),
            title: get("title")?,
            text: get("content")?,
            storage_path,
            page_count: page_count.and_then(|n| u32::try_from(n).ok()),
            created_at: parse_timestamp(&get("created_at")?),
        })
    }
}

/// Table and key column backing a thread partition.
fn partition(key: &ThreadKey) -> (&'static str, &'static str) {
    match key {
        ThreadKey::Conversation(_) => ("conversation_messages", "conversation_id"),
        ThreadKey::Document(_) => ("document_messages", "document_id"),
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Connection-level failures mean the medium is unreachable; everything else
/// is a statement failure.
fn map_sqlx(context: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => StoreError::Unavailable(format!("{context}: {e}")),
        _ => StoreError::QueryFailed(format!("{context}: {e}")),
    }
}

async fn ensure_parent_dir(path: &str) -> Result<(), StoreError> {
    let file = path
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let file = file.split('?').next().unwrap_or(file);
    if let Some(parent) = std::path::Path::new(file).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Cannot create {}: {e}", parent.display())))?;
    }
    Ok(())
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(
        &self,
        owner: &OwnerId,
        key: &ThreadKey,
        role: Role,
        content: &str,
    ) -> Result<i64, StoreError> {
        let (table, column) = partition(key);
        let sql = format!(
            r#"
            INSERT INTO {table} (owner_id, {column}, seq, role, content, created_at)
            SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, ?3, ?4, ?5
            FROM {table}
            WHERE owner_id = ?1 AND {column} = ?2
            RETURNING seq
            "#
        );

        let row = sqlx::query(&sql)
            .bind(owner.as_str())
            .bind(key.id())
            .bind(role.as_str())
            .bind(content)
            .bind(now_timestamp())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("append", e))?;

        let seq: i64 = row
            .try_get("seq")
            .map_err(|e| StoreError::QueryFailed(format!("seq column: {e}")))?;
        debug!(owner = %owner, key = %key, seq, role = %role, "Appended message");
        Ok(seq)
    }

    async fn read(&self, owner: &OwnerId, key: &ThreadKey) -> Result<Vec<Message>, StoreError> {
        let (table, column) = partition(key);
        let sql = format!(
            "SELECT seq, role, content, created_at FROM {table} \
             WHERE owner_id = ?1 AND {column} = ?2 ORDER BY seq ASC"
        );

        let rows = sqlx::query(&sql)
            .bind(owner.as_str())
            .bind(key.id())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("read", e))?;

        rows.iter()
            .map(|row| Self::row_to_message(row, owner, key))
            .collect()
    }

    async fn delete(&self, owner: &OwnerId, key: &ThreadKey) -> Result<u64, StoreError> {
        let (table, column) = partition(key);
        let sql = format!("DELETE FROM {table} WHERE owner_id = ?1 AND {column} = ?2");

        let result = sqlx::query(&sql)
            .bind(owner.as_str())
            .bind(key.id())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("delete", e))?;

        debug!(owner = %owner, key = %key, removed = result.rows_affected(), "Deleted thread");
        Ok(result.rows_affected())
    }

    async fn list_conversations(&self, owner: &OwnerId) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT m.conversation_id AS conversation_id,
                   COUNT(*) AS message_count,
                   MAX(m.created_at) AS last_activity,
                   (SELECT f.content FROM conversation_messages f
                     WHERE f.owner_id = m.owner_id
                       AND f.conversation_id = m.conversation_id
                       AND f.role = 'user'
                     ORDER BY f.seq ASC LIMIT 1) AS preview
            FROM conversation_messages m
            WHERE m.owner_id = ?1
            GROUP BY m.conversation_id
            ORDER BY MAX(m.iid) DESC
            "#,
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("list conversations", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("conversation_id")
                    .map_err(|e| StoreError::QueryFailed(format!("conversation_id column: {e}")))?;
                let message_count: i64 = row
                    .try_get("message_count")
                    .map_err(|e| StoreError::QueryFailed(format!("message_count column: {e}")))?;
                let last_activity: String = row
                    .try_get("last_activity")
                    .map_err(|e| StoreError::QueryFailed(format!("last_activity column: {e}")))?;
                let preview: Option<String> = row
                    .try_get("preview")
                    .map_err(|e| StoreError::QueryFailed(format!("preview column: {e}")))?;

                Ok(ConversationSummary {
                    conversation_id: ConversationId(id),
                    message_count,
                    preview: preview
                        .map(|p| truncate_chars(&p, PREVIEW_CHARS).to_string())
                        .unwrap_or_default(),
                    last_activity: parse_timestamp(&last_activity),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_document(&self, owner: &OwnerId, doc: NewDocument) -> Result<DocumentRecord, StoreError> {
        let record = DocumentRecord {
            owner: owner.clone(),
            id: DocumentId::new(),
            title: doc.resolved_title(),
            text: doc.text,
            storage_path: doc.storage_path,
            page_count: doc.page_count,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, title, content, storage_path, page_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.id.as_str())
        .bind(owner.as_str())
        .bind(&record.title)
        .bind(&record.text)
        .bind(&record.storage_path)
        .bind(record.page_count.map(i64::from))
        .bind(record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert document", e))?;

        info!(owner = %owner, document = %record.id, chars = record.char_count(), "Stored document");
        Ok(record)
    }

    async fn get_document(&self, owner: &OwnerId, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1 AND owner_id = ?2")
            .bind(id.as_str())
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get document", e))?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn list_documents(&self, owner: &OwnerId) -> Result<Vec<DocumentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE owner_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("list documents", e))?;

        rows.iter().map(Self::row_to_document).collect()
    }

    async fn delete_document(&self, owner: &OwnerId, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("begin delete document", e))?;

        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1 AND owner_id = ?2")
            .bind(id.as_str())
            .bind(owner.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx("load document", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = Self::row_to_document(&row)?;

        let messages = sqlx::query("DELETE FROM document_messages WHERE document_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("delete document messages", e))?;

        sqlx::query("DELETE FROM documents WHERE id = ?1 AND owner_id = ?2")
            .bind(id.as_str())
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("delete document", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx("commit delete document", e))?;

        info!(
            owner = %owner,
            document = %id,
            messages = messages.rows_affected(),
            "Deleted document"
        );
        Ok(Some(record))
    }
}

#[async_trait]
impl OwnerStore for SqliteStore {
    async fn resolve_owner(&self, session_id: &str) -> Result<OwnerId, StoreError> {
        sqlx::query(
            "INSERT INTO owners (id, session_id, created_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(session_id) DO NOTHING",
        )
        .bind(OwnerId::new().as_str())
        .bind(session_id)
        .bind(now_timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("create owner", e))?;

        let row = sqlx::query("SELECT id FROM owners WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("resolve owner", e))?;

        let id: String = row
            .try_get("id")
            .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?;
        Ok(OwnerId(id))
    }
}
