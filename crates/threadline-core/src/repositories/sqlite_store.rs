use std::path::{Path, PathBuf};

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::error::{StoreError, StoreResult};
use super::message_store::{BoxFuture, ConversationRecord, MessageStore, unix_now};
use crate::models::Message;

/// Migrations applied in order. Each entry is (version, sql).
/// Never edit or remove existing entries; append a new version instead.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS conversations (
        id          TEXT    PRIMARY KEY,
        title       TEXT    NOT NULL DEFAULT '',
        project_id  TEXT,
        created_at  INTEGER NOT NULL DEFAULT 0,
        updated_at  INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
        ON conversations (updated_at DESC);
    CREATE TABLE IF NOT EXISTS messages (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT    NOT NULL,
        message_id      TEXT    NOT NULL,
        payload         TEXT    NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, seq);",
)];

/// SQLite-backed message store.
///
/// Messages are stored as JSON payloads in append order. `SqlitePool` is
/// internally reference-counted and cheap to clone.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (or create) the database at the platform-specific data path.
    pub async fn new() -> StoreResult<Self> {
        Self::open(&Self::db_path()?).await
    }

    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite message store");

        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection keeps every query on the same database.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // One statement per query call.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn db_path() -> StoreResult<PathBuf> {
        dirs::data_dir()
            .ok_or_else(|| StoreError::Initialization {
                message: "Cannot find data directory".into(),
            })
            .map(|p| p.join("threadline").join("messages.db"))
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> ConversationRecord {
    ConversationRecord {
        id: row.get("id"),
        title: row.get("title"),
        project_id: row.get("project_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl MessageStore for SqliteMessageStore {
    fn get_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT payload FROM messages
                 WHERE conversation_id = ?
                 ORDER BY seq ASC",
            )
            .bind(&id)
            .fetch_all(&pool)
            .await?;

            rows.iter()
                .map(|row| {
                    let payload: String = row.get("payload");
                    serde_json::from_str(&payload).map_err(StoreError::from)
                })
                .collect()
        })
    }

    fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let payload = serde_json::to_string(&message)?;

            sqlx::query(
                "INSERT INTO messages (conversation_id, message_id, payload)
                 VALUES (?1, ?2, ?3)",
            )
            .bind(&id)
            .bind(&message.id)
            .bind(&payload)
            .execute(&pool)
            .await?;

            sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
                .bind(unix_now())
                .bind(&id)
                .execute(&pool)
                .await?;

            Ok(())
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Option<ConversationRecord>>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, title, project_id, created_at, updated_at
                 FROM conversations
                 WHERE id = ?",
            )
            .bind(&id)
            .fetch_optional(&pool)
            .await?;

            Ok(row.as_ref().map(record_from_row))
        })
    }

    fn put_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, title, project_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    title      = excluded.title,
                    project_id = excluded.project_id,
                    updated_at = excluded.updated_at",
            )
            .bind(&record.id)
            .bind(&record.title)
            .bind(&record.project_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&pool)
            .await?;

            Ok(())
        })
    }

    fn list_conversations(&self) -> BoxFuture<'static, StoreResult<Vec<ConversationRecord>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, title, project_id, created_at, updated_at
                 FROM conversations
                 ORDER BY updated_at DESC",
            )
            .fetch_all(&pool)
            .await?;

            Ok(rows.iter().map(record_from_row).collect())
        })
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }
}
