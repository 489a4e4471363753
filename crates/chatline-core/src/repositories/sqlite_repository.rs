use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::info;

use super::error::{RepositoryError, RepositoryResult};
use super::transcript_repository::{BoxFuture, TranscriptRepository};
use crate::models::{Conversation, Message, Role, now_millis};

/// Migrations applied in order. Each entry is (version, sql).
/// Never edit or remove existing entries; append a new version instead.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT    PRIMARY KEY,
            owner_id        TEXT,
            title           TEXT    NOT NULL DEFAULT '',
            model_id        TEXT    NOT NULL DEFAULT '',
            created_at      INTEGER NOT NULL DEFAULT 0,
            updated_at      INTEGER NOT NULL DEFAULT 0,
            last_message_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_owner
            ON conversations (owner_id, updated_at DESC);
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT    PRIMARY KEY,
            conversation_id TEXT    NOT NULL,
            role            TEXT    NOT NULL,
            content         TEXT    NOT NULL DEFAULT '',
            parts           TEXT    NOT NULL DEFAULT '[]',
            sequence        INTEGER NOT NULL,
            created_at      INTEGER NOT NULL DEFAULT 0,
            usage           TEXT,
            UNIQUE (conversation_id, sequence)
        )",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS stream_handles (
            stream_id       TEXT    PRIMARY KEY,
            conversation_id TEXT    NOT NULL,
            owner_id        TEXT,
            created_at      INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stream_handles_conversation
            ON stream_handles (conversation_id, created_at DESC)",
    ),
];

/// SQLite-backed transcript store for authenticated users.
///
/// Uses WAL journal mode so readers are not blocked by a generation's append.
/// `SqlitePool` is internally reference-counted and cheap to clone.
#[derive(Clone)]
pub struct SqliteTranscriptRepository {
    pool: SqlitePool,
}

impl SqliteTranscriptRepository {
    /// Open (or create) the database at the platform-specific data path.
    pub async fn new() -> RepositoryResult<Self> {
        Self::open(&Self::db_path()?).await
    }

    pub async fn open(db_path: &Path) -> RepositoryResult<Self> {
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

        info!(path = %db_path.display(), "Opened SQLite transcript database");

        Ok(Self { pool })
    }

    /// Private in-memory database; every handle shares its single connection.
    pub async fn in_memory() -> RepositoryResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Shared pool, used by the stream-handle table.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
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
                // One statement per query call
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

    fn db_path() -> RepositoryResult<PathBuf> {
        dirs::data_local_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Cannot find local data directory".into(),
            })
            .map(|p| p.join("chatline").join("transcripts.db"))
    }
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, parts, sequence, created_at, usage";

fn row_to_message(row: &SqliteRow) -> RepositoryResult<Message> {
    let role: String = row.get("role");
    let parts: String = row.get("parts");
    let usage: Option<String> = row.get("usage");

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: Role::parse(&role).ok_or_else(|| RepositoryError::InvalidData {
            message: format!("unknown role '{role}'"),
        })?,
        content: row.get("content"),
        parts: serde_json::from_str(&parts)?,
        sequence: row.get("sequence"),
        created_at: row.get("created_at"),
        usage: usage.map(|u| serde_json::from_str(&u)).transpose()?,
    })
}

fn row_to_conversation(row: &SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        model_id: row.get("model_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_message_at: row.get("last_message_at"),
    }
}

impl TranscriptRepository for SqliteTranscriptRepository {
    fn save_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations
                    (id, owner_id, title, model_id, created_at, updated_at, last_message_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    title      = excluded.title,
                    model_id   = excluded.model_id,
                    updated_at = excluded.updated_at",
            )
            .bind(&conversation.id)
            .bind(&conversation.owner_id)
            .bind(&conversation.title)
            .bind(&conversation.model_id)
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .bind(conversation.last_message_at)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, owner_id, title, model_id, created_at, updated_at, last_message_at
                 FROM conversations
                 WHERE id = ?",
            )
            .bind(&id)
            .fetch_optional(&pool)
            .await?;
            Ok(row.as_ref().map(row_to_conversation))
        })
    }

    fn append(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, RepositoryResult<Message>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let parts = serde_json::to_string(&message.parts)?;
            let usage = message
                .usage
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let mut tx = pool.begin().await?;

            // Writing first takes the database write lock before the sequence is read.
            let touched = sqlx::query(
                "UPDATE conversations
                 SET last_message_at = MAX(COALESCE(last_message_at, 0), ?1),
                     updated_at      = ?2
                 WHERE id = ?3",
            )
            .bind(message.created_at)
            .bind(now_millis())
            .bind(&id)
            .execute(&mut *tx)
            .await?;

            if touched.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(RepositoryError::NotFound { id });
            }

            sqlx::query(
                "INSERT INTO messages
                    (id, conversation_id, role, content, parts, sequence, created_at, usage)
                 SELECT ?1, ?2, ?3, ?4, ?5, COALESCE(MAX(sequence), 0) + 1, ?6, ?7
                 FROM messages WHERE conversation_id = ?2
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&message.id)
            .bind(&id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&parts)
            .bind(message.created_at)
            .bind(&usage)
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
            ))
            .bind(&message.id)
            .fetch_one(&mut *tx)
            .await?;
            let stored = row_to_message(&row)?;

            tx.commit().await?;
            Ok(stored)
        })
    }

    fn list(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?
                 ORDER BY sequence ASC"
            ))
            .bind(&id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(row_to_message).collect()
        })
    }

    fn truncate_after(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> BoxFuture<'static, RepositoryResult<usize>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let result =
                sqlx::query("DELETE FROM messages WHERE conversation_id = ? AND sequence > ?")
                    .bind(&id)
                    .bind(sequence)
                    .execute(&pool)
                    .await?;
            Ok(result.rows_affected() as usize)
        })
    }

    fn update_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        let title = title.to_string();
        Box::pin(async move {
            let result =
                sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
                    .bind(&title)
                    .bind(now_millis())
                    .bind(&id)
                    .execute(&pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound { id });
            }
            Ok(())
        })
    }

    fn delete(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }
}
