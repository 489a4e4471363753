use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::models::now_millis;
use crate::repositories::{BoxFuture, RepositoryError, SqliteTranscriptRepository};

/// Write-once record that a generation attempt was started for a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle {
    pub stream_id: String,
    pub conversation_id: String,
    /// `None` for guest sessions.
    pub owner_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum StreamStoreError {
    #[error("Stream {stream_id} is already recorded for another conversation or owner")]
    Conflict {
        stream_id: String,
        conversation_id: String,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<sqlx::Error> for StreamStoreError {
    fn from(err: sqlx::Error) -> Self {
        StreamStoreError::Repository(RepositoryError::DatabaseError(err))
    }
}

pub type StreamStoreResult<T> = Result<T, StreamStoreError>;

/// Durable mapping from a conversation to the stream handles started for it.
///
/// Handles are never updated or deleted here. Recording the same stream id
/// again for the same conversation and owner returns the stored handle.
pub trait StreamStore: Send + Sync + 'static {
    fn record(
        &self,
        conversation_id: &str,
        stream_id: &str,
        owner_id: Option<&str>,
    ) -> BoxFuture<'static, StreamStoreResult<StreamHandle>>;

    /// Handles for a conversation, newest first
    fn list_handles(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StreamStoreResult<Vec<StreamHandle>>>;

    fn latest_handle(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StreamStoreResult<Option<StreamHandle>>> {
        let handles = self.list_handles(conversation_id);
        Box::pin(async move { Ok(handles.await?.into_iter().next()) })
    }
}

fn check_same_owner(
    existing: StreamHandle,
    conversation_id: &str,
    owner_id: Option<&str>,
) -> StreamStoreResult<StreamHandle> {
    if existing.conversation_id == conversation_id && existing.owner_id.as_deref() == owner_id {
        Ok(existing)
    } else {
        Err(StreamStoreError::Conflict {
            stream_id: existing.stream_id,
            conversation_id: conversation_id.to_string(),
        })
    }
}

/// In-memory stream store for tests and guest sessions
#[derive(Clone, Default)]
pub struct InMemoryStreamStore {
    // Insertion order doubles as creation order.
    handles: Arc<Mutex<Vec<StreamHandle>>>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamStore for InMemoryStreamStore {
    fn record(
        &self,
        conversation_id: &str,
        stream_id: &str,
        owner_id: Option<&str>,
    ) -> BoxFuture<'static, StreamStoreResult<StreamHandle>> {
        let mut handles = self.handles.lock();
        let result = match handles.iter().find(|h| h.stream_id == stream_id) {
            Some(existing) => check_same_owner(existing.clone(), conversation_id, owner_id),
            None => {
                let handle = StreamHandle {
                    stream_id: stream_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    owner_id: owner_id.map(str::to_string),
                    created_at: now_millis(),
                };
                handles.push(handle.clone());
                Ok(handle)
            }
        };
        Box::pin(async move { result })
    }

    fn list_handles(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StreamStoreResult<Vec<StreamHandle>>> {
        let handles: Vec<StreamHandle> = self
            .handles
            .lock()
            .iter()
            .rev()
            .filter(|h| h.conversation_id == conversation_id)
            .cloned()
            .collect();
        Box::pin(async move { Ok(handles) })
    }
}

/// Stream-handle table sharing the transcript database.
#[derive(Clone)]
pub struct SqliteStreamStore {
    pool: SqlitePool,
}

impl SqliteStreamStore {
    pub fn new(transcripts: &SqliteTranscriptRepository) -> Self {
        Self {
            pool: transcripts.pool().clone(),
        }
    }
}

impl StreamStore for SqliteStreamStore {
    fn record(
        &self,
        conversation_id: &str,
        stream_id: &str,
        owner_id: Option<&str>,
    ) -> BoxFuture<'static, StreamStoreResult<StreamHandle>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        let stream_id = stream_id.to_string();
        let owner_id = owner_id.map(str::to_string);
        Box::pin(async move {
            let inserted = sqlx::query(
                "INSERT INTO stream_handles (stream_id, conversation_id, owner_id, created_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(stream_id) DO NOTHING",
            )
            .bind(&stream_id)
            .bind(&conversation_id)
            .bind(&owner_id)
            .bind(now_millis())
            .execute(&pool)
            .await?;

            let row = sqlx::query(
                "SELECT stream_id, conversation_id, owner_id, created_at
                 FROM stream_handles WHERE stream_id = ?",
            )
            .bind(&stream_id)
            .fetch_one(&pool)
            .await?;
            let existing = StreamHandle {
                stream_id: row.get("stream_id"),
                conversation_id: row.get("conversation_id"),
                owner_id: row.get("owner_id"),
                created_at: row.get("created_at"),
            };

            if inserted.rows_affected() == 0 {
                debug!(stream_id = %stream_id, "Stream handle already recorded");
            }
            check_same_owner(existing, &conversation_id, owner_id.as_deref())
        })
    }

    fn list_handles(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StreamStoreResult<Vec<StreamHandle>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT stream_id, conversation_id, owner_id, created_at
                 FROM stream_handles
                 WHERE conversation_id = ?
                 ORDER BY created_at DESC, rowid DESC",
            )
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;

            Ok(rows
                .iter()
                .map(|row| StreamHandle {
                    stream_id: row.get("stream_id"),
                    conversation_id: row.get("conversation_id"),
                    owner_id: row.get("owner_id"),
                    created_at: row.get("created_at"),
                })
                .collect())
        })
    }
}
