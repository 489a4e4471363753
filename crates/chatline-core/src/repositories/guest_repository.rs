use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{RepositoryError, RepositoryResult};
use super::transcript_repository::{BoxFuture, TranscriptRepository};
use crate::models::{Conversation, Message, Role, now_millis};

/// A guest conversation and its messages, stored together in one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestTranscript {
    pub conversation: Conversation,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Client-local transcript store for unauthenticated sessions.
///
/// Each conversation is a JSON file in `dir`. The whole store is capped at
/// `cap` user-originated turns: once reached, appending a new user message
/// fails with `LimitReached` until a conversation is deleted. Assistant
/// replies are always accepted.
pub struct GuestTranscriptRepository {
    dir: PathBuf,
    cap: usize,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl GuestTranscriptRepository {
    pub fn new(dir: impl Into<PathBuf>, cap: usize) -> Self {
        Self {
            dir: dir.into(),
            cap,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Store under the platform data directory (`<data>/chatline/guest`).
    pub fn in_data_dir(cap: usize) -> RepositoryResult<Self> {
        let dir = dirs::data_local_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Could not determine local data directory".to_string(),
            })?
            .join("chatline")
            .join("guest");
        Ok(Self::new(dir, cap))
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of user-originated turns across every guest conversation.
    pub fn user_turns(&self) -> BoxFuture<'static, RepositoryResult<usize>> {
        let dir = self.dir.clone();
        Box::pin(async move { Ok(tokio::task::spawn_blocking(move || count_user_turns(&dir)).await??) })
    }

    /// Whether a new user turn would currently be accepted.
    pub fn can_add_message(&self) -> BoxFuture<'static, RepositoryResult<bool>> {
        let turns = self.user_turns();
        let cap = self.cap;
        Box::pin(async move { Ok(turns.await? < cap) })
    }

    /// One file per conversation, always directly inside `dir`.
    fn transcript_path(dir: &Path, conversation_id: &str) -> RepositoryResult<PathBuf> {
        let escapes = conversation_id.is_empty()
            || conversation_id.contains(['/', '\\', '\0'])
            || conversation_id.contains("..");
        if escapes {
            return Err(RepositoryError::InvalidConversationId {
                id: conversation_id.to_string(),
            });
        }
        Ok(dir.join(format!("{}.json", conversation_id)))
    }

    /// Read-modify-write of one transcript file under the store's write lock.
    fn modify<T, F>(&self, conversation_id: &str, f: F) -> BoxFuture<'static, RepositoryResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &mut Option<GuestTranscript>) -> RepositoryResult<T> + Send + 'static,
    {
        let dir = self.dir.clone();
        let path = Self::transcript_path(&self.dir, conversation_id);
        let lock = self.write_lock.clone();

        Box::pin(async move {
            let path = path?;
            let _guard = lock.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                let mut transcript = read_transcript(&path)?;
                let had_file = transcript.is_some();
                let out = f(&dir, &mut transcript)?;
                match transcript {
                    Some(t) => write_transcript(&dir, &path, &t)?,
                    None if had_file => std::fs::remove_file(&path)?,
                    None => {}
                }
                Ok(out)
            })
            .await?
        })
    }
}

fn read_transcript(path: &Path) -> RepositoryResult<Option<GuestTranscript>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn write_transcript(dir: &Path, path: &Path, transcript: &GuestTranscript) -> RepositoryResult<()> {
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(transcript)?;

    // Write to file atomically (write to temp, then rename)
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn count_user_turns(dir: &Path) -> RepositoryResult<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut turns = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Some(transcript) = read_transcript(&path)? {
            turns += transcript
                .messages
                .iter()
                .filter(|m| m.role == Role::User)
                .count();
        }
    }
    Ok(turns)
}

impl TranscriptRepository for GuestTranscriptRepository {
    fn save_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = conversation.id.clone();
        self.modify(&id, move |_, transcript| {
            match transcript {
                Some(t) => t.conversation = conversation,
                None => {
                    *transcript = Some(GuestTranscript {
                        conversation,
                        messages: Vec::new(),
                    })
                }
            }
            Ok(())
        })
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        let path = Self::transcript_path(&self.dir, conversation_id);
        Box::pin(async move {
            let path = path?;
            let transcript = tokio::task::spawn_blocking(move || read_transcript(&path)).await??;
            Ok(transcript.map(|t| t.conversation))
        })
    }

    fn append(
        &self,
        conversation_id: &str,
        mut message: Message,
    ) -> BoxFuture<'static, RepositoryResult<Message>> {
        let id = conversation_id.to_string();
        let cap = self.cap;
        self.modify(conversation_id, move |dir, transcript| {
            let t = transcript
                .as_mut()
                .ok_or_else(|| RepositoryError::NotFound { id: id.clone() })?;

            if let Some(existing) = t.messages.iter().find(|m| m.id == message.id) {
                return Ok(existing.clone());
            }

            if message.role == Role::User {
                let turns = count_user_turns(dir)?;
                if turns >= cap {
                    debug!(conversation_id = %id, turns, cap, "Guest message cap reached");
                    return Err(RepositoryError::LimitReached { cap });
                }
            }

            let last = t.messages.last().map(|m| m.sequence).unwrap_or(0);
            message.conversation_id = id;
            message.sequence = last + 1;
            t.conversation.last_message_at = Some(message.created_at);
            t.conversation.updated_at = now_millis();
            t.messages.push(message.clone());
            Ok(message)
        })
    }

    fn list(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let path = Self::transcript_path(&self.dir, conversation_id);
        Box::pin(async move {
            let path = path?;
            let transcript = tokio::task::spawn_blocking(move || read_transcript(&path)).await??;
            Ok(transcript.map(|t| t.messages).unwrap_or_default())
        })
    }

    fn truncate_after(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> BoxFuture<'static, RepositoryResult<usize>> {
        self.modify(conversation_id, move |_, transcript| {
            let Some(t) = transcript.as_mut() else {
                return Ok(0);
            };
            let before = t.messages.len();
            t.messages.retain(|m| m.sequence <= sequence);
            Ok(before - t.messages.len())
        })
    }

    fn update_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = conversation_id.to_string();
        let title = title.to_string();
        self.modify(conversation_id, move |_, transcript| {
            let t = transcript
                .as_mut()
                .ok_or(RepositoryError::NotFound { id })?;
            t.conversation.title = title;
            t.conversation.updated_at = now_millis();
            Ok(())
        })
    }

    fn delete(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        self.modify(conversation_id, |_, transcript| {
            *transcript = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn guest_repo(cap: usize) -> (tempfile::TempDir, GuestTranscriptRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GuestTranscriptRepository::new(dir.path().join("guest"), cap);
        (dir, repo)
    }

    async fn exchange(repo: &GuestTranscriptRepository, conv: &str, n: usize) {
        for i in 0..n {
            repo.append(conv, Message::user(conv, format!("q{i}")))
                .await
                .unwrap();
            repo.append(conv, Message::assistant(format!("{conv}-a{i}"), conv))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_files() {
        let (_tmp, repo) = guest_repo(10).await;
        repo.save_conversation(Conversation::new("g1", None, "m"))
            .await
            .unwrap();
        exchange(&repo, "g1", 1).await;

        let messages = repo.list("g1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(messages[1].sequence, 2);
        assert!(repo.load_conversation("g1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cap_rejects_new_user_turn_but_accepts_reply() {
        let (_tmp, repo) = guest_repo(2).await;
        repo.save_conversation(Conversation::new("g1", None, "m"))
            .await
            .unwrap();
        exchange(&repo, "g1", 1).await;

        // Second user turn is accepted; its reply must be too, even at the cap.
        repo.append("g1", Message::user("g1", "q-last"))
            .await
            .unwrap();
        assert!(!repo.can_add_message().await.unwrap());
        repo.append("g1", Message::assistant("reply", "g1"))
            .await
            .unwrap();

        let err = repo.append("g1", Message::user("g1", "one more")).await;
        assert!(matches!(err, Err(RepositoryError::LimitReached { cap: 2 })));
    }

    #[tokio::test]
    async fn test_cap_spans_conversations_and_delete_frees_budget() {
        let (_tmp, repo) = guest_repo(2).await;
        for id in ["g1", "g2"] {
            repo.save_conversation(Conversation::new(id, None, "m"))
                .await
                .unwrap();
        }
        exchange(&repo, "g1", 1).await;
        exchange(&repo, "g2", 1).await;
        assert!(!repo.can_add_message().await.unwrap());

        repo.delete("g1").await.unwrap();
        assert!(repo.can_add_message().await.unwrap());
        repo.append("g2", Message::user("g2", "again"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_title_of_missing_conversation() {
        let (_tmp, repo) = guest_repo(2).await;
        let err = repo.update_title("missing", "t").await;
        assert!(matches!(err, Err(RepositoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_rejects_ids_that_leave_the_store_directory() {
        let (tmp, repo) = guest_repo(5).await;
        let outside = Conversation::new("../outside", None, "m");

        let err = repo.save_conversation(outside).await;
        assert!(matches!(err, Err(RepositoryError::InvalidConversationId { .. })));
        for id in ["", "a/b", "..", "a\\b"] {
            assert!(matches!(
                repo.list(id).await,
                Err(RepositoryError::InvalidConversationId { .. })
            ));
        }
        assert!(!tmp.path().join("outside.json").exists());

        let chat: crate::ChatError = repo.delete("../guest").await.unwrap_err().into();
        assert!(matches!(chat, crate::ChatError::Validation(_)));
    }
}
