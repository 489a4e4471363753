use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{RepositoryError, RepositoryResult};
use super::transcript_repository::{BoxFuture, TranscriptRepository};
use crate::models::{Conversation, Message, now_millis};

#[derive(Default)]
struct Transcripts {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
}

/// In-memory transcript repository
/// Useful for testing and offline sessions
#[derive(Clone, Default)]
pub struct InMemoryTranscriptRepository {
    inner: Arc<Mutex<Transcripts>>,
}

impl InMemoryTranscriptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TranscriptRepository for InMemoryTranscriptRepository {
    fn save_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut store = inner.lock();
            store
                .conversations
                .insert(conversation.id.clone(), conversation);
            Ok(())
        })
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        Box::pin(async move { Ok(inner.lock().conversations.get(&id).cloned()) })
    }

    fn append(
        &self,
        conversation_id: &str,
        mut message: Message,
    ) -> BoxFuture<'static, RepositoryResult<Message>> {
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let mut store = inner.lock();
            let Transcripts {
                conversations,
                messages,
            } = &mut *store;

            let conversation = conversations
                .get_mut(&id)
                .ok_or_else(|| RepositoryError::NotFound { id: id.clone() })?;
            let history = messages.entry(id.clone()).or_default();

            if let Some(existing) = history.iter().find(|m| m.id == message.id) {
                return Ok(existing.clone());
            }

            let last = history.last().map(|m| m.sequence).unwrap_or(0);
            message.conversation_id = id;
            message.sequence = last + 1;
            conversation.last_message_at = Some(message.created_at);
            conversation.updated_at = now_millis();
            history.push(message.clone());

            Ok(message)
        })
    }

    fn list(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            Ok(inner
                .lock()
                .messages
                .get(&id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn truncate_after(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> BoxFuture<'static, RepositoryResult<usize>> {
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let mut store = inner.lock();
            let Some(history) = store.messages.get_mut(&id) else {
                return Ok(0);
            };
            let before = history.len();
            history.retain(|m| m.sequence <= sequence);
            Ok(before - history.len())
        })
    }

    fn update_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        let title = title.to_string();
        Box::pin(async move {
            let mut store = inner.lock();
            let conversation = store
                .conversations
                .get_mut(&id)
                .ok_or(RepositoryError::NotFound { id })?;
            conversation.title = title;
            conversation.updated_at = now_millis();
            Ok(())
        })
    }

    fn delete(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        Box::pin(async move {
            let mut store = inner.lock();
            store.conversations.remove(&id);
            store.messages.remove(&id);
            Ok(())
        })
    }
}
