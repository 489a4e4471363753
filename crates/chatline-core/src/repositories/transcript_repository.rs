use std::future::Future;
use std::pin::Pin;

use super::error::RepositoryResult;
use crate::models::{Conversation, Message};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistence for conversations and their ordered messages.
///
/// `append` assigns the message's sequence number (`last + 1`) and updates the
/// conversation's `last_message_at` as one write. Appending a message whose id
/// is already stored returns the stored copy unchanged.
pub trait TranscriptRepository: Send + Sync + 'static {
    /// Insert or update conversation metadata
    fn save_conversation(&self, conversation: Conversation)
    -> BoxFuture<'static, RepositoryResult<()>>;

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>>;

    fn append(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, RepositoryResult<Message>>;

    /// Messages ordered by sequence number
    fn list(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>>;

    /// Remove every message with a sequence number above `sequence`, returning how many were removed
    fn truncate_after(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> BoxFuture<'static, RepositoryResult<usize>>;

    fn update_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Delete a conversation and its messages
    fn delete(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>>;
}
