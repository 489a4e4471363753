use std::sync::Arc;

use super::error::RepositoryResult;
use super::guest_repository::GuestTranscriptRepository;
use super::transcript_repository::{BoxFuture, TranscriptRepository};
use crate::models::{Conversation, Message};

/// Authentication state of a session, fixed when the session starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionAuth {
    Guest,
    Authenticated { user_id: String },
}

impl SessionAuth {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            SessionAuth::Guest => None,
            SessionAuth::Authenticated { user_id } => Some(user_id),
        }
    }
}

/// Transcript store chosen once per session: the capped client-local guest
/// store, or the server-persisted store of an authenticated user.
#[derive(Clone)]
pub enum DualBackingStore {
    Guest(Arc<GuestTranscriptRepository>),
    Authenticated {
        user_id: String,
        repository: Arc<dyn TranscriptRepository>,
    },
}

impl DualBackingStore {
    pub fn select(
        auth: &SessionAuth,
        guest: Arc<GuestTranscriptRepository>,
        authenticated: Arc<dyn TranscriptRepository>,
    ) -> Self {
        match auth {
            SessionAuth::Guest => DualBackingStore::Guest(guest),
            SessionAuth::Authenticated { user_id } => DualBackingStore::Authenticated {
                user_id: user_id.clone(),
                repository: authenticated,
            },
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, DualBackingStore::Guest(_))
    }

    /// Owner recorded on conversations and stream handles; `None` for guests.
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            DualBackingStore::Guest(_) => None,
            DualBackingStore::Authenticated { user_id, .. } => Some(user_id),
        }
    }

    /// Whether a new user turn would be accepted. Always true when authenticated.
    pub fn can_add_message(&self) -> BoxFuture<'static, RepositoryResult<bool>> {
        match self {
            DualBackingStore::Guest(guest) => guest.can_add_message(),
            DualBackingStore::Authenticated { .. } => Box::pin(async { Ok(true) }),
        }
    }

    fn repository(&self) -> &dyn TranscriptRepository {
        match self {
            DualBackingStore::Guest(guest) => guest.as_ref(),
            DualBackingStore::Authenticated { repository, .. } => repository.as_ref(),
        }
    }
}

impl TranscriptRepository for DualBackingStore {
    fn save_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        self.repository().save_conversation(conversation)
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        self.repository().load_conversation(conversation_id)
    }

    fn append(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, RepositoryResult<Message>> {
        self.repository().append(conversation_id, message)
    }

    fn list(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        self.repository().list(conversation_id)
    }

    fn truncate_after(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> BoxFuture<'static, RepositoryResult<usize>> {
        self.repository().truncate_after(conversation_id, sequence)
    }

    fn update_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        self.repository().update_title(conversation_id, title)
    }

    fn delete(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        self.repository().delete(conversation_id)
    }
}
