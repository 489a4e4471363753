use thiserror::Error;

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Repository initialization failed: {message}")]
    InitializationError { message: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Invalid stored data: {message}")]
    InvalidData { message: String },

    #[error("Conversation not found: {id}")]
    NotFound { id: String },

    #[error("Guest message limit of {cap} reached")]
    LimitReached { cap: usize },

    #[error("Invalid conversation id: {id:?}")]
    InvalidConversationId { id: String },
}

impl From<tokio::task::JoinError> for RepositoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        RepositoryError::IoError(std::io::Error::other(err))
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
