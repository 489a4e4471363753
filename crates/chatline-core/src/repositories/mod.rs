pub mod backing_store;
pub mod error;
pub mod guest_repository;
pub mod in_memory_repository;
pub mod sqlite_repository;
pub mod transcript_repository;

pub use backing_store::{DualBackingStore, SessionAuth};
pub use error::{RepositoryError, RepositoryResult};
pub use guest_repository::{GuestTranscript, GuestTranscriptRepository};
pub use in_memory_repository::InMemoryTranscriptRepository;
pub use sqlite_repository::SqliteTranscriptRepository;
pub use transcript_repository::{BoxFuture, TranscriptRepository};
