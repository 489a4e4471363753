use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::ChatResult;
use crate::models::Message;
use crate::repositories::{DualBackingStore, TranscriptRepository};
use crate::services::{ChatService, GenerationRequest, GenerationTicket};
use crate::streams::{StreamEvent, StreamHandle, StreamStatus};

/// What a session controller needs from the server side.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Guest sessions keep state locally and never resume across reloads.
    fn is_guest(&self) -> bool;

    /// User turns a guest may store; `None` when uncapped.
    fn message_cap(&self) -> Option<usize>;

    async fn can_add_message(&self) -> ChatResult<bool>;

    async fn start_generation(&self, request: GenerationRequest) -> ChatResult<GenerationTicket>;

    fn subscribe(
        &self,
        stream_id: &str,
        from_offset: usize,
    ) -> ChatResult<BoxStream<'static, StreamEvent>>;

    fn stream_status(&self, stream_id: &str) -> Option<StreamStatus>;

    async fn latest_stream(&self, conversation_id: &str) -> ChatResult<Option<StreamHandle>>;

    async fn resolve_tool(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        result: serde_json::Value,
    ) -> ChatResult<()>;

    async fn cancel(&self, conversation_id: &str) -> ChatResult<()>;

    /// Persisted transcript, ordered by sequence.
    async fn load_messages(&self, conversation_id: &str) -> ChatResult<Vec<Message>>;
}

/// In-process backend: a `ChatService` bound to one session's backing store.
#[derive(Clone)]
pub struct LocalBackend {
    service: ChatService,
    store: DualBackingStore,
}

impl LocalBackend {
    pub fn new(service: ChatService, store: DualBackingStore) -> Self {
        Self { service, store }
    }

    pub fn service(&self) -> &ChatService {
        &self.service
    }

    pub fn store(&self) -> &DualBackingStore {
        &self.store
    }
}

#[async_trait]
impl ChatBackend for LocalBackend {
    fn is_guest(&self) -> bool {
        self.store.is_guest()
    }

    fn message_cap(&self) -> Option<usize> {
        match &self.store {
            DualBackingStore::Guest(guest) => Some(guest.cap()),
            DualBackingStore::Authenticated { .. } => None,
        }
    }

    async fn can_add_message(&self) -> ChatResult<bool> {
        Ok(self.store.can_add_message().await?)
    }

    async fn start_generation(&self, request: GenerationRequest) -> ChatResult<GenerationTicket> {
        self.service.start_generation(request, &self.store).await
    }

    fn subscribe(
        &self,
        stream_id: &str,
        from_offset: usize,
    ) -> ChatResult<BoxStream<'static, StreamEvent>> {
        self.service.subscribe(stream_id, from_offset)
    }

    fn stream_status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.service.stream_status(stream_id)
    }

    async fn latest_stream(&self, conversation_id: &str) -> ChatResult<Option<StreamHandle>> {
        self.service.latest_handle(conversation_id, &self.store).await
    }

    async fn resolve_tool(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        result: serde_json::Value,
    ) -> ChatResult<()> {
        self.service
            .resolve_tool(conversation_id, tool_call_id, result)
            .await
    }

    async fn cancel(&self, conversation_id: &str) -> ChatResult<()> {
        self.service.cancel(conversation_id).await;
        Ok(())
    }

    async fn load_messages(&self, conversation_id: &str) -> ChatResult<Vec<Message>> {
        Ok(self.store.list(conversation_id).await?)
    }
}
