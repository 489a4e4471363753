use std::sync::Arc;

use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use super::generation_worker::{
    ActiveGenerations, GenerationJob, GenerationState, GenerationWorker,
};
use super::provider::ModelCatalog;
use crate::errors::{ChatError, ChatResult};
use crate::models::{Conversation, Message, Role, derive_title};
use crate::repositories::{DualBackingStore, TranscriptRepository};
use crate::settings::EngineSettings;
use crate::streams::{StreamBroker, StreamEvent, StreamHandle, StreamStatus, StreamStore};
use crate::tools::ToolRegistry;

/// A request to start a generation in a conversation.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub model_id: String,
    /// The new user turn. `None` regenerates the reply to the last user message.
    pub user_message: Option<Message>,
}

impl GenerationRequest {
    pub fn submit(conversation_id: impl Into<String>, model_id: impl Into<String>, message: Message) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            user_message: Some(message),
        }
    }

    pub fn retry(conversation_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            user_message: None,
        }
    }
}

/// Returned once a generation has been accepted and its stream opened.
#[derive(Clone, Debug)]
pub struct GenerationTicket {
    pub stream_id: String,
    /// The user turn the generation answers, as persisted.
    pub user_message: Message,
    pub assistant_message_id: String,
}

/// Server-side facade: accepts generations, owns the broker and the set of
/// running workers, and routes tool decisions and cancellation to them.
#[derive(Clone)]
pub struct ChatService {
    catalog: ModelCatalog,
    tools: ToolRegistry,
    broker: StreamBroker,
    stream_store: Arc<dyn StreamStore>,
    active: ActiveGenerations,
    settings: EngineSettings,
}

impl ChatService {
    pub fn new(
        catalog: ModelCatalog,
        tools: ToolRegistry,
        stream_store: Arc<dyn StreamStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            tools,
            broker: StreamBroker::new(settings.broker_grace_period()),
            stream_store,
            active: ActiveGenerations::new(),
            settings,
        }
    }

    pub fn broker(&self) -> &StreamBroker {
        &self.broker
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Validate, persist the user turn, record a stream handle and spawn the worker.
    pub async fn start_generation(
        &self,
        request: GenerationRequest,
        store: &DualBackingStore,
    ) -> ChatResult<GenerationTicket> {
        let conversation_id = request.conversation_id.as_str();
        if conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("conversation id is empty".into()));
        }
        if let Some(message) = &request.user_message {
            if message.role != Role::User {
                return Err(ChatError::Validation(format!(
                    "expected a user message, got {}",
                    message.role.as_str()
                )));
            }
            if message.content.trim().is_empty() {
                return Err(ChatError::Validation("message is empty".into()));
            }
        }

        let (model, provider) = self.catalog.resolve(&request.model_id)?;
        provider.check_credentials()?;

        // Held until the worker finishes; failures below release it.
        let claim = self.active.claim(conversation_id)?;

        if request.user_message.is_some() && !store.can_add_message().await? {
            let cap = match store {
                DualBackingStore::Guest(guest) => guest.cap(),
                DualBackingStore::Authenticated { .. } => self.settings.guest_message_cap,
            };
            return Err(ChatError::LimitReached { cap });
        }

        let conversation = self
            .prepare_conversation(&request, store)
            .await?;

        let user_message = match request.user_message {
            Some(message) => store.append(conversation_id, message).await?,
            None => self.rewind_to_last_user_turn(conversation_id, store).await?,
        };

        let history = store.list(conversation_id).await?;
        if history.is_empty() {
            return Err(ChatError::Validation("conversation has no messages".into()));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        self.stream_store
            .record(conversation_id, &stream_id, store.owner_id())
            .await?;
        let producer = self.broker.open(&stream_id)?;

        let assistant_message_id = uuid::Uuid::new_v4().to_string();
        let job = GenerationJob {
            conversation_id: conversation.id.clone(),
            assistant_message_id: assistant_message_id.clone(),
            history,
            model,
            provider,
            tools: self.tools.clone(),
            store: store.clone(),
            settings: self.settings.clone(),
        };
        GenerationWorker::spawn(job, producer, claim);

        info!(
            conversation_id,
            stream_id = %stream_id,
            model_id = %request.model_id,
            guest = store.is_guest(),
            "Generation started"
        );

        Ok(GenerationTicket {
            stream_id,
            user_message,
            assistant_message_id,
        })
    }

    async fn prepare_conversation(
        &self,
        request: &GenerationRequest,
        store: &DualBackingStore,
    ) -> ChatResult<Conversation> {
        let existing = store.load_conversation(&request.conversation_id).await?;

        match (existing, &request.user_message) {
            (Some(conversation), _) => {
                if conversation.owner_id.as_deref() != store.owner_id() {
                    warn!(
                        conversation_id = %request.conversation_id,
                        "Conversation belongs to another owner"
                    );
                    return Err(ChatError::NotFound(request.conversation_id.clone()));
                }
                if conversation.model_id != request.model_id {
                    let mut updated = conversation.clone();
                    updated.model_id = request.model_id.clone();
                    store.save_conversation(updated.clone()).await?;
                    return Ok(updated);
                }
                Ok(conversation)
            }
            (None, Some(first)) => {
                let mut conversation = Conversation::new(
                    request.conversation_id.clone(),
                    store.owner_id().map(str::to_string),
                    request.model_id.clone(),
                );
                conversation.title = derive_title(&first.content);
                store.save_conversation(conversation.clone()).await?;
                debug!(conversation_id = %conversation.id, title = %conversation.title, "Created conversation");
                Ok(conversation)
            }
            (None, None) => Err(ChatError::NotFound(request.conversation_id.clone())),
        }
    }

    /// Drop everything after the last user message so its reply can be regenerated.
    async fn rewind_to_last_user_turn(
        &self,
        conversation_id: &str,
        store: &DualBackingStore,
    ) -> ChatResult<Message> {
        let messages = store.list(conversation_id).await?;
        let last_user = messages
            .into_iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| ChatError::Validation("no user message to retry".into()))?;

        let removed = store.truncate_after(conversation_id, last_user.sequence).await?;
        debug!(conversation_id, removed, "Rewound conversation for retry");
        Ok(last_user)
    }

    /// Deliver a human decision to the conversation's suspended generation.
    pub async fn resolve_tool(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        result: serde_json::Value,
    ) -> ChatResult<()> {
        let handle = self
            .active
            .get(conversation_id)
            .ok_or_else(|| ChatError::ToolDelivery {
                tool_call_id: tool_call_id.to_string(),
                message: "no generation is running for this conversation".into(),
            })?;
        handle.resolve_tool(tool_call_id, result).await
    }

    /// Cancel the conversation's generation and wait until it has persisted
    /// its partial content. Returns false when nothing was running.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let Some(handle) = self.active.get(conversation_id) else {
            debug!(conversation_id, "No active generation to cancel");
            return false;
        };
        info!(conversation_id, stream_id = %handle.stream_id, "Cancelling generation");
        handle.cancel().await;
        handle.finished().await;
        true
    }

    pub fn subscribe(
        &self,
        stream_id: &str,
        from_offset: usize,
    ) -> ChatResult<BoxStream<'static, StreamEvent>> {
        Ok(self.broker.subscribe(stream_id, from_offset)?)
    }

    /// `None` once the broker has evicted (or never knew) the stream.
    pub fn stream_status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.broker.status(stream_id)
    }

    /// Newest stream handle of a conversation owned by the session's user.
    /// Guest sessions never resume, so they get `None`.
    pub async fn latest_handle(
        &self,
        conversation_id: &str,
        store: &DualBackingStore,
    ) -> ChatResult<Option<StreamHandle>> {
        if store.is_guest() {
            return Ok(None);
        }
        let handle = self.stream_store.latest_handle(conversation_id).await?;
        Ok(handle.filter(|h| h.owner_id.as_deref() == store.owner_id()))
    }

    pub fn generation_state(&self, conversation_id: &str) -> Option<GenerationState> {
        self.active.get(conversation_id).map(|h| h.state())
    }

    /// Wait for the conversation's running generation, if any, to finish.
    pub async fn wait_for_generation(&self, conversation_id: &str) -> Option<GenerationState> {
        let handle = self.active.get(conversation_id)?;
        Some(handle.finished().await)
    }
}
