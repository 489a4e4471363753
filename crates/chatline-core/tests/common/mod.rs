#![allow(dead_code)]

use std::sync::Arc;

use chatline_core::client::{ClientSessionController, LocalBackend};
use chatline_core::repositories::{
    DualBackingStore, GuestTranscriptRepository, InMemoryTranscriptRepository,
    SqliteTranscriptRepository,
};
use chatline_core::services::{ChatService, ModelCatalog, ScriptedProvider};
use chatline_core::settings::{EngineSettings, ModelConfig, ProviderType};
use chatline_core::streams::{InMemoryStreamStore, SqliteStreamStore, StreamStore};
use chatline_core::tools::{LocationTool, ToolRegistry};

pub const MODEL: &str = "M";

pub struct Harness {
    pub service: ChatService,
    pub store: DualBackingStore,
    pub backend: Arc<LocalBackend>,
    pub settings: EngineSettings,
}

impl Harness {
    /// Signed-in user backed by an in-memory SQLite database.
    pub async fn authenticated(provider: ScriptedProvider) -> Self {
        let repository = SqliteTranscriptRepository::in_memory().await.unwrap();
        let stream_store = Arc::new(SqliteStreamStore::new(&repository));
        let store = DualBackingStore::Authenticated {
            user_id: "user-1".into(),
            repository: Arc::new(repository),
        };
        Self::build(provider, store, stream_store)
    }

    /// Signed-in user on in-memory stores; safe under a paused clock.
    pub fn in_memory(provider: ScriptedProvider) -> Self {
        let store = DualBackingStore::Authenticated {
            user_id: "user-1".into(),
            repository: Arc::new(InMemoryTranscriptRepository::new()),
        };
        Self::build(provider, store, Arc::new(InMemoryStreamStore::new()))
    }

    pub fn guest(provider: ScriptedProvider, dir: &std::path::Path, cap: usize) -> Self {
        let store = DualBackingStore::Guest(Arc::new(GuestTranscriptRepository::new(
            dir.to_path_buf(),
            cap,
        )));
        Self::build(provider, store, Arc::new(InMemoryStreamStore::new()))
    }

    fn build(
        provider: ScriptedProvider,
        store: DualBackingStore,
        stream_store: Arc<dyn StreamStore>,
    ) -> Self {
        let settings = EngineSettings::default();
        let catalog = ModelCatalog::new().with(
            ModelConfig::new(MODEL, "Model M", ProviderType::Ollama, "m"),
            Arc::new(provider),
        );
        let tools = ToolRegistry::new().with(Arc::new(LocationTool::new()));
        let service = ChatService::new(catalog, tools, stream_store, settings.clone());
        let backend = Arc::new(LocalBackend::new(service.clone(), store.clone()));

        Self {
            service,
            store,
            backend,
            settings,
        }
    }

    pub fn session(&self, conversation_id: &str) -> ClientSessionController {
        ClientSessionController::new(self.backend.clone(), conversation_id, MODEL, &self.settings)
    }
}
