pub mod chat_service;
pub mod generation_worker;
pub mod provider;
pub mod rig_provider;
pub mod scripted_provider;

pub use chat_service::{ChatService, GenerationRequest, GenerationTicket};
pub use generation_worker::{
    ActiveGenerations, GenerationClaim, GenerationHandle, GenerationJob, GenerationState,
    GenerationWorker,
};
pub use provider::{CompletionRequest, ModelCatalog, ModelProvider, ProviderEvent, ProviderStream};
pub use rig_provider::RigProvider;
pub use scripted_provider::{ScriptStep, ScriptedProvider};
