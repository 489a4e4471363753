use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rig::completion::ToolDefinition;

use crate::errors::{ChatError, ChatResult};
use crate::models::{FinishReason, Message, TokenUsage};
use crate::settings::ModelConfig;

/// One streamed item from a model provider.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// Partial tool-call arguments; `args_delta` is a raw JSON fragment.
    ToolCallDelta {
        tool_call_id: String,
        tool_name: String,
        args_delta: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    Finish {
        reason: FinishReason,
        usage: Option<TokenUsage>,
    },
}

pub type ProviderStream = BoxStream<'static, ChatResult<ProviderEvent>>;

/// A streaming completion call.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: ModelConfig,
    /// Ordered transcript, ending with the turn the model should answer.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `ChatError::Credential` when no usable key is available.
    fn check_credentials(&self) -> ChatResult<()>;

    async fn stream(&self, request: CompletionRequest) -> ChatResult<ProviderStream>;
}

/// Known models and the provider that serves each.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, (ModelConfig, Arc<dyn ModelProvider>)>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: ModelConfig, provider: Arc<dyn ModelProvider>) {
        self.models.insert(model.id.clone(), (model, provider));
    }

    pub fn with(mut self, model: ModelConfig, provider: Arc<dyn ModelProvider>) -> Self {
        self.register(model, provider);
        self
    }

    pub fn resolve(&self, model_id: &str) -> ChatResult<(ModelConfig, Arc<dyn ModelProvider>)> {
        self.models
            .get(model_id)
            .map(|(model, provider)| (model.clone(), provider.clone()))
            .ok_or_else(|| ChatError::Validation(format!("unknown model '{model_id}'")))
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
