pub mod location_tool;
pub mod web_search_tool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rig::completion::ToolDefinition;
use thiserror::Error;

pub use location_tool::{LocationDecision, LocationTool};
pub use web_search_tool::{
    HttpSearchProvider, SearchImage, SearchProvider, SearchResult, SearchResults, WebSearchTool,
};

/// Whether the worker may run a tool on its own or must ask the human first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolPolicy {
    Automatic,
    /// The generation suspends until `resolve_tool` supplies the result.
    RequiresConfirmation,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Tool {0} requires a human decision")]
    NeedsConfirmation(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    fn policy(&self) -> ToolPolicy {
        ToolPolicy::Automatic
    }

    /// Run the tool. Only called for `Automatic` tools.
    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Normalize a human-supplied result for a confirmation tool.
    fn accept_decision(&self, decision: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Ok(decision)
    }
}

/// Tools offered to the model, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn ToolHandler>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    /// Definitions sorted by name so requests are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
