use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(clippy::upper_case_acronyms)]
pub enum ProviderType {
    OpenAI,
    Anthropic,
    Gemini,
    Ollama,
}

impl ProviderType {
    pub fn display_name(&self) -> &str {
        match self {
            ProviderType::OpenAI => "OpenAI",
            ProviderType::Anthropic => "Anthropic",
            ProviderType::Gemini => "Google Gemini",
            ProviderType::Ollama => "Ollama",
        }
    }

    /// Environment variable consulted when no key is configured.
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self {
            ProviderType::OpenAI => Some("CHATLINE_OPENAI_API_KEY"),
            ProviderType::Anthropic => Some("CHATLINE_ANTHROPIC_API_KEY"),
            ProviderType::Gemini => Some("CHATLINE_GEMINI_API_KEY"),
            ProviderType::Ollama => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.api_key_env_var().is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub provider_type: ProviderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, provider_type: ProviderType) -> Self {
        Self {
            name: name.into(),
            provider_type,
            api_key: None,
            base_url: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Configured key, falling back to the provider's environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                self.provider_type
                    .api_key_env_var()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|key| !key.trim().is_empty())
            })
    }
}

fn default_temperature() -> f32 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub provider_type: ProviderType,
    pub model_identifier: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub preamble: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Hint passed to reasoning models ("low", "medium", "high")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Cost per million input tokens in USD (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_million_input_tokens: Option<f64>,
    /// Cost per million output tokens in USD (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_million_output_tokens: Option<f64>,
}

impl ModelConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider_type: ProviderType,
        model_identifier: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider_type,
            model_identifier: model_identifier.into(),
            temperature: default_temperature(),
            preamble: String::new(),
            max_tokens: None,
            reasoning_effort: None,
            cost_per_million_input_tokens: None,
            cost_per_million_output_tokens: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_key_wins() {
        let config = ProviderConfig::new("openai", ProviderType::OpenAI).with_api_key("sk-1");
        assert_eq!(config.resolved_api_key().as_deref(), Some("sk-1"));
    }

    #[test]
    fn test_blank_key_is_missing() {
        let config = ProviderConfig::new("ollama", ProviderType::Ollama).with_api_key("  ");
        assert_eq!(config.resolved_api_key(), None);
        assert!(!ProviderType::Ollama.requires_api_key());
    }

    #[test]
    fn test_model_config_defaults() {
        let value = serde_json::json!({
            "id": "gpt",
            "name": "GPT",
            "provider_type": ProviderType::OpenAI,
            "model_identifier": "gpt-4o",
        });
        let model: ModelConfig = serde_json::from_value(value).unwrap();
        assert_eq!(model.temperature, 1.0);
        assert!(model.preamble.is_empty());
        assert!(model.reasoning_effort.is_none());
    }
}
