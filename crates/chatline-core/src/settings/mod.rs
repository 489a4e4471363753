pub mod engine_settings;
pub mod provider_config;
pub mod settings_repository;

pub use engine_settings::{EngineSettings, ResumePolicy};
pub use provider_config::{ModelConfig, ProviderConfig, ProviderType};
pub use settings_repository::{
    ChatlineSettings, JsonSettingsRepository, SettingsError, SettingsRepository, SettingsResult,
};
