use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::engine_settings::EngineSettings;
use super::provider_config::{ModelConfig, ProviderConfig};
use crate::repositories::BoxFuture;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Path error: {0}")]
    PathError(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Everything persisted in the settings file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatlineSettings {
    pub engine: EngineSettings,
    pub providers: Vec<ProviderConfig>,
    pub models: Vec<ModelConfig>,
}

impl ChatlineSettings {
    pub fn provider(&self, model: &ModelConfig) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.provider_type == model.provider_type)
    }
}

pub trait SettingsRepository: Send + Sync + 'static {
    /// Load settings; a missing file yields the defaults
    fn load(&self) -> BoxFuture<'static, SettingsResult<ChatlineSettings>>;

    fn save(&self, settings: ChatlineSettings) -> BoxFuture<'static, SettingsResult<()>>;
}

pub struct JsonSettingsRepository {
    file_path: PathBuf,
}

impl JsonSettingsRepository {
    /// Repository at `<config>/chatline/settings.json`
    pub fn new() -> SettingsResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::PathError("Cannot determine config directory".into()))?;

        Ok(Self {
            file_path: config_dir.join("chatline").join("settings.json"),
        })
    }

    /// Create repository with custom path (for testing)
    pub fn with_path(file_path: PathBuf) -> Self {
        Self { file_path }
    }
}

impl SettingsRepository for JsonSettingsRepository {
    fn load(&self) -> BoxFuture<'static, SettingsResult<ChatlineSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            // First run
            if !path.exists() {
                return Ok(ChatlineSettings::default());
            }

            let contents = tokio::fs::read_to_string(&path).await?;
            Ok(serde_json::from_str(&contents)?)
        })
    }

    fn save(&self, settings: ChatlineSettings) -> BoxFuture<'static, SettingsResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let json = serde_json::to_string_pretty(&settings)?;

            // Write atomically using temp file + rename
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, json).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            Ok(())
        })
    }
}
