use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::services::DEFAULT_MAX_TOOL_ITERATIONS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Path error: {0}")]
    PathError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Engine tunables, stored as JSON. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model_id: String,
    pub max_tool_iterations: usize,
    /// Notification coalescing window for streaming updates.
    pub frame_interval_ms: u64,
    pub placeholder_retry_delay_ms: u64,
    pub placeholder_max_retries: u32,
    pub title_max_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: "default".to_string(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            frame_interval_ms: 16,
            placeholder_retry_delay_ms: 1000,
            placeholder_max_retries: 10,
            title_max_chars: 60,
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::PathError("Cannot determine config directory".into()))?;
        Ok(config_dir.join("threadline").join("engine.json"))
    }

    /// Load from the platform config directory, falling back to defaults.
    pub async fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::default_path()?).await
    }

    pub async fn load_from(path: &Path) -> ConfigResult<Self> {
        if !tokio::fs::try_exists(path).await? {
            debug!(path = %path.display(), "No engine config found, using defaults");
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write atomically using a temp file and rename.
    pub async fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, path).await?;

        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}
