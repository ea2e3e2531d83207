use super::Config;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    pub async fn load(config_path: &str) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .await
            .map_err(|e| anyhow!("Failed to read config {}: {}", config_path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", config_path, e))?;

        debug!("Loaded configuration from {}", config_path);

        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            current_config: Arc::new(config),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current_config.clone()
    }
}
