use std::path::Path;
use tokio::fs;
use tracing::debug;

use super::SchemaFlowConfig;
use crate::error::{ErrorCode, Result, SchemaFlowError};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Read `path`, apply environment overrides and validate
    pub async fn load(path: &Path) -> Result<SchemaFlowConfig> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_NOT_FOUND,
                format!("cannot read {}", path.display()),
            )
            .with_source(e)
        })?;
        let mut config = Self::parse(&content)
            .map_err(|e| e.with_context(format!("in {}", path.display())))?;
        config.merge_env_vars();
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Like `load`, falling back to defaults when the file does not exist
    pub async fn load_or_default(path: &Path) -> Result<SchemaFlowConfig> {
        if fs::try_exists(path).await.unwrap_or(false) {
            return Self::load(path).await;
        }
        debug!("No configuration at {}, using defaults", path.display());
        let mut config = SchemaFlowConfig::default();
        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without environment overrides
    pub fn parse(content: &str) -> Result<SchemaFlowConfig> {
        toml::from_str(content).map_err(|e| {
            SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_PARSE_ERROR,
                format!("invalid configuration: {}", e.message()),
            )
        })
    }
}
