//! Loading language configuration from YAML files.

use std::path::{Path, PathBuf};

use crate::errors::EngineError;

use super::types::LanguagesConfig;

const CONFIG_FILE_NAME: &str = "runlet.yaml";

/// Loads [`LanguagesConfig`] from the filesystem.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a configuration from a specific YAML file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<LanguagesConfig, EngineError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            EngineError::ConfigError(format!("failed to read {}: {}", path.display(), err))
        })?;
        let config: LanguagesConfig = serde_yaml::from_str(&raw).map_err(|err| {
            EngineError::ConfigError(format!("failed to parse {}: {}", path.display(), err))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the default configuration: `./runlet.yaml` if present, then the
    /// user config directory, falling back to the built-in profiles.
    pub async fn load_default() -> Result<LanguagesConfig, EngineError> {
        for candidate in Self::default_locations() {
            if candidate.exists() {
                log::info!("loading language config from {}", candidate.display());
                let loaded = Self::from_file(&candidate).await?;
                return Ok(loaded.merged_over_builtin());
            }
        }
        Ok(super::defaults::builtin_config())
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(config_dir) = dirs::config_dir() {
            locations.push(config_dir.join("runlet").join(CONFIG_FILE_NAME));
        }
        locations
    }
}
