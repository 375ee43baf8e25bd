//! Configuration management

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::model::{GLOWConfig, GLOWModel};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Network shape and coupling settings
    pub model: GLOWConfig,
    /// Temperature used when sampling from the model
    pub temperature: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: GLOWConfig::default(),
            temperature: 1.0,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.model.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Create config for a given window shape
    pub fn for_window(window_length: usize, channel_size: usize) -> Self {
        Self {
            model: GLOWConfig {
                window_length,
                channel_size,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Build an unprimed model from this configuration
    pub fn build_model(&self) -> anyhow::Result<GLOWModel> {
        Ok(GLOWModel::new(self.model.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.model.factor_size, 2);
        assert!(config.build_model().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let config = Config::for_window(32, 6);

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(config, loaded);
        assert_eq!(loaded.build_model().unwrap().latent_size(), 32 * 6);
    }

    #[test]
    fn test_config_load_rejects_invalid_model() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.model.window_length = 30;
        write!(temp_file, "{}", serde_json::to_string(&config).unwrap()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
    }
}
