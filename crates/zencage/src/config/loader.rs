//! Configuration file loading for Zencage
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unit.trim().is_empty() {
            return Err(ConfigError::Invalid("unit name is empty".to_string()));
        }
        if self.capacities.output == 0 {
            return Err(ConfigError::Invalid(
                "capacities.output must be greater than zero".to_string(),
            ));
        }
        if self.capacities.logs == 0 {
            return Err(ConfigError::Invalid(
                "capacities.logs must be greater than zero".to_string(),
            ));
        }
        if let Some(secs) = self.timeout
            && !(secs.is_finite() && secs > 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "timeout must be a positive number of seconds, got {secs}"
            )));
        }
        if let Some(ref path) = self.worker_path
            && path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid("worker_path is empty".to_string()));
        }

        Ok(())
    }
}
