//! Configuration loading for ferryman.
//!
//! Kept separate from the relay crate so that tools and tests can read the
//! same configuration without pulling in the realtime code.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. Compiled defaults
//! 2. `/etc/ferryman/config.toml` (system)
//! 3. `~/.config/ferryman/config.toml` (user)
//! 4. `./ferryman.toml` (local override) or an explicit path
//! 5. Environment variables (`FERRYMAN_*`)
//!
//! Files are merged table by table, so a local file only needs the keys it
//! changes.
//!
//! # Example Config
//!
//! ```toml
//! [relay]
//! channels = 2
//! capacity_factor = 3
//! client_name = "ferryman"
//!
//! [streams]
//! playback_name = "ferryman playback"
//! capture_name = "ferryman capture"
//! monitor_name = "ferryman monitor"
//! playback_device = "alsa_output.pci-0000_00_1f.3.analog-stereo"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{RelayConfig, StreamsConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to render configuration: {0}")]
    Render(String),
}

/// Complete ferryman configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FerryConfig {
    /// Ring sizing and engine client identity.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Audio server stream names and device targets.
    #[serde(default)]
    pub streams: StreamsConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl FerryConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./ferryman.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table_from_file(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.channels == 0 {
            return Err(ConfigError::Invalid("relay.channels must be at least 1".into()));
        }
        if self.relay.capacity_factor < 2 {
            return Err(ConfigError::Invalid(format!(
                "relay.capacity_factor must be at least 2, got {}",
                self.relay.capacity_factor
            )));
        }
        if self.relay.client_name.trim().is_empty() {
            return Err(ConfigError::Invalid("relay.client_name must not be empty".into()));
        }
        Ok(())
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))?;
        Ok(format!("# ferryman configuration\n\n{body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FerryConfig::default();
        assert_eq!(config.relay.channels, 2);
        assert_eq!(config.relay.capacity_factor, 3);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_roundtrips_sections() {
        let config = FerryConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[relay]"));
        assert!(rendered.contains("[streams]"));
        assert!(rendered.contains("[telemetry]"));

        let parsed: FerryConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_small_capacity_factor() {
        let mut config = FerryConfig::default();
        config.relay.capacity_factor = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("capacity_factor"));
    }

    #[test]
    fn test_validate_rejects_zero_channels() {
        let mut config = FerryConfig::default();
        config.relay.channels = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferryman.toml");
        std::fs::write(
            &path,
            r#"
[relay]
capacity_factor = 4

[streams]
playback_device = "speakers"
"#,
        )
        .unwrap();

        let (config, sources) = FerryConfig::load_with_sources_from(Some(&path)).unwrap();
        assert_eq!(config.relay.capacity_factor, 4);
        assert_eq!(config.relay.channels, 2);
        assert_eq!(config.streams.playback_device.as_deref(), Some("speakers"));
        assert!(sources.files.contains(&path));
    }
}
