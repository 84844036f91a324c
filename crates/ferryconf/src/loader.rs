//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, FerryConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/ferryman/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("ferryman/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("ferryman.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table_from_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load a single config file, with defaults for everything it leaves out.
pub fn load_from_file(path: &Path) -> Result<FerryConfig, ConfigError> {
    let table = load_table_from_file(path)?;
    from_table(table, path)
}

/// Deserialize a (possibly merged) table into a config.
///
/// `origin` only labels errors.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<FerryConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`. Nested tables merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, incoming);
                    continue;
                }
                base.insert(key, toml::Value::Table(incoming));
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut FerryConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup. Values that fail to parse are
/// ignored and not recorded.
pub fn apply_overrides_from<F>(config: &mut FerryConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("FERRYMAN_CHANNELS") {
        if let Ok(channels) = v.trim().parse() {
            config.relay.channels = channels;
            sources.env_overrides.push("FERRYMAN_CHANNELS".to_string());
        }
    }
    if let Some(v) = lookup("FERRYMAN_CAPACITY_FACTOR") {
        if let Ok(factor) = v.trim().parse() {
            config.relay.capacity_factor = factor;
            sources.env_overrides.push("FERRYMAN_CAPACITY_FACTOR".to_string());
        }
    }
    if let Some(v) = lookup("FERRYMAN_CLIENT_NAME") {
        config.relay.client_name = v;
        sources.env_overrides.push("FERRYMAN_CLIENT_NAME".to_string());
    }

    // Empty device means "server default"
    if let Some(v) = lookup("FERRYMAN_PLAYBACK_DEVICE") {
        config.streams.playback_device = non_empty(v);
        sources.env_overrides.push("FERRYMAN_PLAYBACK_DEVICE".to_string());
    }
    if let Some(v) = lookup("FERRYMAN_CAPTURE_DEVICE") {
        config.streams.capture_device = non_empty(v);
        sources.env_overrides.push("FERRYMAN_CAPTURE_DEVICE".to_string());
    }

    if let Some(v) = lookup("FERRYMAN_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("FERRYMAN_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins over our own variable
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_cli_path_is_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "").unwrap();

        let files = discover_config_files_with_override(Some(&path));
        assert_eq!(files.last(), Some(&path));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[relay]
channels = 6
"#;
        let table = parse_table(toml, Path::new("test.toml")).unwrap();
        let config = from_table(table, Path::new("test.toml")).unwrap();
        assert_eq!(config.relay.channels, 6);
        // Other values should be defaults
        assert_eq!(config.relay.capacity_factor, 3);
        assert_eq!(config.streams.monitor_name, "ferryman monitor");
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_table("[relay\nchannels = 2", Path::new("broken.toml")).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, PathBuf::from("broken.toml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let table = parse_table("[relay]\nchannels = \"two\"", Path::new("t.toml")).unwrap();
        assert!(matches!(
            from_table(table, Path::new("t.toml")),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_from_file(Path::new("/nonexistent/ferryman.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_merge_keeps_untouched_keys() {
        let mut base = parse_table(
            r#"
[relay]
channels = 4
client_name = "system"

[streams]
playback_device = "hdmi"
"#,
            Path::new("system.toml"),
        )
        .unwrap();
        let overlay = parse_table(
            r#"
[relay]
client_name = "studio"
"#,
            Path::new("local.toml"),
        )
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = from_table(base, Path::new("<merged>")).unwrap();

        assert_eq!(config.relay.channels, 4);
        assert_eq!(config.relay.client_name, "studio");
        assert_eq!(config.streams.playback_device.as_deref(), Some("hdmi"));
    }

    #[test]
    fn test_env_overrides_are_recorded() {
        let mut config = FerryConfig::default();
        let mut sources = ConfigSources::default();
        let lookup = lookup_from(&[
            ("FERRYMAN_CHANNELS", "1"),
            ("FERRYMAN_CAPTURE_DEVICE", "usb-mic"),
            ("FERRYMAN_LOG_LEVEL", "debug"),
        ]);

        apply_overrides_from(&mut config, &mut sources, lookup);

        assert_eq!(config.relay.channels, 1);
        assert_eq!(config.streams.capture_device.as_deref(), Some("usb-mic"));
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(
            sources.env_overrides,
            vec!["FERRYMAN_CHANNELS", "FERRYMAN_CAPTURE_DEVICE", "FERRYMAN_LOG_LEVEL"]
        );
    }

    #[test]
    fn test_unparseable_env_override_is_ignored() {
        let mut config = FerryConfig::default();
        let mut sources = ConfigSources::default();

        apply_overrides_from(
            &mut config,
            &mut sources,
            lookup_from(&[("FERRYMAN_CAPACITY_FACTOR", "lots")]),
        );

        assert_eq!(config.relay.capacity_factor, 3);
        assert!(sources.env_overrides.is_empty());
    }

    #[test]
    fn test_empty_device_override_clears_device() {
        let mut config = FerryConfig::default();
        config.streams.playback_device = Some("hdmi".into());
        let mut sources = ConfigSources::default();

        apply_overrides_from(
            &mut config,
            &mut sources,
            lookup_from(&[("FERRYMAN_PLAYBACK_DEVICE", "")]),
        );

        assert_eq!(config.streams.playback_device, None);
    }

    #[test]
    fn test_rust_log_wins() {
        let mut config = FerryConfig::default();
        let mut sources = ConfigSources::default();

        apply_overrides_from(
            &mut config,
            &mut sources,
            lookup_from(&[("FERRYMAN_LOG_LEVEL", "debug"), ("RUST_LOG", "ferryman=trace")]),
        );

        assert_eq!(config.telemetry.log_level, "ferryman=trace");
    }
}
