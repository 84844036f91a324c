//! Config sections. Everything here is read once at session start.

use serde::{Deserialize, Serialize};

/// Ring sizing and graph client identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interleaved channels per endpoint.
    /// Default: 2
    #[serde(default = "RelayConfig::default_channels")]
    pub channels: u16,

    /// Ring capacity in periods. 2 is plain double buffering.
    /// Default: 3
    #[serde(default = "RelayConfig::default_capacity_factor")]
    pub capacity_factor: u32,

    /// Name registered with both the graph engine and the audio server.
    /// Default: ferryman
    #[serde(default = "RelayConfig::default_client_name")]
    pub client_name: String,
}

impl RelayConfig {
    fn default_channels() -> u16 {
        2
    }

    fn default_capacity_factor() -> u32 {
        3
    }

    fn default_client_name() -> String {
        "ferryman".to_string()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channels: Self::default_channels(),
            capacity_factor: Self::default_capacity_factor(),
            client_name: Self::default_client_name(),
        }
    }
}

/// Server stream names and device targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "StreamsConfig::default_playback_name")]
    pub playback_name: String,

    #[serde(default = "StreamsConfig::default_capture_name")]
    pub capture_name: String,

    #[serde(default = "StreamsConfig::default_monitor_name")]
    pub monitor_name: String,

    /// Sink to play into. None lets the server pick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_device: Option<String>,

    /// Source to record from. None lets the server pick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_device: Option<String>,
}

impl StreamsConfig {
    fn default_playback_name() -> String {
        "ferryman playback".to_string()
    }

    fn default_capture_name() -> String {
        "ferryman capture".to_string()
    }

    fn default_monitor_name() -> String {
        "ferryman monitor".to_string()
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            playback_name: Self::default_playback_name(),
            capture_name: Self::default_capture_name(),
            monitor_name: Self::default_monitor_name(),
            playback_device: None,
            capture_device: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or full `EnvFilter` directive.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
