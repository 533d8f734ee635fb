use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub signaling: SignalingConfig,
    pub mesh: MeshConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub server_url: String,
    pub room_id: String,
    pub reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub ice_servers: Vec<String>,
    /// Use the in-process mock signaling and memory transport
    pub test_mode: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://signaling.example.com".to_string(),
            room_id: "default".to_string(),
            reconnect_attempts: 5,
            reconnect_base_ms: 1000,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            test_mode: false,
        }
    }
}

/// Thresholds that flag a peer as a bottleneck
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckConfig {
    pub max_relay_count: u32,
    pub max_latency_ms: f64,
    pub min_upload_kbps: f64,
    pub min_download_kbps: f64,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            max_relay_count: 5,
            max_latency_ms: 500.0,
            min_upload_kbps: 200.0,
            min_download_kbps: 500.0,
        }
    }
}

/// Which accepted chunks a relay forwards downstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayPolicy {
    /// Forward every newly accepted chunk at once, delivered or not
    #[default]
    FloodAccepted,
    /// Consume only, never forward
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Candidates must relay to fewer peers than this
    pub max_relay_count: u32,
    /// Candidates must upload faster than this
    pub min_upload_kbps: f64,
    pub upstream_count: usize,
    pub monitoring_interval_secs: u64,
    pub bottleneck: BottleneckConfig,
    /// Frames queued per downstream before new ones are dropped
    pub outbound_queue_capacity: usize,
    pub relay_policy: RelayPolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_relay_count: 5,
            min_upload_kbps: 500.0,
            upstream_count: 2,
            monitoring_interval_secs: 10,
            bottleneck: BottleneckConfig::default(),
            outbound_queue_capacity: 256,
            relay_policy: RelayPolicy::FloodAccepted,
        }
    }
}

/// Encoding of chunks on relay channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    #[default]
    Binary,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub chunk_size: usize,
    /// Contiguous run length a relay waits for before delivering locally
    pub min_buffered_chunks: usize,
    pub frame_format: FrameFormat,
    pub mime_type: String,
    pub capture_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            min_buffered_chunks: 5,
            frame_format: FrameFormat::Binary,
            mime_type: "video/webm;codecs=vp8,opus".to_string(),
            capture_interval_ms: 100,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`MESHCAST_MESH__UPSTREAM_COUNT`, ...)
    /// 2. Config file
    /// 3. Default values
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Field names contain underscores, so nesting uses a double one
        builder = builder.add_source(
            Environment::with_prefix("MESHCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check values the mesh cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stream.chunk_size == 0 {
            errors.push("stream.chunk_size must be greater than zero".to_string());
        }
        if self.stream.min_buffered_chunks == 0 {
            errors.push("stream.min_buffered_chunks must be greater than zero".to_string());
        }
        if self.mesh.monitoring_interval_secs == 0 {
            errors.push("mesh.monitoring_interval_secs must be greater than zero".to_string());
        }
        if self.mesh.upstream_count == 0 {
            errors.push("mesh.upstream_count must be greater than zero".to_string());
        }
        if self.mesh.outbound_queue_capacity == 0 {
            errors.push("mesh.outbound_queue_capacity must be greater than zero".to_string());
        }
        if self.signaling.room_id.trim().is_empty() {
            errors.push("signaling.room_id must not be empty".to_string());
        }
        if !self.signaling.test_mode && self.signaling.server_url.trim().is_empty() {
            errors.push("signaling.server_url must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.mesh.max_relay_count, 5);
        assert_eq!(config.mesh.upstream_count, 2);
        assert_eq!(config.mesh.monitoring_interval_secs, 10);
        assert_eq!(config.mesh.relay_policy, RelayPolicy::FloodAccepted);
        assert_eq!(config.stream.chunk_size, 16384);
        assert_eq!(config.stream.min_buffered_chunks, 5);
        assert_eq!(config.signaling.reconnect_attempts, 5);
        assert_eq!(config.signaling.ice_servers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.stream.chunk_size = 0;
        config.mesh.upstream_count = 0;
        config.signaling.room_id = "  ".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("chunk_size")));
        assert!(errors.iter().any(|e| e.contains("room_id")));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[signaling]
room_id = "concert"
test_mode = true

[mesh]
upstream_count = 3

relay_policy = "disabled"

[mesh.bottleneck]
max_latency_ms = 250.0

[stream]
frame_format = "json"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.signaling.room_id, "concert");
        assert!(config.signaling.test_mode);
        assert_eq!(config.mesh.upstream_count, 3);
        assert_eq!(config.mesh.relay_policy, RelayPolicy::Disabled);
        assert!((config.mesh.bottleneck.max_latency_ms - 250.0).abs() < f64::EPSILON);
        assert_eq!(config.mesh.bottleneck.max_relay_count, 5);
        assert_eq!(config.stream.frame_format, FrameFormat::Json);
        assert_eq!(config.stream.chunk_size, 16384);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some("/nonexistent/meshcast.toml")).unwrap();
        assert_eq!(config.signaling.server_url, "wss://signaling.example.com");
    }
}
