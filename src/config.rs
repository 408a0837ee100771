use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::time::Duration;

use crate::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub cors_allow_origin: Option<String>,
}

/// Process-wide stream tuning, applied uniformly to every supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Cap on MJPEG emission rate per viewer, in frames per second.
    #[serde(default = "default_fps_limit")]
    pub fps_limit: u32,
    /// JPEG quality (1-100) used when encoding snapshots.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Per-candidate timeout when opening an RTSP session.
    #[serde(default = "default_connect_timeout", with = "humantime_duration")]
    pub connect_timeout: Duration,
    /// Bound on waiting for the next decoded frame.
    #[serde(default = "default_read_timeout", with = "humantime_duration")]
    pub read_timeout: Duration,
    /// Delay between reconnect cycles.
    #[serde(default = "default_reconnect_delay", with = "humantime_duration")]
    pub reconnect_delay: Duration,
    /// Reconnect cycles before giving up. 0 means retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Consecutive read failures tolerated before the camera is marked
    /// disconnected and the session is torn down.
    #[serde(default = "default_disconnect_threshold")]
    pub disconnect_threshold: u32,
    /// Decoder-side frame buffering. 1 keeps latency minimal.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// RTSP transport handed to the decoder ("tcp" or "udp").
    #[serde(default = "default_transport")]
    pub transport: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// SQLite connection string for the camera credential store.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Seed the registry with sample cameras when it is empty.
    #[serde(default)]
    pub seed: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_fps_limit() -> u32 {
    15
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_reconnect_delay() -> Duration {
    Duration::from_secs(3)
}
fn default_disconnect_threshold() -> u32 {
    3
}
fn default_buffer_size() -> usize {
    1
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_database_url() -> String {
    "sqlite://cameras.db?mode=rwc".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allow_origin: Some("*".to_string()),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps_limit: default_fps_limit(),
            jpeg_quality: default_jpeg_quality(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_attempts: 0,
            disconnect_threshold: default_disconnect_threshold(),
            buffer_size: default_buffer_size(),
            transport: default_transport(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            seed: false,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)
                .map_err(|e| crate::errors::GatewayError::config(e.to_string()))?
        };
        Ok(config)
    }
}

/// Durations in config files are written as humantime strings ("3s", "500ms").
mod humantime_duration {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.stream.fps_limit, 15);
        assert_eq!(config.stream.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.stream.max_reconnect_attempts, 0);
        assert_eq!(config.stream.disconnect_threshold, 3);
        assert_eq!(config.stream.buffer_size, 1);
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            r#"
[server]
host = "127.0.0.1"
port = 9000

[stream]
fps_limit = 10
reconnect_delay = "1s"
max_reconnect_attempts = 5

[registry]
database_url = "sqlite::memory:"
seed = true
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.stream.fps_limit, 10);
        assert_eq!(config.stream.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.stream.max_reconnect_attempts, 5);
        // Unset fields fall back to defaults
        assert_eq!(config.stream.jpeg_quality, 80);
        assert!(config.registry.seed);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("definitely-not-here.toml").is_err());
    }
}
