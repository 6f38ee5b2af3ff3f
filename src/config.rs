//! Application configuration
//!
//! Loaded from TOML; every section falls back to its defaults when absent.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub buffer: BufferConfig,
    pub batching: BatchConfig,
    pub auto_pause: AutoPauseConfig,
}

/// Broadcaster and HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub http_port: u16,
    /// Viewers and producers must present this token when set
    pub token: Option<String>,
    /// Entries retained per room for `init` and backfill
    pub history_per_room: usize,
    /// Samples retained per stream channel
    pub stream_history: usize,
    pub viewer_queue_capacity: usize,
    /// Optional directory of static UI assets served at `/`
    pub static_dir: Option<PathBuf>,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            token: None,
            history_per_room: DEFAULT_SERVER_HISTORY,
            stream_history: DEFAULT_STREAM_MAX_ENTRIES,
            viewer_queue_capacity: VIEWER_QUEUE_CAPACITY,
            static_dir: None,
            cors: true,
        }
    }
}

/// Viewer transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:7070/ws`
    pub server_url: String,
    pub token: Option<String>,
    pub room: String,
    pub reconnect_delay_ms: u64,
    pub pause_settle_ms: u64,
    pub backfill_limit: usize,
    pub stream_backfill_limit: usize,
    /// Ping period for latency measurement; 0 disables pings
    pub ping_interval_ms: u64,
    /// Where persisted subscription state lives
    pub state_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{}/ws", DEFAULT_HTTP_PORT),
            token: None,
            room: DEFAULT_ROOM.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            pause_settle_ms: DEFAULT_PAUSE_SETTLE_MS,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            stream_backfill_limit: 1_000,
            ping_interval_ms: 5_000,
            state_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn pause_settle(&self) -> Duration {
        Duration::from_millis(self.pause_settle_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    /// State directory, falling back to the platform data dir
    pub fn resolved_state_dir(&self) -> Option<PathBuf> {
        self.state_dir
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().to_path_buf()))
    }
}

/// Client buffer capacities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_entries: usize,
    pub stream_max_entries: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_BUFFER_ENTRIES,
            stream_max_entries: DEFAULT_STREAM_MAX_ENTRIES,
        }
    }
}

/// Flush scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub min_flush_interval_ms: u64,
    pub frame_interval_ms: u64,
    /// Caps watch delivery to one update per name per period
    pub watch_throttle_ms: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_flush_interval_ms: DEFAULT_MIN_FLUSH_INTERVAL_MS,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            watch_throttle_ms: None,
        }
    }
}

impl BatchConfig {
    pub fn min_flush_interval(&self) -> Duration {
        Duration::from_millis(self.min_flush_interval_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn watch_throttle(&self) -> Option<Duration> {
        self.watch_throttle_ms.map(Duration::from_millis)
    }
}

/// Rate-based channel auto-pause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPauseConfig {
    pub enabled: bool,
    /// Sustained entries per second that counts as a breach
    pub threshold_per_sec: f64,
    pub grace_period_ms: u64,
    pub tick_ms: u64,
    /// Number of rate samples averaged
    pub window: usize,
    /// Controller stays idle below this many active channels
    pub min_active_channels: usize,
}

impl Default for AutoPauseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_per_sec: 200.0,
            grace_period_ms: 2_000,
            tick_ms: DEFAULT_AUTO_PAUSE_TICK_MS,
            window: DEFAULT_AUTO_PAUSE_WINDOW,
            min_active_channels: 2,
        }
    }
}

impl AutoPauseConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "live-log-viewer", "live-log-viewer")
}

impl AppConfig {
    /// Platform config file location
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location; a missing file yields defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match path {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::from_toml(&std::fs::read_to_string(&path)?)?
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `LOGVIEW_*` overrides from the given lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("LOGVIEW_TOKEN").filter(|t| !t.is_empty()) {
            self.server.token = Some(token.clone());
            self.client.token = Some(token);
        }
        if let Some(bind) = lookup("LOGVIEW_BIND") {
            self.server.bind_address = bind;
        }
        if let Some(url) = lookup("LOGVIEW_URL") {
            self.client.server_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer.max_entries",
                reason: "must be greater than zero".into(),
            });
        }
        if self.buffer.stream_max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer.stream_max_entries",
                reason: "must be greater than zero".into(),
            });
        }
        if self.server.viewer_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "server.viewer_queue_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        if !(self.auto_pause.threshold_per_sec > 0.0) {
            return Err(ConfigError::Invalid {
                field: "auto_pause.threshold_per_sec",
                reason: format!("{} is not a positive rate", self.auto_pause.threshold_per_sec),
            });
        }
        if self.auto_pause.tick_ms == 0 || self.auto_pause.window == 0 {
            return Err(ConfigError::Invalid {
                field: "auto_pause",
                reason: "tick_ms and window must be greater than zero".into(),
            });
        }
        if self.batching.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "batching.frame_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.auto_pause.tick(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [buffer]
            max_entries = 500

            [auto_pause]
            threshold_per_sec = 100.0
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.max_entries, 500);
        assert_eq!(config.buffer.stream_max_entries, DEFAULT_STREAM_MAX_ENTRIES);
        assert_eq!(config.auto_pause.threshold_per_sec, 100.0);
        assert_eq!(config.auto_pause.grace_period_ms, 2_000);
        assert_eq!(config.server.http_port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = AppConfig::default();
        config.buffer.max_entries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "buffer.max_entries", .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_overrides(|key| match key {
            "LOGVIEW_TOKEN" => Some("s3cret".to_string()),
            "LOGVIEW_BIND" => Some("127.0.0.1".to_string()),
            _ => None,
        });

        assert_eq!(config.server.token.as_deref(), Some("s3cret"));
        assert_eq!(config.client.token.as_deref(), Some("s3cret"));
        assert_eq!(config.server.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.buffer, BufferConfig::default());
    }
}
