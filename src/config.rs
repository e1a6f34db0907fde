use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub venue: VenueConfig,
    pub proxy: ProxyConfig,
    pub stream: StreamConfig,
    pub window: WindowConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub snapshot: SnapshotConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    /// REST API root (market list and single-market quotes)
    pub rest_url: String,
    /// WebSocket endpoint for push quotes
    pub ws_url: String,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.prod.paradex.trade/v1".to_string(),
            ws_url: "wss://ws.api.prod.paradex.trade/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Flat proxy list, one `host:port[:user:pass]` per line.
    /// Missing file means direct mode.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Minimum gap between accepted streamed ticks per symbol
    pub throttle_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Pause between subscribe sends on a proxied connection
    pub subscribe_delay_ms: u64,
    /// Pause between subscribe sends on the single direct connection
    pub direct_subscribe_delay_ms: u64,
    /// Settle time after a connection opens, before subscribing
    pub post_connect_delay_ms: u64,
    pub connect_batch_size: usize,
    pub connect_batch_pause_ms: u64,
    pub ping_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 1_000,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            handshake_timeout_ms: 10_000,
            subscribe_delay_ms: 30,
            direct_subscribe_delay_ms: 100,
            post_connect_delay_ms: 300,
            connect_batch_size: 10,
            connect_batch_pause_ms: 500,
            ping_interval_secs: 30,
        }
    }
}

impl StreamConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub max_age_secs: u64,
    pub max_points: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 180,
            max_points: 180,
        }
    }
}

impl WindowConfig {
    pub fn max_age_ms(&self) -> i64 {
        (self.max_age_secs * 1_000) as i64
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    /// Candidate score at or above which a symbol is promoted to polling
    pub candidate_threshold: u32,
    pub analysis_duration_secs: u64,
    pub cooldown_secs: u64,
    pub request_timeout_ms: u64,
    /// Polled window size from which the polled source wins over the streamed one
    pub min_polled_points: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            candidate_threshold: 30,
            analysis_duration_secs: 60,
            cooldown_secs: 180,
            request_timeout_ms: 10_000,
            min_polled_points: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn analysis_duration_ms(&self) -> i64 {
        (self.analysis_duration_secs * 1_000) as i64
    }

    pub fn cooldown_ms(&self) -> i64 {
        (self.cooldown_secs * 1_000) as i64
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a monitoring session runs before it expires on its own
    pub duration_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { duration_secs: 900 }
    }
}

impl SessionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub path: PathBuf,
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("spread-data.json"),
            interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3002 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Directory for the rolling log file
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a config directory and the environment
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SPREADWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (SPREADWATCH_VENUE__WS_URL, etc.)
            .add_source(
                Environment::with_prefix("SPREADWATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_collector_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.stream.throttle_ms, 1_000);
        assert_eq!(cfg.stream.max_reconnect_attempts, 5);
        assert_eq!(cfg.window.max_points, 180);
        assert_eq!(cfg.window.max_age_ms(), 180_000);
        assert_eq!(cfg.scheduler.candidate_threshold, 30);
        assert_eq!(cfg.scheduler.analysis_duration_ms(), 60_000);
        assert_eq!(cfg.scheduler.cooldown_ms(), 180_000);
        assert_eq!(cfg.session.duration(), Duration::from_secs(900));
        assert!(cfg.proxy.file.is_none());
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let cfg = AppConfig::load_from("/nonexistent/spreadwatch-config").unwrap();
        assert_eq!(cfg.server.port, 3002);
        assert_eq!(cfg.venue.ws_url, "wss://ws.api.prod.paradex.trade/v1");
    }

    #[test]
    fn test_load_from_toml_overrides_section() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[scheduler]\ncandidate_threshold = 45\n\n[server]\nport = 9000\n",
        )
        .unwrap();

        let cfg = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(cfg.scheduler.candidate_threshold, 45);
        assert_eq!(cfg.scheduler.cooldown_secs, 180);
        assert_eq!(cfg.server.port, 9000);
    }
}
