use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SyncError};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Accounts to start at launch
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

/// Comm health tracker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Rolling window over which access outcomes are kept
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Samples needed before a server can leave OK
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Success ratio at or above which a server is OK
    #[serde(default = "default_ok_threshold")]
    pub ok_threshold: f64,

    /// Success ratio at or above which a server is Degraded (below is Unusable)
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,

    /// Token bucket capacity per server
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,

    /// Seconds for a fully drained bucket to refill
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Background re-evaluation period
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// Wire codec tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Payloads larger than this many bytes are spooled to temporary storage
    #[serde(default = "default_spool_threshold")]
    pub spool_threshold: usize,
}

/// Protocol engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How often a folder sync is scheduled when nothing else is pending
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Retry delay after a transient failure when the server gave no hint
    #[serde(default = "default_backoff_secs")]
    pub default_backoff_secs: u64,

    /// Transient failures a pending operation survives before it is failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// One mail account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable account identifier
    pub id: String,

    /// Email address
    pub email: String,

    pub server: Option<ServerConfig>,

    pub credentials: Option<CredentialConfig>,
}

/// Server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    pub secret: String,
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eddie.chat")
        .join("sync.db")
}

fn default_window_secs() -> u64 {
    180
}

fn default_min_samples() -> usize {
    4
}

fn default_ok_threshold() -> f64 {
    0.8
}

fn default_degraded_threshold() -> f64 {
    0.3
}

fn default_rate_capacity() -> u32 {
    30
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_spool_threshold() -> usize {
    crate::codec::DEFAULT_SPOOL_THRESHOLD
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_backoff_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    5
}

fn default_user_agent() -> String {
    format!("eddie-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_port() -> u16 {
    443
}

fn default_path() -> String {
    "/Microsoft-Server-ActiveSync".to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            min_samples: default_min_samples(),
            ok_threshold: default_ok_threshold(),
            degraded_threshold: default_degraded_threshold(),
            rate_capacity: default_rate_capacity(),
            rate_window_secs: default_rate_window_secs(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    /// Never zero, a zero period would panic the ticker
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Never zero, an empty bucket would defer every access forever
    pub fn rate_capacity(&self) -> u32 {
        self.rate_capacity.max(1)
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples.max(1)
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            spool_threshold: default_spool_threshold(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            default_backoff_secs: default_backoff_secs(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.default_backoff_secs)
    }
}

impl AppConfig {
    /// Load configuration from the first default path that exists,
    /// falling back to defaults when none does
    pub fn load() -> Result<Self> {
        for path in default_config_paths() {
            if path.exists() {
                info!("Found config at: {:?}", path);
                return Self::load_from_path(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;

        if config.health.degraded_threshold > config.health.ok_threshold {
            return Err(SyncError::Config(
                "health.degraded_threshold must not exceed health.ok_threshold".into(),
            ));
        }
        for (name, value) in [
            ("health.tick_ms", config.health.tick_ms),
            ("health.rate_capacity", config.health.rate_capacity as u64),
            ("health.min_samples", config.health.min_samples as u64),
        ] {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(config)
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("eddie.chat").join("sync.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("eddie.chat")
                .join("sync.toml"),
        );
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").expect("Failed to parse empty config");
        assert_eq!(config.health.window_secs, 180);
        assert_eq!(config.health.min_samples, 4);
        assert_eq!(config.codec.spool_threshold, 1024 * 1024);
        assert_eq!(config.engine.sync_interval(), Duration::from_secs(300));
        assert_eq!(config.engine.max_retries, 5);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_parse_accounts() {
        let toml = r#"
            [health]
            window_secs = 60

            [[accounts]]
            id = "work"
            email = "me@example.com"

            [accounts.server]
            host = "mail.example.com"

            [accounts.credentials]
            username = "me"
            secret = "hunter2"
        "#;

        let config = AppConfig::parse(toml).expect("Failed to parse config");
        assert_eq!(config.health.window_secs, 60);
        assert_eq!(config.health.ok_threshold, 0.8);
        assert_eq!(config.accounts.len(), 1);

        let server = config.accounts[0].server.as_ref().expect("server missing");
        assert_eq!(server.port, 443);
        assert_eq!(server.scheme, "https");
        assert_eq!(server.path, "/Microsoft-Server-ActiveSync");
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let toml = r#"
            [health]
            ok_threshold = 0.2
            degraded_threshold = 0.5
        "#;
        assert!(matches!(AppConfig::parse(toml), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_health_values() {
        for field in ["tick_ms", "rate_capacity", "min_samples"] {
            let toml = format!("[health]\n{} = 0\n", field);
            assert!(
                matches!(AppConfig::parse(&toml), Err(SyncError::Config(_))),
                "{} = 0 was accepted",
                field
            );
        }
    }

    #[test]
    fn test_health_accessors_clamp_zero() {
        let health = HealthConfig {
            tick_ms: 0,
            rate_capacity: 0,
            min_samples: 0,
            ..HealthConfig::default()
        };
        assert_eq!(health.tick(), Duration::from_millis(1));
        assert_eq!(health.rate_capacity(), 1);
        assert_eq!(health.min_samples(), 1);
    }
}
