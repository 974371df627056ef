//! Client settings.
//!
//! Layering, lowest precedence first:
//! 1. Built-in defaults (every field has one)
//! 2. Optional TOML file
//! 3. `SPACELINK__*` environment variables, `__` separating nested keys
//!    (`SPACELINK__POOL__MAX_CONNECTIONS=8`)
//!
//! `.env.local` and `.env` are loaded into the process environment first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use spacelink_domain::ServerConfig;

use crate::error::ClientError;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SPACELINK";

/// File name of the credential store inside the credentials directory
pub const CREDENTIALS_FILE: &str = "credentials.json";

// ============================================================================
// Connection Settings
// ============================================================================

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_close_timeout_ms() -> u64 {
    3_000
}
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    45_000
}
fn default_subscribe_timeout_ms() -> u64 {
    10_000
}
fn default_reducer_timeout_ms() -> u64 {
    5_000
}
fn default_outbound_buffer() -> usize {
    64
}

/// Per-connection timeouts and buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for the server to acknowledge a close frame
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence after which the connection is considered lost
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_reducer_timeout_ms")]
    pub reducer_timeout_ms: u64,
    /// Capacity of the outbound frame queue
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            reducer_timeout_ms: default_reducer_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn reducer_timeout(&self) -> Duration {
        Duration::from_millis(self.reducer_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than 0".to_string());
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            ));
        }
        if self.outbound_buffer == 0 {
            return Err("outbound_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Pool Settings
// ============================================================================

/// Exponential backoff for pool connect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor (0.0-1.0) applied around each delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_duration_ms() -> u64 {
    30_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
        }
    }
}

fn default_max_connections() -> usize {
    5
}
fn default_min_connections() -> usize {
    1
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Upper bound on checked-out plus connecting entries per key
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle entries the health loop keeps warm per key
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.min_connections > self.max_connections {
            return Err(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(format!(
                "retry.jitter_factor ({}) must be within 0.0-1.0",
                self.retry.jitter_factor
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline Settings
// ============================================================================

fn default_true() -> bool {
    true
}
fn default_pipeline_timeout_ms() -> u64 {
    2_000
}

/// Pipeline switches applied to every server; language and format come from
/// the server config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_true")]
    pub enable_validation: bool,
    #[serde(default = "default_true")]
    pub enable_protocol_adaptation: bool,
    #[serde(default)]
    pub enable_compression: bool,
    #[serde(default = "default_pipeline_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enable_validation: true,
            enable_protocol_adaptation: true,
            enable_compression: false,
            timeout_ms: default_pipeline_timeout_ms(),
        }
    }
}

// ============================================================================
// Client Settings
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Overrides the platform config directory
    #[serde(default)]
    pub credentials_dir: Option<PathBuf>,
}

impl ClientSettings {
    /// Load settings from `.env` files, an optional TOML file and the
    /// environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ClientError> {
        load_dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: ClientSettings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ClientError::configuration(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        self.pool.validate().map_err(ClientError::configuration)?;
        self.connection.validate().map_err(ClientError::configuration)?;
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }

    /// Where credentials are persisted.
    ///
    /// - Linux: ~/.config/spacelink/credentials.json
    /// - macOS: ~/Library/Application Support/dev.spacelink.spacelink/credentials.json
    /// - Windows: C:\Users\<User>\AppData\Roaming\spacelink\spacelink\config\credentials.json
    pub fn credentials_dir(&self) -> PathBuf {
        if let Some(dir) = &self.credentials_dir {
            return dir.clone();
        }
        match ProjectDirs::from("dev", "spacelink", "spacelink") {
            Some(dirs) => dirs.config_dir().to_path_buf(),
            // Fallback to current directory if project dirs unavailable
            None => PathBuf::from(".spacelink"),
        }
    }
}

/// Load `.env.local` then `.env` from the working directory, if present.
/// Values already in the environment win.
pub fn load_dotenv() {
    for filename in [".env.local", ".env"] {
        let path = Path::new(filename);
        if path.exists() {
            if let Err(e) = dotenvy::from_path(path) {
                tracing::warn!("Failed to load {}: {}", filename, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = ClientSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pool.max_connections, 5);
        assert_eq!(settings.connection.close_timeout(), Duration::from_secs(3));
        assert_eq!(settings.pool.retry.max_attempts, 4);
    }

    #[test]
    fn pool_rejects_min_above_max() {
        let pool = PoolSettings {
            min_connections: 6,
            ..PoolSettings::default()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let connection = ConnectionSettings {
            heartbeat_timeout_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            ..ConnectionSettings::default()
        };
        assert!(connection.validate().is_err());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            credentials_dir = "/tmp/spacelink-test"

            [pool]
            max_connections = 8
            min_connections = 2

            [pool.retry]
            base_delay_ms = 50

            [[servers]]
            language = "go"
            host = "localhost"
            port = 3001
            database = "arena"
            protocol = "bsatn"
            "#
        )
        .unwrap();

        let settings = ClientSettings::load(Some(file.path())).unwrap();

        assert_eq!(settings.pool.max_connections, 8);
        assert_eq!(settings.pool.retry.base_delay_ms, 50);
        assert_eq!(settings.pool.retry.max_attempts, 4);
        assert_eq!(settings.servers.len(), 1);
        assert_eq!(
            settings.servers[0].protocol(),
            spacelink_domain::WireProtocol::Binary
        );
        assert_eq!(
            settings.credentials_dir(),
            PathBuf::from("/tmp/spacelink-test")
        );
    }
}
