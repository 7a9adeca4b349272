//! Configuration loading for meshsync.
//!
//! Configuration is loaded from a TOML file (default: `meshsync.toml`).
//! Every section and field may be omitted; missing values use the defaults
//! below.

use std::path::PathBuf;
use std::time::Duration;

use mesh_core::BackoffPolicy;
use mesh_types::Position;
use serde::Deserialize;

/// Root configuration for the engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Radio device configuration.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Link supervisor configuration.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Registry and decoder configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Notification fan-out configuration.
    #[serde(default)]
    pub fanout: FanoutConfig,
    /// Manual location used for distances when the local node has no fix.
    #[serde(default)]
    pub location: LocationConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Node pruning task configuration.
    #[serde(default)]
    pub prune: PruneConfig,
}

/// Radio device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Transport-specific address (serial port, host:port, BLE id).
    #[serde(default = "default_device_address")]
    pub address: String,
    /// Connect as soon as the engine starts (default: true).
    #[serde(default = "default_autoconnect")]
    pub autoconnect: bool,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Seconds between store health probes while writes are rejected
    /// (default: 5).
    #[serde(default = "default_store_retry_secs")]
    pub store_retry_secs: u64,
    /// Keep a history of every accepted and transmitted packet next to the
    /// registry tables (default: true).
    #[serde(default = "default_packet_log")]
    pub packet_log: bool,
}

/// Link supervisor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// First reconnect delay in milliseconds (default: 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Reconnect delay cap in milliseconds (default: 30000).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Upper bound of the random delay added to each reconnect
    /// (default: 1000).
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
    /// Connect plus handshake deadline in milliseconds (default: 10000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Heartbeat period in milliseconds (default: 30000).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silent heartbeat periods before the link counts as degraded
    /// (default: 3).
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,
    /// Deadline for a single frame write in milliseconds (default: 5000).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long a command may wait in the queue before it fails, in
    /// milliseconds (default: 300000 = 5 minutes).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Deadline for the resync request after connecting, in milliseconds
    /// (default: 30000).
    #[serde(default = "default_resync_timeout_ms")]
    pub resync_timeout_ms: u64,
    /// Maximum queued outgoing commands (default: 256).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Registry and decoder configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Capacity of the mutation request queue (default: 1024).
    #[serde(default = "default_mutation_queue")]
    pub mutation_queue: usize,
    /// Seconds a (source, sequence) pair is remembered for duplicate
    /// suppression (default: 600).
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Maximum remembered (source, sequence) pairs (default: 4096).
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

/// Notification fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Pending notifications kept per subscriber before the oldest is
    /// dropped (default: 256).
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

/// Manual location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationConfig {
    /// Latitude in degrees.
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    pub longitude: Option<f64>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset (default: "info").
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Include the log target in output (default: true).
    #[serde(default = "default_log_target")]
    pub with_target: bool,
}

/// Node pruning task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PruneConfig {
    /// Enable the pruning task (default: true).
    #[serde(default = "default_prune_enabled")]
    pub enabled: bool,
    /// Pruning interval in seconds (default: 3600 = 1 hour).
    #[serde(default = "default_prune_interval")]
    pub interval_secs: u64,
    /// Nodes silent for longer than this many days are removed
    /// (default: 30).
    #[serde(default = "default_node_max_age_days")]
    pub node_max_age_days: u64,
}

// Default value functions
fn default_device_address() -> String {
    "serial:///dev/ttyUSB0".to_string()
}

fn default_autoconnect() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("org", "meshsync", "meshsync")
        .map(|dirs| dirs.data_dir().join("mesh.db"))
        .unwrap_or_else(|| PathBuf::from("mesh.db"))
}

fn default_store_retry_secs() -> u64 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_packet_log() -> bool {
    true
}

fn default_heartbeat_miss_threshold() -> u32 {
    3
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_resync_timeout_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_mutation_queue() -> usize {
    1024
}

fn default_dedup_window_secs() -> u64 {
    600 // 10 minutes
}

fn default_dedup_capacity() -> usize {
    4096
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_log_target() -> bool {
    true
}

fn default_prune_enabled() -> bool {
    true
}

fn default_prune_interval() -> u64 {
    3600 // 1 hour
}

fn default_node_max_age_days() -> u64 {
    30
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: default_device_address(),
            autoconnect: default_autoconnect(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            store_retry_secs: default_store_retry_secs(),
            packet_log: default_packet_log(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            send_timeout_ms: default_send_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            resync_timeout_ms: default_resync_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mutation_queue: default_mutation_queue(),
            dedup_window_secs: default_dedup_window_secs(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            with_target: default_log_target(),
        }
    }
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: default_prune_enabled(),
            interval_secs: default_prune_interval(),
            node_max_age_days: default_node_max_age_days(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl StorageConfig {
    /// Interval between health probes of a failed store.
    pub fn store_retry(&self) -> Duration {
        Duration::from_secs(self.store_retry_secs.max(1))
    }
}

impl SupervisorConfig {
    /// Reconnect backoff policy.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }

    /// Connect deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Heartbeat period (never zero).
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Frame write deadline.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Queue wait deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Resync request deadline.
    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }
}

impl RegistryConfig {
    /// Duplicate suppression window.
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

impl LocationConfig {
    /// The manual origin, when both coordinates are set and in range.
    pub fn origin(&self) -> Option<Position> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon))
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) =>
            {
                Some(Position::new(lat, lon))
            }
            _ => None,
        }
    }
}

impl PruneConfig {
    /// Age past which a silent node is removed.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.node_max_age_days * 24 * 60 * 60)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.device.autoconnect);
        assert_eq!(config.supervisor.backoff_base_ms, 1000);
        assert_eq!(config.supervisor.backoff_max_ms, 30_000);
        assert_eq!(config.supervisor.heartbeat_miss_threshold, 3);
        assert_eq!(config.registry.dedup_window_secs, 600);
        assert_eq!(config.prune.node_max_age_days, 30);
        assert!(config.storage.database.ends_with("mesh.db"));
        assert!(config.storage.packet_log);
        assert!(config.location.origin().is_none());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[device]
address = "tcp://192.168.1.20:4403"
autoconnect = false

[storage]
database = "/data/mesh.db"
packet_log = false

[supervisor]
backoff_base_ms = 500
send_timeout_ms = 2000

[fanout]
subscriber_capacity = 16

[location]
latitude = 51.5074
longitude = -0.1278

[prune]
interval_secs = 600
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.device.address, "tcp://192.168.1.20:4403");
        assert!(!config.device.autoconnect);
        assert_eq!(config.storage.database, PathBuf::from("/data/mesh.db"));
        assert!(!config.storage.packet_log);
        assert_eq!(config.supervisor.backoff_base_ms, 500);
        assert_eq!(config.supervisor.send_timeout(), Duration::from_secs(2));
        assert_eq!(config.fanout.subscriber_capacity, 16);
        assert_eq!(
            config.location.origin(),
            Some(Position::new(51.5074, -0.1278))
        );
        assert_eq!(config.prune.interval_secs, 600);
    }

    #[test]
    fn config_missing_fields_use_defaults() {
        let toml = r#"
[supervisor]
heartbeat_interval_ms = 1000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.supervisor.heartbeat_interval_ms, 1000);
        assert_eq!(config.supervisor.backoff_max_ms, 30_000);
        assert_eq!(config.supervisor.queue_capacity, 256);
        assert_eq!(config.registry.dedup_capacity, 4096);
        assert_eq!(config.logging.filter, "info");
        assert!(config.prune.enabled);
    }

    #[test]
    fn empty_file_is_the_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.device.address, default_device_address());
        assert_eq!(config.storage.store_retry(), Duration::from_secs(5));
    }

    #[test]
    fn location_needs_both_coordinates_in_range() {
        let half = LocationConfig {
            latitude: Some(10.0),
            longitude: None,
        };
        assert!(half.origin().is_none());

        let out_of_range = LocationConfig {
            latitude: Some(95.0),
            longitude: Some(10.0),
        };
        assert!(out_of_range.origin().is_none());
    }

    #[test]
    fn backoff_policy_uses_configured_bounds() {
        let config = SupervisorConfig {
            backoff_jitter_ms: 0,
            ..SupervisorConfig::default()
        };
        let backoff = config.backoff();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/meshsync.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshsync.toml");
        std::fs::write(&path, "[device\naddress = ").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
