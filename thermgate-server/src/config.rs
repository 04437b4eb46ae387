//! Gateway configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via THERMGATE_CONFIG or --config)
//! 3. Environment variables

use crate::session::SensorIdPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thermgate_protocol::DEFAULT_PORT;
use thermgate_storage::QueueConfig;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listening socket.
    pub network: NetworkConfig,
    /// Per-address connection limits.
    pub admission: AdmissionConfig,
    /// Session lifetime and identifier policy.
    pub session: SessionConfig,
    /// Reading persistence.
    pub storage: StorageConfig,
    /// Server-side TLS.
    pub tls: TlsConfig,
    /// Client-side TLS for outbound links.
    pub client_tls: ClientTlsConfig,
    /// Synthetic reading generator.
    pub sampler: SamplerConfig,
    /// Temperature threshold monitor.
    pub monitor: MonitorConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Metrics endpoint.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from `path` (or THERMGATE_CONFIG when `None`),
    /// then applies environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("THERMGATE_CONFIG") {
                Ok(path) => Self::from_file(path)?,
                Err(_) => Self::default(),
            },
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.admission.apply_env_overrides();
        self.session.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.client_tls.apply_env_overrides();
        self.sampler.apply_env_overrides();
        self.monitor.apply_env_overrides();
        self.logging.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.port == 0 {
            return Err(ConfigError::ValidationError(
                "network.port must be between 1 and 65535".to_string(),
            ));
        }
        if self.admission.max_per_address == 0 {
            return Err(ConfigError::ValidationError(
                "admission.max_per_address must be at least 1".to_string(),
            ));
        }
        if self.storage.retry_limit == 0 {
            return Err(ConfigError::ValidationError(
                "storage.retry_limit must be at least 1".to_string(),
            ));
        }
        if self.sampler.min_celsius >= self.sampler.max_celsius {
            return Err(ConfigError::ValidationError(format!(
                "sampler range is empty: {}..{}",
                self.sampler.min_celsius, self.sampler.max_celsius
            )));
        }
        if self.monitor.history_size == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.history_size must be at least 1".to_string(),
            ));
        }
        self.tls.validate()
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind.
    pub bind_host: IpAddr,
    /// Listening port. Overridden by the command-line port.
    pub port: u16,
    /// Time allowed for the TLS handshake and handshake record. Unset means
    /// a link may take as long as it likes to identify itself.
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            handshake_timeout_secs: None,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(host) = env_parse("THERMGATE_BIND_HOST") {
            self.bind_host = host;
        }
        if let Some(port) = env_parse("THERMGATE_PORT") {
            self.port = port;
        }
        if let Some(secs) = env_parse::<u64>("THERMGATE_HANDSHAKE_TIMEOUT") {
            // 0 turns the limit off.
            self.handshake_timeout_secs = (secs > 0).then_some(secs);
        }
    }

    /// Returns the socket address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

/// Admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Live connections allowed from one address.
    pub max_per_address: u32,
    /// Distinct addresses the ledger can ever track.
    pub max_addresses: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_per_address: 5,
            max_addresses: 256,
        }
    }
}

impl AdmissionConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("THERMGATE_MAX_PER_ADDRESS") {
            self.max_per_address = n;
        }
        if let Some(n) = env_parse("THERMGATE_MAX_ADDRESSES") {
            self.max_addresses = n;
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is reaped.
    pub idle_timeout_secs: u64,
    /// Interval between reaper sweeps.
    pub reap_interval_secs: u64,
    /// How sensor identifiers are assigned.
    pub id_policy: SensorIdPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            reap_interval_secs: 5,
            id_policy: SensorIdPolicy::default(),
        }
    }
}

impl SessionConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_parse("THERMGATE_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("THERMGATE_REAP_INTERVAL") {
            self.reap_interval_secs = secs;
        }
        if let Ok(policy) = std::env::var("THERMGATE_ID_POLICY") {
            match policy.to_lowercase().as_str() {
                "monotonic" => self.id_policy = SensorIdPolicy::Monotonic,
                "reuse_slot" | "reuseslot" => self.id_policy = SensorIdPolicy::ReuseSlot,
                _ => {}
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Failed connection attempts tolerated before the gateway stops.
    pub retry_limit: u32,
    /// Wait between failed connection attempts, in seconds.
    pub retry_delay_secs: u64,
    /// Interval between drain cycles, in milliseconds.
    pub drain_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("sensor_data.db"),
            retry_limit: 3,
            retry_delay_secs: 5,
            drain_interval_ms: 1000,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("THERMGATE_DB") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(n) = env_parse("THERMGATE_DB_RETRY_LIMIT") {
            self.retry_limit = n;
        }
        if let Some(secs) = env_parse("THERMGATE_DB_RETRY_DELAY") {
            self.retry_delay_secs = secs;
        }
        if let Some(ms) = env_parse("THERMGATE_DRAIN_INTERVAL_MS") {
            self.drain_interval_ms = ms;
        }
    }

    /// Builds the storage queue configuration.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(&self.db_path)
            .with_retry_limit(self.retry_limit)
            .with_retry_delay(Duration::from_secs(self.retry_delay_secs))
            .with_drain_interval(Duration::from_millis(self.drain_interval_ms))
    }
}

/// Server-side TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Encrypt inbound links. When off, links use plain TCP.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    pub client_ca_path: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: Some(PathBuf::from("cert.pem")),
            key_path: Some(PathBuf::from("key.pem")),
            require_client_cert: false,
            client_ca_path: None,
        }
    }
}

impl TlsConfig {
    /// Plain TCP, no credentials.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            require_client_cert: false,
            client_ca_path: None,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("THERMGATE_TLS_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(path) = std::env::var("THERMGATE_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("THERMGATE_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(require) = env_flag("THERMGATE_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = require;
        }
        if let Ok(path) = std::env::var("THERMGATE_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Client-side TLS configuration for outbound links.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTlsConfig {
    /// Encrypt outbound links.
    pub enabled: bool,
    /// CA bundle for verifying the peer. Public web roots are used when unset.
    pub ca_path: Option<PathBuf>,
    /// Client certificate for peers that require mTLS.
    pub cert_path: Option<PathBuf>,
    /// Private key matching `cert_path`.
    pub key_path: Option<PathBuf>,
    /// Accept any server certificate. Sensor nodes usually present
    /// self-signed certificates.
    pub insecure: bool,
    /// SNI name to present instead of the peer's IP address.
    pub server_name: Option<String>,
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_path: None,
            cert_path: None,
            key_path: None,
            insecure: true,
            server_name: None,
        }
    }
}

impl ClientTlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("THERMGATE_CLIENT_TLS_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(path) = std::env::var("THERMGATE_CLIENT_TLS_CA") {
            self.ca_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("THERMGATE_CLIENT_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("THERMGATE_CLIENT_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(insecure) = env_flag("THERMGATE_CLIENT_TLS_INSECURE") {
            self.insecure = insecure;
        }
    }
}

/// Sampler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub enabled: bool,
    /// Interval between sampling passes, in seconds.
    pub interval_secs: u64,
    /// Lowest generated temperature (inclusive).
    pub min_celsius: i32,
    /// Highest generated temperature (exclusive).
    pub max_celsius: i32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3,
            min_celsius: 0,
            max_celsius: 50,
        }
    }
}

impl SamplerConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("THERMGATE_SAMPLER_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(secs) = env_parse("THERMGATE_SAMPLER_INTERVAL") {
            self.interval_secs = secs;
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Threshold monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Interval between monitor passes, in seconds.
    pub interval_secs: u64,
    /// Readings averaged per sensor.
    pub history_size: usize,
    /// Average above which a sensor is reported hot.
    pub hot_threshold: f32,
    /// Average below which a sensor is reported cold.
    pub cold_threshold: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 1,
            history_size: 5,
            hot_threshold: 50.0,
            cold_threshold: 10.0,
        }
    }
}

impl MonitorConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("THERMGATE_MONITOR_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(t) = env_parse("THERMGATE_HOT_THRESHOLD") {
            self.hot_threshold = t;
        }
        if let Some(t) = env_parse("THERMGATE_COLD_THRESHOLD") {
            self.cold_threshold = t;
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset.
    pub filter: String,
    /// File that receives a copy of every log line. Read by `log`,
    /// truncated by `clearlog`.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            file: Some(PathBuf::from("gateway.log")),
        }
    }
}

impl LoggingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("THERMGATE_LOG_FILE") {
            self.file = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9090),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("THERMGATE_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("THERMGATE_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
