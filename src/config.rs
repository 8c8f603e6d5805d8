//! Configuration management for capwire
//!
//! This module handles loading, parsing, validating, and overriding the
//! session configuration from YAML files and environment variables. A
//! [`Config`] is loaded once and treated as immutable for the life of a
//! session.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::AccessPolicy;
use crate::error::{CapwireError, Result};
use crate::types::CacheClass;

/// Main configuration structure for capwire
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Connection lifecycle: timeouts, heartbeat, reconnection
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Request coalescing
    #[serde(default)]
    pub batching: BatchingConfig,
    /// Result cache TTL classes
    #[serde(default)]
    pub cache: CacheConfig,
    /// Local access policy
    #[serde(default)]
    pub access: AccessPolicy,
    /// Identity announced in the handshake
    #[serde(default)]
    pub client: ClientConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What happens to requests already written to a connection that is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// Resolve them with `ConnectionLost`; the caller decides whether to
    /// retry.
    #[default]
    Surface,
    /// Retransmit them on the new connection ahead of queued requests.
    Replay,
}

/// Connection lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Default per-request deadline
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for opening the transport and for the handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Interval between liveness probes; `0` disables the heartbeat
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a probe may take before it counts as missed
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Consecutive misses that force the connection into recovery
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,

    /// Reconnection backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Requests accepted while recovering before new calls are rejected
    #[serde(default = "default_degraded_queue_capacity")]
    pub degraded_queue_capacity: usize,

    /// Fate of in-flight requests across a reconnect
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_miss_threshold() -> u32 {
    3
}

fn default_degraded_queue_capacity() -> usize {
    64
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            reconnect: ReconnectConfig::default(),
            degraded_queue_capacity: default_degraded_queue_capacity(),
            replay_policy: ReplayPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Reconnection backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts before the connection is closed for good
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the exponential delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random extra delay, as a fraction of the computed delay (0.0 to 1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Request coalescing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchingConfig {
    /// How long the first request of a batch waits for company
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Flush as soon as this many requests are waiting
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_window_ms() -> u64 {
    5
}

fn default_max_batch_size() -> usize {
    16
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl BatchingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Cache TTL configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_static_ttl_ms")]
    pub static_ttl_ms: u64,

    #[serde(default = "default_dynamic_ttl_ms")]
    pub dynamic_ttl_ms: u64,

    #[serde(default = "default_volatile_ttl_ms")]
    pub volatile_ttl_ms: u64,

    /// Class applied to discovery listings
    #[serde(default)]
    pub discovery_class: CacheClass,

    /// Class applied to resource reads with no explicit override
    #[serde(default)]
    pub read_class: CacheClass,

    /// Per-capability class, keyed by operation name, resource URI or
    /// template pattern
    #[serde(default)]
    pub overrides: HashMap<String, CacheClass>,
}

fn default_static_ttl_ms() -> u64 {
    3_600_000
}

fn default_dynamic_ttl_ms() -> u64 {
    60_000
}

fn default_volatile_ttl_ms() -> u64 {
    5_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_ttl_ms: default_static_ttl_ms(),
            dynamic_ttl_ms: default_dynamic_ttl_ms(),
            volatile_ttl_ms: default_volatile_ttl_ms(),
            discovery_class: CacheClass::default(),
            read_class: CacheClass::default(),
            overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// TTL for a class; `None` for [`CacheClass::Never`].
    pub fn ttl(&self, class: CacheClass) -> Option<Duration> {
        match class {
            CacheClass::Static => Some(Duration::from_millis(self.static_ttl_ms)),
            CacheClass::Dynamic => Some(Duration::from_millis(self.dynamic_ttl_ms)),
            CacheClass::Volatile => Some(Duration::from_millis(self.volatile_ttl_ms)),
            CacheClass::Never => None,
        }
    }

    /// Class for a named capability, falling back to `default`.
    pub fn class_for(&self, name: &str, default: CacheClass) -> CacheClass {
        self.overrides.get(name).copied().unwrap_or(default)
    }
}

/// Client identity announced during the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "default_client_name")]
    pub name: String,

    #[serde(default = "default_client_version")]
    pub version: String,
}

fn default_client_name() -> String {
    "capwire".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter level; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Config {
    /// Load configuration from `path`, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Config`] if the file exists but cannot be
    /// read or parsed, or if the result fails [`Config::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file without applying overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CapwireError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&contents)
    }

    /// Parse YAML text without applying overrides.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| CapwireError::Config(format!("Failed to parse config: {}", e)).into())
    }

    /// Apply `CAPWIRE_*` environment variable overrides.
    pub fn apply_env_vars(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            if let Some(raw) = raw {
                match raw.parse() {
                    Ok(value) => *slot = value,
                    Err(_) => tracing::warn!("Invalid {}: {}", key, raw),
                }
            }
        }

        let c = &mut self.connection;
        parsed(
            "CAPWIRE_REQUEST_TIMEOUT_MS",
            lookup("CAPWIRE_REQUEST_TIMEOUT_MS"),
            &mut c.request_timeout_ms,
        );
        parsed(
            "CAPWIRE_CONNECT_TIMEOUT_MS",
            lookup("CAPWIRE_CONNECT_TIMEOUT_MS"),
            &mut c.connect_timeout_ms,
        );
        parsed(
            "CAPWIRE_HEARTBEAT_INTERVAL_MS",
            lookup("CAPWIRE_HEARTBEAT_INTERVAL_MS"),
            &mut c.heartbeat_interval_ms,
        );
        parsed(
            "CAPWIRE_RECONNECT_MAX_ATTEMPTS",
            lookup("CAPWIRE_RECONNECT_MAX_ATTEMPTS"),
            &mut c.reconnect.max_attempts,
        );
        parsed(
            "CAPWIRE_DEGRADED_QUEUE_CAPACITY",
            lookup("CAPWIRE_DEGRADED_QUEUE_CAPACITY"),
            &mut c.degraded_queue_capacity,
        );
        if let Some(policy) = lookup("CAPWIRE_REPLAY_POLICY") {
            match policy.to_lowercase().as_str() {
                "surface" => c.replay_policy = ReplayPolicy::Surface,
                "replay" => c.replay_policy = ReplayPolicy::Replay,
                _ => tracing::warn!("Invalid CAPWIRE_REPLAY_POLICY: {}", policy),
            }
        }

        parsed(
            "CAPWIRE_BATCH_WINDOW_MS",
            lookup("CAPWIRE_BATCH_WINDOW_MS"),
            &mut self.batching.window_ms,
        );
        parsed(
            "CAPWIRE_MAX_BATCH_SIZE",
            lookup("CAPWIRE_MAX_BATCH_SIZE"),
            &mut self.batching.max_batch_size,
        );

        if let Some(subject) = lookup("CAPWIRE_SUBJECT") {
            self.access.subject = subject;
        }

        if let Some(level) = lookup("CAPWIRE_LOG_LEVEL") {
            self.logging.level = level;
        }
        parsed(
            "CAPWIRE_LOG_JSON",
            lookup("CAPWIRE_LOG_JSON"),
            &mut self.logging.json_format,
        );
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.request_timeout_ms == 0 {
            return Err(
                CapwireError::Config("request_timeout_ms must be greater than 0".to_string())
                    .into(),
            );
        }
        if c.connect_timeout_ms == 0 {
            return Err(
                CapwireError::Config("connect_timeout_ms must be greater than 0".to_string())
                    .into(),
            );
        }
        if c.heartbeat_interval_ms > 0 {
            if c.heartbeat_timeout_ms == 0 {
                return Err(CapwireError::Config(
                    "heartbeat_timeout_ms must be greater than 0".to_string(),
                )
                .into());
            }
            if c.heartbeat_timeout_ms >= c.heartbeat_interval_ms {
                return Err(CapwireError::Config(
                    "heartbeat_timeout_ms must be shorter than heartbeat_interval_ms".to_string(),
                )
                .into());
            }
            if c.heartbeat_miss_threshold == 0 {
                return Err(CapwireError::Config(
                    "heartbeat_miss_threshold must be greater than 0".to_string(),
                )
                .into());
            }
        }
        if c.reconnect.max_attempts == 0 {
            return Err(CapwireError::Config(
                "reconnect.max_attempts must be greater than 0".to_string(),
            )
            .into());
        }
        if c.reconnect.base_delay_ms > c.reconnect.max_delay_ms {
            return Err(CapwireError::Config(
                "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms".to_string(),
            )
            .into());
        }
        if !(0.0..=1.0).contains(&c.reconnect.jitter_ratio) {
            return Err(CapwireError::Config(
                "reconnect.jitter_ratio must be between 0.0 and 1.0".to_string(),
            )
            .into());
        }
        if c.degraded_queue_capacity == 0 {
            return Err(CapwireError::Config(
                "degraded_queue_capacity must be greater than 0".to_string(),
            )
            .into());
        }
        if self.batching.max_batch_size == 0 {
            return Err(CapwireError::Config(
                "batching.max_batch_size must be greater than 0".to_string(),
            )
            .into());
        }
        self.access.validate()?;
        if self.client.name.is_empty() {
            return Err(CapwireError::Config("client.name cannot be empty".to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.request_timeout_ms, 30_000);
        assert_eq!(config.connection.reconnect.max_attempts, 5);
        assert_eq!(config.connection.replay_policy, ReplayPolicy::Surface);
        assert_eq!(config.batching.max_batch_size, 16);
        assert_eq!(config.client.name, "capwire");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config = Config::from_yaml_str(
            r#"
connection:
  request_timeout_ms: 500
  reconnect:
    max_attempts: 3
  replay_policy: replay
cache:
  dynamic_ttl_ms: 100
  overrides:
    "file:///etc/motd": static
access:
  subject: alice
  allowed: ["operation:*"]
  rate_limit:
    max_calls: 10
    window_ms: 1000
"#,
        )
        .unwrap();
        assert_eq!(config.connection.request_timeout_ms, 500);
        assert_eq!(config.connection.reconnect.max_attempts, 3);
        assert_eq!(config.connection.reconnect.base_delay_ms, 250);
        assert_eq!(config.connection.replay_policy, ReplayPolicy::Replay);
        assert_eq!(config.cache.ttl(CacheClass::Dynamic), Some(Duration::from_millis(100)));
        assert_eq!(
            config.cache.class_for("file:///etc/motd", CacheClass::Dynamic),
            CacheClass::Static
        );
        assert_eq!(config.access.subject, "alice");
        assert_eq!(config.access.rate_limit.as_ref().unwrap().max_calls, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = Config::from_yaml_str("connection: [1, 2").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batching:\n  window_ms: 20\n  max_batch_size: 4").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.batching.window_ms, 20);
        assert_eq!(config.batching.max_batch_size, 4);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.batching.window_ms, 5);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("CAPWIRE_REQUEST_TIMEOUT_MS", "1234"),
            ("CAPWIRE_REPLAY_POLICY", "Replay"),
            ("CAPWIRE_SUBJECT", "bob"),
            ("CAPWIRE_LOG_JSON", "true"),
        ]));
        assert_eq!(config.connection.request_timeout_ms, 1234);
        assert_eq!(config.connection.replay_policy, ReplayPolicy::Replay);
        assert_eq!(config.access.subject, "bob");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_invalid_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[("CAPWIRE_MAX_BATCH_SIZE", "lots")]));
        assert_eq!(config.batching.max_batch_size, 16);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Config::default();
        config.connection.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batching.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.degraded_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_jitter_and_heartbeat() {
        let mut config = Config::default();
        config.connection.reconnect.jitter_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.heartbeat_timeout_ms = config.connection.heartbeat_interval_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.heartbeat_interval_ms = 0;
        config.connection.heartbeat_timeout_ms = 0;
        assert!(config.validate().is_ok());
        assert!(config.connection.heartbeat_interval().is_none());
    }
}
