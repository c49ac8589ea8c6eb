//! dsync Configuration System
//!
//! TOML-based configuration with environment variable override support,
//! converted into the runtime configs of the lock service and the election.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ds_election::{ElectionConfig, RefreshFailurePolicy};
use ds_lock::LockServiceConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub lock: LockConfig,
    pub election: ElectionSettings,

    /// Enable development mode
    pub dev_mode: bool,
}

/// Which coordination backend to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Etcd,
    Memory,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(BackendKind::Etcd),
            "memory" => Ok(BackendKind::Memory),
            other => Err(ConfigError::ValidationError(format!("unknown backend kind: {}", other))),
        }
    }
}

/// Coordination backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub endpoints: Vec<String>,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            request_timeout_ms: 5000,
        }
    }
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub key_prefix: String,
    pub default_ttl_seconds: u64,
    pub renew_check_interval_ms: u64,
    /// 0 waits forever
    pub max_wait_seconds: u64,
    pub retry_backoff_initial_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: ds_lock::DEFAULT_LOCK_PREFIX.to_string(),
            default_ttl_seconds: 15,
            renew_check_interval_ms: 1000,
            max_wait_seconds: 0,
            retry_backoff_initial_ms: 10,
            retry_backoff_max_ms: 1000,
        }
    }
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionSettings {
    pub election_key: String,
    /// Empty generates a random id at startup
    pub instance_id: String,
    pub election_timeout_seconds: u64,
    pub safety_margin_seconds: u64,
    pub refresh_failure_policy: String,
    /// 0 does not wait for cancelled handlers
    pub handler_cancel_grace_ms: u64,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            election_key: ds_election::DEFAULT_ELECTION_KEY.to_string(),
            instance_id: String::new(),
            election_timeout_seconds: 15,
            safety_margin_seconds: 10,
            refresh_failure_policy: "reregister".to_string(),
            handler_cancel_grace_ms: 5000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.kind == BackendKind::Etcd && self.backend.endpoints.is_empty() {
            return invalid("backend.endpoints must not be empty for the etcd backend");
        }
        if self.backend.request_timeout_ms == 0 {
            return invalid("backend.request_timeout_ms must be positive");
        }
        if self.lock.default_ttl_seconds == 0 {
            return invalid("lock.default_ttl_seconds must be positive");
        }
        if self.lock.renew_check_interval_ms == 0 {
            return invalid("lock.renew_check_interval_ms must be positive");
        }
        if self.lock.retry_backoff_initial_ms > self.lock.retry_backoff_max_ms {
            return invalid(
                "lock.retry_backoff_initial_ms must not exceed lock.retry_backoff_max_ms",
            );
        }
        if self.election.election_timeout_seconds == 0 {
            return invalid("election.election_timeout_seconds must be positive");
        }
        if self.election.safety_margin_seconds >= self.election.election_timeout_seconds {
            return Err(ConfigError::ValidationError(format!(
                "election.safety_margin_seconds ({}) must be smaller than \
                 election.election_timeout_seconds ({})",
                self.election.safety_margin_seconds,
                self.election.election_timeout_seconds
            )));
        }
        self.refresh_failure_policy()?;
        Ok(())
    }

    pub fn refresh_failure_policy(&self) -> Result<RefreshFailurePolicy, ConfigError> {
        self.election
            .refresh_failure_policy
            .parse()
            .map_err(|e: ds_election::ElectionError| ConfigError::ValidationError(e.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }

    pub fn lock_service_config(&self) -> LockServiceConfig {
        let config = LockServiceConfig::default()
            .with_key_prefix(self.lock.key_prefix.clone())
            .with_default_ttl(self.lock.default_ttl_seconds)
            .with_renew_check_interval(Duration::from_millis(self.lock.renew_check_interval_ms))
            .with_retry_backoff(
                Duration::from_millis(self.lock.retry_backoff_initial_ms),
                Duration::from_millis(self.lock.retry_backoff_max_ms),
            );

        match self.lock.max_wait_seconds {
            0 => config,
            secs => config.with_max_wait(Duration::from_secs(secs)),
        }
    }

    pub fn election_config(&self) -> Result<ElectionConfig, ConfigError> {
        let instance_id = if self.election.instance_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.election.instance_id.clone()
        };
        let grace = match self.election.handler_cancel_grace_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(ElectionConfig::new(self.election.election_timeout_seconds)
            .with_election_key(self.election.election_key.clone())
            .with_instance_id(instance_id)
            .with_safety_margin(self.election.safety_margin_seconds)
            .with_refresh_failure_policy(self.refresh_failure_policy()?)
            .with_handler_cancel_grace(grace))
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# dsync Configuration
# Environment variables (DSYNC_*) override these settings

[backend]
kind = "etcd"  # etcd or memory
endpoints = ["http://127.0.0.1:2379"]
request_timeout_ms = 5000

[lock]
key_prefix = "/DistributedLock/locks/"
default_ttl_seconds = 15
renew_check_interval_ms = 1000
max_wait_seconds = 0  # 0 waits forever
retry_backoff_initial_ms = 10
retry_backoff_max_ms = 1000

[election]
election_key = "/MasterElection/Status"
instance_id = ""  # empty generates one
election_timeout_seconds = 15
safety_margin_seconds = 10
refresh_failure_policy = "reregister"  # reregister or terminate
handler_cancel_grace_ms = 5000

dev_mode = false
"#
        .to_string()
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(message.to_string()))
}
