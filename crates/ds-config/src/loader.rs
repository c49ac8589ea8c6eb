//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &["dsync.toml", "./config/dsync.toml", "/etc/dsync/config.toml"];

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "DSYNC_CONFIG";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate it.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|name| env::var(name).ok())
    }

    /// Same as [`load`](Self::load) but reads overrides through `lookup`
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup)? {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use. An explicitly named file must exist.
    fn find_config_file<F>(&self, lookup: &F) -> Result<Option<PathBuf>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = self
            .config_path
            .clone()
            .or_else(|| lookup(CONFIG_PATH_ENV).map(PathBuf::from));

        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::ReadError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }

        Ok(CONFIG_PATHS.iter().map(PathBuf::from).find(|p| p.exists()))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parsed<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvError(format!("{} has an invalid value: {}", name, val))),
        None => Ok(None),
    }
}

/// Apply `DSYNC_*` environment variable overrides
fn apply_overrides<F>(config: &mut AppConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Backend
    if let Some(val) = lookup("DSYNC_BACKEND") {
        config.backend.kind = val.parse()?;
    }
    if let Some(val) = lookup("DSYNC_ENDPOINTS") {
        config.backend.endpoints = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(ms) = parsed(lookup, "DSYNC_REQUEST_TIMEOUT_MS")? {
        config.backend.request_timeout_ms = ms;
    }

    // Lock
    if let Some(val) = lookup("DSYNC_LOCK_KEY_PREFIX") {
        config.lock.key_prefix = val;
    }
    if let Some(ttl) = parsed(lookup, "DSYNC_LOCK_TTL_SECS")? {
        config.lock.default_ttl_seconds = ttl;
    }
    if let Some(ms) = parsed(lookup, "DSYNC_LOCK_RENEW_CHECK_MS")? {
        config.lock.renew_check_interval_ms = ms;
    }
    if let Some(secs) = parsed(lookup, "DSYNC_LOCK_MAX_WAIT_SECS")? {
        config.lock.max_wait_seconds = secs;
    }

    // Election
    if let Some(val) = lookup("DSYNC_ELECTION_KEY") {
        config.election.election_key = val;
    }
    if let Some(val) = lookup("DSYNC_INSTANCE_ID") {
        config.election.instance_id = val;
    }
    if let Some(secs) = parsed(lookup, "DSYNC_ELECTION_TIMEOUT_SECS")? {
        config.election.election_timeout_seconds = secs;
    }
    if let Some(secs) = parsed(lookup, "DSYNC_ELECTION_SAFETY_MARGIN_SECS")? {
        config.election.safety_margin_seconds = secs;
    }
    if let Some(val) = lookup("DSYNC_REFRESH_FAILURE_POLICY") {
        config.election.refresh_failure_policy = val;
    }
    if let Some(ms) = parsed(lookup, "DSYNC_HANDLER_CANCEL_GRACE_MS")? {
        config.election.handler_cancel_grace_ms = ms;
    }

    // General
    if let Some(dev) = parsed(lookup, "DSYNC_DEV_MODE")? {
        config.dev_mode = dev;
    }

    Ok(())
}
