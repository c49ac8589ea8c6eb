//! Election configuration

use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{ElectionError, Result};

/// Directory every participant registers under
pub const DEFAULT_ELECTION_KEY: &str = "/MasterElection/Status";

/// What a participant does when its own node can no longer be refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailurePolicy {
    /// Step down and register a new node at the back of the order
    Reregister,
    /// Step down and stop participating, returning `RefreshFailed`
    Terminate,
}

impl FromStr for RefreshFailurePolicy {
    type Err = ElectionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reregister" | "re-register" => Ok(RefreshFailurePolicy::Reregister),
            "terminate" => Ok(RefreshFailurePolicy::Terminate),
            other => {
                Err(ElectionError::Config(format!("unknown refresh failure policy: {}", other)))
            }
        }
    }
}

/// Configuration for an election participant
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Directory the sequential nodes are created in
    pub election_key: String,

    /// Value stored in this participant's node
    pub instance_id: String,

    /// Lease TTL of the participant's node in seconds
    pub election_timeout_seconds: u64,

    /// Poll interval is the timeout minus this margin
    pub safety_margin_seconds: u64,

    pub refresh_failure_policy: RefreshFailurePolicy,

    /// How long to wait for a cancelled role handler to finish (`None` does not wait)
    pub handler_cancel_grace: Option<Duration>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_key: DEFAULT_ELECTION_KEY.to_string(),
            instance_id: Uuid::new_v4().to_string(),
            election_timeout_seconds: 15,
            safety_margin_seconds: 10,
            refresh_failure_policy: RefreshFailurePolicy::Reregister,
            handler_cancel_grace: Some(Duration::from_secs(5)),
        }
    }
}

impl ElectionConfig {
    pub fn new(election_timeout_seconds: u64) -> Self {
        Self {
            election_timeout_seconds,
            ..Default::default()
        }
    }

    pub fn with_election_key(mut self, key: String) -> Self {
        self.election_key = key;
        self
    }

    pub fn with_instance_id(mut self, id: String) -> Self {
        self.instance_id = id;
        self
    }

    pub fn with_safety_margin(mut self, seconds: u64) -> Self {
        self.safety_margin_seconds = seconds;
        self
    }

    pub fn with_refresh_failure_policy(mut self, policy: RefreshFailurePolicy) -> Self {
        self.refresh_failure_policy = policy;
        self
    }

    pub fn with_handler_cancel_grace(mut self, grace: Option<Duration>) -> Self {
        self.handler_cancel_grace = grace;
        self
    }

    /// Time between refreshes; always shorter than the node's TTL
    pub fn poll_interval(&self) -> Duration {
        let seconds = self.election_timeout_seconds.saturating_sub(self.safety_margin_seconds);
        Duration::from_secs(seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_key.trim_matches('/').is_empty() {
            return Err(ElectionError::Config("election key must not be empty".to_string()));
        }
        if self.instance_id.is_empty() {
            return Err(ElectionError::Config("instance id must not be empty".to_string()));
        }
        if self.election_timeout_seconds == 0 {
            return Err(ElectionError::Config("election timeout must be positive".to_string()));
        }
        if self.safety_margin_seconds >= self.election_timeout_seconds {
            return Err(ElectionError::Config(format!(
                "safety margin ({}s) must be smaller than the election timeout ({}s)",
                self.safety_margin_seconds, self.election_timeout_seconds
            )));
        }
        Ok(())
    }
}
