//! Node and event types shared by all backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single key as stored by the coordination service.
///
/// Field names follow the etcd v2 JSON representation so the HTTP client can decode
/// responses straight into this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
    /// Remaining lease in seconds at the time the node was read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl Node {
    /// Last path segment of the key (the ordinal suffix for sequential nodes)
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Whether the node carried an expiration that already passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map(|exp| exp <= now).unwrap_or(false)
    }
}

/// Result of an atomic create-if-absent write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Node),
    /// Someone else holds the key. `index` is the backend's modification index when the
    /// conflict was observed, so a watch from `index + 1` cannot miss the holder's release.
    AlreadyExists { index: u64 },
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped(Node),
    /// The stored value did not match, or the key no longer exists
    PreconditionFailed,
}

impl SwapOutcome {
    pub fn is_swapped(&self) -> bool {
        matches!(self, SwapOutcome::Swapped(_))
    }
}

/// Result of a compare-and-delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    PreconditionFailed,
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
    Other(String),
}

impl WatchAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "set" => WatchAction::Set,
            "create" => WatchAction::Create,
            "update" => WatchAction::Update,
            "compareAndSwap" => WatchAction::CompareAndSwap,
            "delete" => WatchAction::Delete,
            "compareAndDelete" => WatchAction::CompareAndDelete,
            "expire" => WatchAction::Expire,
            other => WatchAction::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WatchAction::Set => "set",
            WatchAction::Create => "create",
            WatchAction::Update => "update",
            WatchAction::CompareAndSwap => "compareAndSwap",
            WatchAction::Delete => "delete",
            WatchAction::CompareAndDelete => "compareAndDelete",
            WatchAction::Expire => "expire",
            WatchAction::Other(other) => other,
        }
    }

    /// The key is gone after this event
    pub fn removes_key(&self) -> bool {
        matches!(
            self,
            WatchAction::Delete | WatchAction::CompareAndDelete | WatchAction::Expire
        )
    }

    /// The key still exists after this event (written or refreshed)
    pub fn writes_key(&self) -> bool {
        matches!(
            self,
            WatchAction::Set
                | WatchAction::Create
                | WatchAction::Update
                | WatchAction::CompareAndSwap
        )
    }
}

impl std::fmt::Display for WatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change delivered by `watch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub node: Node,
}
