//! In-process coordination backend
//!
//! Mirrors the etcd v2 semantics the lock and election code rely on: a single
//! monotonically increasing modification index, TTL leases, in-order keys that sort by
//! creation, an indexed event history for watches, and `expire` events when a lease lapses.
//! Time is measured with `tokio::time::Instant`, so tests can drive expiry with a paused clock.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{BackendError, Result};
use crate::node::{CreateOutcome, DeleteOutcome, Node, SwapOutcome, WatchAction, WatchEvent};
use crate::CoordinationBackend;

const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    index: u64,
    entries: BTreeMap<String, Entry>,
    history: VecDeque<(u64, WatchEvent)>,
    /// Highest index dropped from the history
    cleared_through: u64,
}

/// In-memory implementation of [`CoordinationBackend`]
pub struct MemoryBackend {
    state: Mutex<State>,
    changed: Notify,
    history_limit: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` events for indexed watches
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Notify::new(),
            history_limit: limit.max(1),
        }
    }

    /// Current modification index
    pub fn current_index(&self) -> u64 {
        self.state.lock().index
    }

    /// Read a key, honouring lease expiry
    pub fn get(&self, key: &str) -> Option<Node> {
        let key = normalize(key);
        let now = Instant::now();
        let (node, expired) = {
            let mut state = self.state.lock();
            let expired = self.purge_expired(&mut state, now);
            (state.entries.get(&key).map(|e| to_node(&key, e, now)), expired)
        };
        if expired {
            self.changed.notify_waiters();
        }
        node
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        self.purge_expired(&mut state, Instant::now());
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries, recording an `expire` event for each. Returns true if any expired.
    fn purge_expired(&self, state: &mut State, now: Instant) -> bool {
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = state.entries.remove(key) {
                state.index += 1;
                let index = state.index;
                let node = Node {
                    key: key.clone(),
                    value: entry.value,
                    created_index: entry.created_index,
                    modified_index: index,
                    ttl: None,
                    expiration: None,
                };
                debug!(key = %key, index, "Lease expired");
                self.record(state, WatchAction::Expire, node);
            }
        }

        !expired.is_empty()
    }

    fn record(&self, state: &mut State, action: WatchAction, node: Node) {
        let index = state.index;
        state.history.push_back((index, WatchEvent { action, node }));
        while state.history.len() > self.history_limit {
            if let Some((dropped, _)) = state.history.pop_front() {
                state.cleared_through = dropped;
            }
        }
    }

    /// Write an entry at the next index and record the event
    fn write(
        &self,
        state: &mut State,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        action: WatchAction,
        now: Instant,
    ) -> Node {
        state.index += 1;
        let index = state.index;
        let created_index = match (&action, state.entries.get(key)) {
            (WatchAction::CompareAndSwap | WatchAction::Set, Some(existing)) => {
                existing.created_index
            }
            _ => index,
        };
        let entry = Entry {
            value: value.to_string(),
            created_index,
            modified_index: index,
            expires_at: lease_deadline(now, ttl_seconds),
        };
        let node = to_node(key, &entry, now);
        state.entries.insert(key.to_string(), entry);
        self.record(state, action, node.clone());
        node
    }

    fn next_expiry(state: &State) -> Option<Instant> {
        state.entries.values().filter_map(|e| e.expires_at).min()
    }
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn lease_deadline(now: Instant, ttl_seconds: u64) -> Option<Instant> {
    if ttl_seconds == 0 {
        None
    } else {
        Some(now + Duration::from_secs(ttl_seconds))
    }
}

fn to_node(key: &str, entry: &Entry, now: Instant) -> Node {
    let remaining = entry.expires_at.map(|at| at.saturating_duration_since(now));
    Node {
        key: key.to_string(),
        value: entry.value.clone(),
        created_index: entry.created_index,
        modified_index: entry.modified_index,
        ttl: remaining.map(|r| r.as_secs_f64().ceil() as i64),
        expiration: remaining
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .map(|r| Utc::now() + r),
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<CreateOutcome> {
        let key = normalize(key);
        let now = Instant::now();
        let outcome = {
            let mut state = self.state.lock();
            self.purge_expired(&mut state, now);
            if state.entries.contains_key(&key) {
                CreateOutcome::AlreadyExists { index: state.index }
            } else {
                let node =
                    self.write(&mut state, &key, value, ttl_seconds, WatchAction::Create, now);
                CreateOutcome::Created(node)
            }
        };
        self.changed.notify_waiters();
        Ok(outcome)
    }

    async fn create_sequential(
        &self,
        parent_key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<Node> {
        let parent = normalize(parent_key);
        let now = Instant::now();
        let node = {
            let mut state = self.state.lock();
            self.purge_expired(&mut state, now);
            // etcd names in-order keys after the index they are created at, zero padded
            let key = format!("{}/{:020}", parent, state.index + 1);
            self.write(&mut state, &key, value, ttl_seconds, WatchAction::Create, now)
        };
        self.changed.notify_waiters();
        Ok(node)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl_seconds: u64,
    ) -> Result<SwapOutcome> {
        let key = normalize(key);
        let now = Instant::now();
        let outcome = {
            let mut state = self.state.lock();
            self.purge_expired(&mut state, now);
            match state.entries.get(&key) {
                Some(entry) if entry.value == expected => SwapOutcome::Swapped(self.write(
                    &mut state,
                    &key,
                    new_value,
                    ttl_seconds,
                    WatchAction::CompareAndSwap,
                    now,
                )),
                _ => SwapOutcome::PreconditionFailed,
            }
        };
        self.changed.notify_waiters();
        Ok(outcome)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<DeleteOutcome> {
        let key = normalize(key);
        let now = Instant::now();
        let outcome = {
            let mut state = self.state.lock();
            self.purge_expired(&mut state, now);
            let matches = state.entries.get(&key).map(|e| e.value == expected).unwrap_or(false);
            if matches {
                if let Some(entry) = state.entries.remove(&key) {
                    state.index += 1;
                    let node = Node {
                        key: key.clone(),
                        value: String::new(),
                        created_index: entry.created_index,
                        modified_index: state.index,
                        ttl: None,
                        expiration: None,
                    };
                    self.record(&mut state, WatchAction::CompareAndDelete, node);
                }
                DeleteOutcome::Deleted
            } else {
                DeleteOutcome::PreconditionFailed
            }
        };
        self.changed.notify_waiters();
        Ok(outcome)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<Node> {
        let key = normalize(key);
        let now = Instant::now();
        let node = {
            let mut state = self.state.lock();
            self.purge_expired(&mut state, now);
            self.write(&mut state, &key, value, ttl_seconds, WatchAction::Set, now)
        };
        self.changed.notify_waiters();
        Ok(node)
    }

    async fn list_sorted(&self, key: &str) -> Result<Vec<Node>> {
        let parent = normalize(key);
        let prefix = format!("{}/", parent);
        let now = Instant::now();
        let (nodes, expired) = {
            let mut state = self.state.lock();
            let expired = self.purge_expired(&mut state, now);
            // BTreeMap iteration is already sorted by key
            let nodes: Vec<Node> = state
                .entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .filter(|(k, _)| !k[prefix.len()..].contains('/'))
                .map(|(k, e)| to_node(k, e, now))
                .collect();
            (nodes, expired)
        };
        if expired {
            self.changed.notify_waiters();
        }
        Ok(nodes)
    }

    async fn watch(&self, key: &str, wait_index: Option<u64>) -> Result<WatchEvent> {
        let key = normalize(key);
        let start_index = match wait_index {
            Some(index) => index,
            None => self.state.lock().index + 1,
        };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (found, deadline, expired) = {
                let mut state = self.state.lock();
                let expired = self.purge_expired(&mut state, Instant::now());

                if start_index <= state.cleared_through {
                    return Err(BackendError::EventIndexCleared {
                        key,
                        requested: start_index,
                        current: state.index,
                    });
                }

                let found = state
                    .history
                    .iter()
                    .find(|(index, event)| *index >= start_index && event.node.key == key)
                    .map(|(_, event)| event.clone());
                (found, Self::next_expiry(&state), expired)
            };

            if expired {
                self.changed.notify_waiters();
            }
            if let Some(event) = found {
                trace!(key = %key, action = %event.action, "Watch fired");
                return Ok(event);
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
