//! Lock acquisition with watch-and-retry on contention

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ds_backend::{BackendError, CoordinationBackend, CreateOutcome};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{LockError, Result};
use crate::session::{LockSession, LockState};

/// Namespace every lock key lives under
pub const DEFAULT_LOCK_PREFIX: &str = "/DistributedLock/locks/";

/// Configuration for the lock service
#[derive(Debug, Clone)]
pub struct LockServiceConfig {
    /// Prefix prepended to every lock name
    pub key_prefix: String,

    /// TTL used by `acquire_default`
    pub default_ttl_seconds: u64,

    /// How often the renewal loop checks whether the lease needs refreshing
    pub renew_check_interval: Duration,

    /// Give up waiting for a contended lock after this long (`None` waits forever)
    pub max_wait: Option<Duration>,

    /// First retry delay after the holder released (jittered, doubles per retry)
    pub retry_backoff_initial: Duration,

    /// Upper bound for the retry delay
    pub retry_backoff_max: Duration,
}

impl Default for LockServiceConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            default_ttl_seconds: 15,
            renew_check_interval: Duration::from_secs(1),
            max_wait: None,
            retry_backoff_initial: Duration::from_millis(10),
            retry_backoff_max: Duration::from_secs(1),
        }
    }
}

impl LockServiceConfig {
    pub fn with_key_prefix(mut self, prefix: String) -> Self {
        self.key_prefix = prefix;
        self
    }

    pub fn with_default_ttl(mut self, ttl_seconds: u64) -> Self {
        self.default_ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_renew_check_interval(mut self, interval: Duration) -> Self {
        self.renew_check_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff_initial = initial;
        self.retry_backoff_max = max;
        self
    }
}

/// Exponential backoff with full jitter
struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self { current: initial, max: max.max(initial) }
    }

    fn next_delay(&mut self) -> Duration {
        if self.current.is_zero() {
            return Duration::ZERO;
        }
        let ceiling = self.current;
        self.current = (self.current * 2).min(self.max);
        let millis = ceiling.as_millis().max(1) as u64;
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }
}

/// Hands out [`LockSession`]s for named resources
pub struct DistributedLockService {
    backend: Arc<dyn CoordinationBackend>,
    config: LockServiceConfig,
}

impl DistributedLockService {
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self::with_config(backend, LockServiceConfig::default())
    }

    pub fn with_config(backend: Arc<dyn CoordinationBackend>, config: LockServiceConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockServiceConfig {
        &self.config
    }

    /// Backend key for a lock name
    pub fn lock_key(&self, lock_name: &str) -> String {
        format!("{}{}", self.config.key_prefix, lock_name)
    }

    fn validate(&self, lock_name: &str, ttl_seconds: u64) -> Result<()> {
        if lock_name.trim().is_empty() {
            return Err(LockError::Config("lock name must not be empty".to_string()));
        }
        if ttl_seconds == 0 {
            return Err(LockError::Config("lock ttl must be at least one second".to_string()));
        }
        if self.config.renew_check_interval.is_zero() {
            return Err(LockError::Config("renew check interval must be positive".to_string()));
        }
        Ok(())
    }

    fn open_session(&self, key: String, token: String, ttl_seconds: u64) -> LockSession {
        LockSession::start(
            self.backend.clone(),
            key,
            token,
            ttl_seconds,
            self.config.renew_check_interval,
        )
    }

    /// Acquire `lock_name` with the configured default TTL
    pub async fn acquire_default(&self, lock_name: &str) -> Result<LockSession> {
        self.acquire(lock_name, self.config.default_ttl_seconds).await
    }

    /// Acquire `lock_name`, waiting for the current holder to release or lapse.
    ///
    /// Each attempt writes a fresh token with create-if-absent. On conflict the key is
    /// watched until it is deleted or expires, then the write is retried after a jittered
    /// backoff. Fails with `WaitTimeout` once `max_wait` is exceeded.
    pub async fn acquire(&self, lock_name: &str, ttl_seconds: u64) -> Result<LockSession> {
        self.validate(lock_name, ttl_seconds)?;

        let key = self.lock_key(lock_name);
        let started = Instant::now();
        let deadline = self.config.max_wait.map(|wait| started + wait);
        let mut backoff =
            Backoff::new(self.config.retry_backoff_initial, self.config.retry_backoff_max);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let token = Uuid::new_v4().to_string();

            match self.backend.create_if_absent(&key, &token, ttl_seconds).await? {
                CreateOutcome::Created(_) => {
                    info!(lock_key = %key, attempts, ttl_seconds, "Lock acquired");
                    return Ok(self.open_session(key, token, ttl_seconds));
                }
                CreateOutcome::AlreadyExists { index } => {
                    debug!(
                        lock_key = %key,
                        index,
                        attempts,
                        "Lock held elsewhere, watching for release"
                    );

                    let released = self.wait_for_release(&key, index + 1);
                    match deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, released)
                            .await
                            .map_err(|_| LockError::WaitTimeout {
                                key: key.clone(),
                                waited: started.elapsed(),
                            })??,
                        None => released.await?,
                    }

                    let mut delay = backoff.next_delay();
                    if let Some(deadline) = deadline {
                        delay = delay.min(deadline.saturating_duration_since(Instant::now()));
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Single acquisition attempt; `None` if someone else holds the lock
    pub async fn try_acquire(
        &self,
        lock_name: &str,
        ttl_seconds: u64,
    ) -> Result<Option<LockSession>> {
        self.validate(lock_name, ttl_seconds)?;

        let key = self.lock_key(lock_name);
        let token = Uuid::new_v4().to_string();

        match self.backend.create_if_absent(&key, &token, ttl_seconds).await? {
            CreateOutcome::Created(_) => {
                info!(lock_key = %key, ttl_seconds, "Lock acquired");
                Ok(Some(self.open_session(key, token, ttl_seconds)))
            }
            CreateOutcome::AlreadyExists { .. } => {
                debug!(lock_key = %key, "Lock held elsewhere");
                Ok(None)
            }
        }
    }

    /// Block until the key is deleted or its lease expires.
    ///
    /// Writes by the current holder (renewals) keep the watch going; any action outside the
    /// known set is a protocol violation.
    async fn wait_for_release(&self, key: &str, from_index: u64) -> Result<()> {
        let mut next_index = from_index;

        loop {
            match self.backend.watch(key, Some(next_index)).await {
                Ok(event) if event.action.removes_key() => {
                    debug!(lock_key = %key, action = %event.action, "Lock became free");
                    return Ok(());
                }
                Ok(event) if event.action.writes_key() => {
                    next_index = event.node.modified_index.max(next_index) + 1;
                }
                Ok(event) => {
                    return Err(LockError::UnexpectedWatchAction {
                        key: key.to_string(),
                        action: event.action.to_string(),
                    });
                }
                Err(BackendError::EventIndexCleared { .. }) => {
                    // History compacted: the key may already be free, so just retry the write
                    debug!(lock_key = %key, "Watch history cleared, retrying acquisition");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `f` while holding `lock_name`, releasing the lock exactly once afterwards.
    ///
    /// The lock is released whether `f` completes or panics; a panic is resumed after the
    /// release. A failed release (or a lease lost while `f` ran) is returned as the error.
    /// If this future is dropped mid-way the session's drop releases the key in the background.
    pub async fn with_lock<T, F>(&self, lock_name: &str, ttl_seconds: u64, f: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s LockSession) -> BoxFuture<'s, T>,
    {
        let session = self.acquire(lock_name, ttl_seconds).await?;

        let outcome = AssertUnwindSafe(f(&session)).catch_unwind().await;

        let released = match session.state() {
            LockState::Active => session.release().await,
            LockState::Released => Ok(()),
            LockState::Expired => Err(LockError::LockExpired {
                key: session.key().to_string(),
            }),
        };

        match outcome {
            Ok(value) => released.map(|_| value),
            Err(panic) => {
                if let Err(e) = released {
                    error!(
                        lock_key = %session.key(),
                        error = %e,
                        "Failed to release lock after panic"
                    );
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}
