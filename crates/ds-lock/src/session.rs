//! A held lock and its lease renewal loop

use std::sync::Arc;
use std::time::Duration;

use ds_backend::{CoordinationBackend, DeleteOutcome, SwapOutcome};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LockError, Result};

/// Renew once this fraction of the lease has elapsed
const RENEW_AFTER_NUMERATOR: u32 = 3;
const RENEW_AFTER_DENOMINATOR: u32 = 4;

/// At least this many renewal checks happen per lease period
const CHECKS_PER_LEASE: u32 = 4;

/// The configured check interval, shortened so that short leases are still checked in time
fn effective_check_interval(ttl_seconds: u64, configured: Duration) -> Duration {
    if ttl_seconds == 0 {
        return configured;
    }
    configured.min(Duration::from_secs(ttl_seconds) / CHECKS_PER_LEASE)
}

/// Lifecycle state of a [`LockSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The session's token is (as far as it knows) the stored value
    Active,
    /// Released by the holder; terminal
    Released,
    /// A renewal or release found another value (or none); terminal
    Expired,
}

struct SessionInner {
    backend: Arc<dyn CoordinationBackend>,
    key: String,
    token: String,
    ttl_seconds: u64,
    check_interval: Duration,
    /// Start of the current lease period. The mutex also serializes renew and release.
    lease_started: Mutex<Instant>,
    state_tx: watch::Sender<LockState>,
    stop: CancellationToken,
}

impl SessionInner {
    fn state(&self) -> LockState {
        *self.state_tx.borrow()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state() == LockState::Active {
            Ok(())
        } else {
            Err(LockError::LockNotHeld { key: self.key.clone() })
        }
    }

    fn finish(&self, state: LockState) {
        self.state_tx.send_replace(state);
        self.stop.cancel();
    }

    /// Past 3/4 of the lease, or the next check would already be too late
    fn renewal_due(&self, lease_started: Instant) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        let lease = Duration::from_secs(self.ttl_seconds);
        let elapsed = lease_started.elapsed();
        elapsed * RENEW_AFTER_DENOMINATOR > lease * RENEW_AFTER_NUMERATOR
            || elapsed + self.check_interval >= lease
    }

    /// Refresh the lease. With `only_if_due`, does nothing until 3/4 of the lease has elapsed.
    async fn renew(&self, only_if_due: bool) -> Result<bool> {
        let mut lease_started = self.lease_started.lock().await;
        self.ensure_active()?;

        if only_if_due && !self.renewal_due(*lease_started) {
            return Ok(false);
        }

        match self
            .backend
            .compare_and_swap(&self.key, &self.token, &self.token, self.ttl_seconds)
            .await?
        {
            SwapOutcome::Swapped(_) => {
                *lease_started = Instant::now();
                debug!(lock_key = %self.key, ttl_seconds = self.ttl_seconds, "Renewed lock lease");
                Ok(true)
            }
            SwapOutcome::PreconditionFailed => {
                self.finish(LockState::Expired);
                warn!(lock_key = %self.key, "Lock lease lost before renewal");
                Err(LockError::LockExpired { key: self.key.clone() })
            }
        }
    }

    async fn release(&self) -> Result<()> {
        let _lease = self.lease_started.lock().await;
        self.ensure_active()?;

        match self.backend.compare_and_delete(&self.key, &self.token).await? {
            DeleteOutcome::Deleted => {
                self.finish(LockState::Released);
                info!(lock_key = %self.key, "Lock released");
                Ok(())
            }
            DeleteOutcome::PreconditionFailed => {
                self.finish(LockState::Expired);
                warn!(lock_key = %self.key, "Lock lease had already lapsed at release");
                Err(LockError::LockExpired { key: self.key.clone() })
            }
        }
    }
}

async fn renewal_loop(inner: Arc<SessionInner>) {
    let check_interval = inner.check_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = ticker.tick() => {
                match inner.renew(true).await {
                    Ok(_) => {}
                    Err(LockError::LockExpired { .. } | LockError::LockNotHeld { .. }) => break,
                    Err(e) => {
                        // The lease may still be valid; try again next tick
                        warn!(lock_key = %inner.key, error = %e, "Lock renewal failed");
                    }
                }
            }
        }
    }

    debug!(lock_key = %inner.key, "Renewal loop stopped");
}

/// A lock held by this process.
///
/// While the session is [`LockState::Active`] a background task keeps the lease alive.
/// Release it explicitly with [`LockSession::release`]; dropping an active session stops
/// renewal and releases the key in the background on a best-effort basis.
pub struct LockSession {
    inner: Arc<SessionInner>,
    renewal: JoinHandle<()>,
}

impl LockSession {
    /// Wrap a freshly written lock key and start renewing it.
    ///
    /// The lease is checked at least four times per period whatever `check_interval` says.
    pub(crate) fn start(
        backend: Arc<dyn CoordinationBackend>,
        key: String,
        token: String,
        ttl_seconds: u64,
        check_interval: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(LockState::Active);
        let inner = Arc::new(SessionInner {
            backend,
            key,
            token,
            ttl_seconds,
            check_interval: effective_check_interval(ttl_seconds, check_interval),
            lease_started: Mutex::new(Instant::now()),
            state_tx,
            stop: CancellationToken::new(),
        });

        let renewal = tokio::spawn(renewal_loop(inner.clone()));

        Self { inner, renewal }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The ownership token stored as the key's value
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.inner.ttl_seconds
    }

    pub fn state(&self) -> LockState {
        self.inner.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LockState::Active
    }

    /// Subscribe to state changes, e.g. to stop work when the lease is lost
    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether the background renewal task is still running
    pub fn is_renewing(&self) -> bool {
        !self.renewal.is_finished()
    }

    /// Extend the lease now.
    ///
    /// Fails with `LockNotHeld` once the session is no longer active, and with `LockExpired`
    /// if the backend no longer holds this session's token.
    pub async fn renew_lock(&self) -> Result<()> {
        self.inner.renew(false).await.map(|_| ())
    }

    /// Delete the key if it still holds this session's token.
    ///
    /// A second call fails with `LockNotHeld`. A backend error leaves the session active.
    pub async fn release(&self) -> Result<()> {
        self.inner.release().await
    }
}

impl std::fmt::Debug for LockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSession")
            .field("key", &self.inner.key)
            .field("ttl_seconds", &self.inner.ttl_seconds)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        self.inner.stop.cancel();

        if self.inner.state() != LockState::Active {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    match inner.release().await {
                        Ok(()) => debug!(lock_key = %inner.key, "Released lock of dropped session"),
                        Err(LockError::LockNotHeld { .. }) => {}
                        Err(e) => {
                            error!(
                                lock_key = %inner.key,
                                error = %e,
                                "Failed to release dropped lock"
                            )
                        }
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock_key = %self.inner.key,
                    "Lock session dropped outside a runtime, lease will lapse"
                );
            }
        }
    }
}
