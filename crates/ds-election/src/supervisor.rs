//! Role handler supervision
//!
//! Keeps at most one caller-supplied role handler running. Switching roles
//! cancels the running handler's token first and only then starts the next
//! handler with a fresh token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Role a participant currently plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Caller work started on a role transition. The token is cancelled when
/// the role is lost; handlers are expected to return soon after.
pub type RoleHandler = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`RoleHandler`].
pub fn role_handler<F, Fut>(f: F) -> RoleHandler
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |token| f(token).boxed())
}

struct RunningHandler {
    role: Role,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the single running role handler task
pub struct RoleHandlerSupervisor {
    running: Option<RunningHandler>,
    cancel_grace: Option<Duration>,
}

impl RoleHandlerSupervisor {
    pub fn new(cancel_grace: Option<Duration>) -> Self {
        Self {
            running: None,
            cancel_grace,
        }
    }

    /// Role of the handler currently running, if any
    pub fn current_role(&self) -> Option<Role> {
        self.running.as_ref().map(|r| r.role)
    }

    /// Cancel whatever is running, then start `handler` for `role`.
    pub fn switch_to(&mut self, role: Role, handler: &RoleHandler) {
        self.cancel_current();
        self.start(role, handler);
    }

    /// Start `handler` with a fresh token. Any running handler must have been
    /// cancelled already.
    pub fn start(&mut self, role: Role, handler: &RoleHandler) {
        debug_assert!(self.running.is_none(), "role handler already running");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler(cancel.clone()));
        info!(role = %role, "Started role handler");

        self.running = Some(RunningHandler { role, cancel, task });
    }

    /// Cancel the running handler without waiting for it.
    ///
    /// A detached task watches the cancelled handler and warns if it is still
    /// running after the grace period.
    pub fn cancel_current(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.cancel.cancel();
        debug!(role = %running.role, "Cancelled role handler");

        let grace = self.cancel_grace;
        tokio::spawn(async move {
            let RunningHandler { role, mut task, .. } = running;
            match grace {
                Some(grace) => await_exit(role, &mut task, grace).await,
                None => report_exit(role, task.await),
            }
        });
    }

    /// Cancel the running handler, if any, and wait up to the grace period
    /// for it to finish.
    pub async fn shutdown(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        running.cancel.cancel();
        debug!(role = %running.role, "Cancelled role handler for shutdown");

        if let Some(grace) = self.cancel_grace {
            await_exit(running.role, &mut running.task, grace).await;
        }
    }
}

/// Wait up to `grace` for a cancelled handler
async fn await_exit(role: Role, task: &mut JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, task).await {
        Ok(joined) => report_exit(role, joined),
        Err(_) => warn!(
            role = %role,
            grace_ms = grace.as_millis() as u64,
            "Role handler still running after grace period"
        ),
    }
}

fn report_exit(role: Role, joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => debug!(role = %role, "Role handler finished"),
        Err(e) if e.is_panic() => error!(role = %role, "Role handler panicked"),
        Err(e) => warn!(role = %role, error = %e, "Role handler task failed"),
    }
}
