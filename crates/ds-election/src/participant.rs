//! Ordered-key leader election
//!
//! Every participant registers a sequential node with a TTL under the
//! election key and refreshes it on each poll. The participant whose node
//! sorts first is the master; everyone else is a secondary. A crashed
//! master stops refreshing, its node expires, and the next oldest node
//! takes over on the following poll.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ds_backend::{CoordinationBackend, Node};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ElectionConfig, RefreshFailurePolicy};
use crate::error::{ElectionError, Result};
use crate::supervisor::{Role, RoleHandler, RoleHandlerSupervisor};

/// Lifecycle of an election participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    /// Registered or registering; no role decided yet
    Initializing,
    Secondary,
    Master,
    /// Shut down, failed, or gave up after a refresh failure
    Terminated,
}

impl ParticipantState {
    pub fn role(&self) -> Option<Role> {
        match self {
            ParticipantState::Master => Some(Role::Master),
            ParticipantState::Secondary => Some(Role::Secondary),
            _ => None,
        }
    }
}

impl From<Role> for ParticipantState {
    fn from(role: Role) -> Self {
        match role {
            Role::Master => ParticipantState::Master,
            Role::Secondary => ParticipantState::Secondary,
        }
    }
}

/// One participant in a leader election
pub struct ElectionParticipant {
    backend: Arc<dyn CoordinationBackend>,
    config: ElectionConfig,
    is_now_master: RoleHandler,
    is_now_secondary: RoleHandler,
    node_key: RwLock<Option<String>>,
    running: AtomicBool,
    state_tx: watch::Sender<ParticipantState>,
}

impl ElectionParticipant {
    /// Create a participant. Nothing touches the backend until [`run`](Self::run).
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        config: ElectionConfig,
        is_now_master: RoleHandler,
        is_now_secondary: RoleHandler,
    ) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ParticipantState::Initializing);

        Ok(Self {
            backend,
            config,
            is_now_master,
            is_now_secondary,
            node_key: RwLock::new(None),
            running: AtomicBool::new(false),
            state_tx,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Key of the sequential node currently registered for this participant
    pub fn node_key(&self) -> Option<String> {
        self.node_key.read().clone()
    }

    pub fn state(&self) -> ParticipantState {
        *self.state_tx.borrow()
    }

    pub fn role(&self) -> Option<Role> {
        self.state().role()
    }

    pub fn is_master(&self) -> bool {
        self.state() == ParticipantState::Master
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ParticipantState> {
        self.state_tx.subscribe()
    }

    /// Wait until this participant becomes master. Returns false if it
    /// terminates first.
    pub async fn wait_for_master(&self) -> bool {
        let mut rx = self.subscribe();
        let became_master = match rx
            .wait_for(|s| matches!(s, ParticipantState::Master | ParticipantState::Terminated))
            .await
        {
            Ok(state) => *state == ParticipantState::Master,
            Err(_) => false,
        };
        became_master
    }

    /// Take part in the election until `shutdown` is cancelled or a fatal
    /// error occurs. The running role handler is cancelled on the way out
    /// and the state ends as `Terminated`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ElectionError::AlreadyRunning);
        }

        info!(
            instance_id = %self.config.instance_id,
            election_key = %self.config.election_key,
            timeout_secs = self.config.election_timeout_seconds,
            "Starting election participant"
        );

        let mut supervisor = RoleHandlerSupervisor::new(self.config.handler_cancel_grace);
        let result = self.participate(&mut supervisor, &shutdown).await;

        supervisor.shutdown().await;
        self.state_tx.send_replace(ParticipantState::Terminated);

        match &result {
            Ok(()) => info!(instance_id = %self.config.instance_id, "Election participant stopped"),
            Err(e) => {
                error!(
                    instance_id = %self.config.instance_id,
                    error = %e,
                    "Election participant failed"
                )
            }
        }
        result
    }

    async fn participate(
        &self,
        supervisor: &mut RoleHandlerSupervisor,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let Some(registered) = until_shutdown(shutdown, self.register()).await else {
            return Ok(());
        };
        let mut node = registered?;

        loop {
            let Some(refreshed) = until_shutdown(shutdown, self.refresh(&node)).await else {
                return Ok(());
            };
            if !refreshed? {
                match self.recover_from_refresh_failure(supervisor, shutdown, node).await? {
                    Some(fresh) => {
                        node = fresh;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }

            let listing = self.backend.list_sorted(&self.config.election_key);
            let Some(listed) = until_shutdown(shutdown, listing).await else {
                return Ok(());
            };
            let nodes = listed?;
            let should_be_master = nodes.first().is_some_and(|first| first.key == node.key);

            self.apply_role(supervisor, should_be_master);
        }
    }

    async fn register(&self) -> Result<Node> {
        let node = self
            .backend
            .create_sequential(
                &self.config.election_key,
                &self.config.instance_id,
                self.config.election_timeout_seconds,
            )
            .await?;

        info!(
            instance_id = %self.config.instance_id,
            node_key = %node.key,
            "Registered election node"
        );
        self.set_node(&node);
        Ok(node)
    }

    async fn refresh(&self, node: &Node) -> Result<bool> {
        let outcome = self
            .backend
            .compare_and_swap(
                &node.key,
                &self.config.instance_id,
                &self.config.instance_id,
                self.config.election_timeout_seconds,
            )
            .await?;

        if outcome.is_swapped() {
            debug!(node_key = %node.key, "Refreshed election node");
        }
        Ok(outcome.is_swapped())
    }

    /// Step down if master, then apply the refresh failure policy. Returns
    /// the node to continue with, or `None` if shutdown was requested.
    async fn recover_from_refresh_failure(
        &self,
        supervisor: &mut RoleHandlerSupervisor,
        shutdown: &CancellationToken,
        lost: Node,
    ) -> Result<Option<Node>> {
        warn!(
            instance_id = %self.config.instance_id,
            node_key = %lost.key,
            "Election node could not be refreshed"
        );

        if self.role() == Some(Role::Master) {
            self.apply_role(supervisor, false);
        }

        match self.config.refresh_failure_policy {
            RefreshFailurePolicy::Terminate => Err(ElectionError::RefreshFailed { key: lost.key }),
            RefreshFailurePolicy::Reregister => {
                match until_shutdown(shutdown, self.register()).await {
                    Some(node) => node.map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    fn apply_role(&self, supervisor: &mut RoleHandlerSupervisor, should_be_master: bool) {
        let target = if should_be_master { Role::Master } else { Role::Secondary };
        let current = self.state();

        if current.role() == Some(target) {
            debug!(role = %target, "Role unchanged");
            return;
        }

        info!(
            instance_id = %self.config.instance_id,
            from = ?current,
            to = %target,
            "Role transition"
        );

        supervisor.cancel_current();
        self.state_tx.send_replace(target.into());
        let handler = match target {
            Role::Master => &self.is_now_master,
            Role::Secondary => &self.is_now_secondary,
        };
        supervisor.start(target, handler);
    }

    fn set_node(&self, node: &Node) {
        *self.node_key.write() = Some(node.key.clone());
    }
}

impl fmt::Debug for ElectionParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectionParticipant")
            .field("instance_id", &self.config.instance_id)
            .field("node_key", &self.node_key())
            .field("state", &self.state())
            .finish()
    }
}

async fn until_shutdown<F: Future>(shutdown: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        out = fut => Some(out),
    }
}
