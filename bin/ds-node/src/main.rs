//! dsync node
//!
//! Command line entry point for the coordination primitives:
//! - `elect`: join the leader election and log the role this node holds
//! - `lock`: acquire a named lock, hold it while renewing, then release it
//!
//! Configuration comes from `dsync.toml` (or `--config`) with `DSYNC_*`
//! environment overrides; a few flags override both.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ds_backend::{CoordinationBackend, EtcdClient, EtcdClientConfig, MemoryBackend};
use ds_config::{AppConfig, BackendKind, ConfigLoader};
use ds_election::{role_handler, ElectionParticipant, Role, RoleHandler};
use ds_lock::{DistributedLockService, LockState};

/// dsync node
#[derive(Parser, Debug)]
#[command(name = "ds-node")]
#[command(about = "Distributed lock and leader election node")]
struct Args {
    /// Config file (defaults to dsync.toml, config/dsync.toml, /etc/dsync/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Coordination backend
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Comma separated etcd endpoints
    #[arg(long, global = true, value_delimiter = ',')]
    endpoints: Option<Vec<String>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take part in the leader election until Ctrl-C
    Elect {
        /// Value stored in this node's election key
        #[arg(long)]
        instance_id: Option<String>,

        /// Lease TTL of the election node in seconds
        #[arg(long)]
        election_timeout: Option<u64>,
    },

    /// Acquire a lock, hold it, then release it
    Lock {
        /// Lock name
        name: String,

        /// Lease TTL in seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// How long to hold the lock; until Ctrl-C if omitted
        #[arg(long)]
        hold_seconds: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Etcd,
    Memory,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Etcd => BackendKind::Etcd,
            BackendArg::Memory => BackendKind::Memory,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    ds_common::logging::init_logging("ds-node");

    let args = Args::parse();
    let config = load_config(&args)?;
    let backend = connect_backend(&config)?;
    let shutdown = ds_common::shutdown_on_ctrl_c();

    match args.command {
        Command::Elect {
            instance_id,
            election_timeout,
        } => {
            let mut config = config;
            if let Some(id) = instance_id {
                config.election.instance_id = id;
            }
            if let Some(secs) = election_timeout {
                config.election.election_timeout_seconds = secs;
            }
            config.validate()?;
            run_election(&config, backend, shutdown).await
        }
        Command::Lock {
            name,
            ttl,
            hold_seconds,
        } => {
            let ttl = ttl.unwrap_or(config.lock.default_ttl_seconds);
            let hold = hold_seconds.map(Duration::from_secs);
            hold_lock(&config, backend, &name, ttl, hold, shutdown).await
        }
    }
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("Failed to load configuration")?;

    if let Some(backend) = args.backend {
        config.backend.kind = backend.into();
    }
    if let Some(endpoints) = &args.endpoints {
        config.backend.endpoints = endpoints.clone();
    }
    config.validate()?;
    Ok(config)
}

fn connect_backend(config: &AppConfig) -> Result<Arc<dyn CoordinationBackend>> {
    match config.backend.kind {
        BackendKind::Etcd => {
            info!(endpoints = ?config.backend.endpoints, "Using etcd backend");
            let client_config = EtcdClientConfig::new(config.backend.endpoints.clone())
                .with_request_timeout(config.request_timeout());
            Ok(Arc::new(EtcdClient::new(client_config)?))
        }
        BackendKind::Memory => {
            warn!("Using in-memory backend; state is local to this process");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

async fn run_election(
    config: &AppConfig,
    backend: Arc<dyn CoordinationBackend>,
    shutdown: CancellationToken,
) -> Result<()> {
    let election_config = config.election_config()?;
    let instance_id = election_config.instance_id.clone();

    let participant = ElectionParticipant::new(
        backend,
        election_config,
        heartbeat_handler(Role::Master, instance_id.clone()),
        heartbeat_handler(Role::Secondary, instance_id),
    )?;

    participant.run(shutdown).await?;
    Ok(())
}

/// Logs the held role every few seconds until cancelled
fn heartbeat_handler(role: Role, instance_id: String) -> RoleHandler {
    role_handler(move |token: CancellationToken| {
        let instance_id = instance_id.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        info!(instance_id = %instance_id, role = %role, "Holding role")
                    }
                }
            }
            info!(instance_id = %instance_id, role = %role, "Role handler stopped");
        }
    })
}

async fn hold_lock(
    config: &AppConfig,
    backend: Arc<dyn CoordinationBackend>,
    name: &str,
    ttl: u64,
    hold: Option<Duration>,
    shutdown: CancellationToken,
) -> Result<()> {
    let service = DistributedLockService::with_config(backend, config.lock_service_config());

    info!(lock = %name, ttl_secs = ttl, "Acquiring lock");
    let session = tokio::select! {
        _ = shutdown.cancelled() => {
            info!(lock = %name, "Shutdown before the lock was acquired");
            return Ok(());
        }
        acquired = service.acquire(name, ttl) => acquired?,
    };
    info!(key = %session.key(), token = %session.token(), "Lock acquired");

    let mut state = session.subscribe();
    let held_for = async {
        match hold {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = held_for => info!(key = %session.key(), "Hold time elapsed"),
        _ = shutdown.cancelled() => info!(key = %session.key(), "Shutdown requested"),
        Ok(_) = state.wait_for(|s| *s == LockState::Expired) => {
            error!(key = %session.key(), "Lock lease was lost while held");
            anyhow::bail!("lock {} expired while held", session.key());
        }
    }

    session.release().await?;
    info!(key = %session.key(), "Lock released");
    Ok(())
}
