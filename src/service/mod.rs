//! Process wiring for the two long-running roles and the one-shot CLI
//! commands: build the transport, store and runtime, connect the bus, and
//! hand the assembled pieces to the lifecycle manager or worker processor.

use crate::bus::{AmqpTransport, BusClient};
use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::store::{RedisStore, StateStore};
use crate::worker::{EchoCapability, FileVault, WorkerProcessor};
use anyhow::{Context, Result};
use directories::UserDirs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A fully wired control plane.
pub struct Orchestrator {
    pub bus: Arc<BusClient>,
    pub lifecycle: Arc<LifecycleManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Connect to broker, store and container engine, then start the
    /// background sweeps and the dead-letter consumer.
    pub async fn start(config: Config) -> Result<Self> {
        let (bus, lifecycle) = connect_control_plane(config).await?;

        let mut tasks = lifecycle.spawn_sweeps();
        tasks.push(tokio::spawn(supervise_dead_letter_consumer(bus.clone())));

        Ok(Self {
            bus,
            lifecycle,
            tasks,
        })
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down orchestrator");
        for task in self.tasks {
            task.abort();
        }
        self.bus.cleanup().await?;
        Ok(())
    }
}

/// Keep the dead-letter retry path alive for the life of the process:
/// when the consumer stream ends (broker restart, channel loss) the bus
/// reconnects with its usual backoff and the consumer is resubscribed.
/// Exits only when reconnection is exhausted.
async fn supervise_dead_letter_consumer(bus: Arc<BusClient>) {
    loop {
        match bus.run_dead_letter_consumer().await {
            Ok(()) => warn!("dead-letter consumer stream ended"),
            Err(e) => error!("dead-letter consumer stopped: {e}"),
        }
        match bus.reconnect().await {
            Ok(()) => info!("restarting dead-letter consumer"),
            Err(e) => {
                error!("giving up on the dead-letter consumer: {e}");
                return;
            }
        }
    }
}

/// Build bus, store, runtime and lifecycle manager without background
/// tasks. Used by the one-shot CLI commands.
pub async fn connect_control_plane(
    config: Config,
) -> Result<(Arc<BusClient>, Arc<LifecycleManager>)> {
    let transport = Arc::new(AmqpTransport::new(&config.broker.url));
    let bus = Arc::new(BusClient::new(transport, config.broker.clone()));
    bus.connect().await?;

    let store: Arc<dyn StateStore> = Arc::new(RedisStore::connect(&config.store.url).await?);
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(config.runtime.clone())?);

    let lifecycle = Arc::new(LifecycleManager::new(store, runtime, bus.clone(), config));
    Ok((bus, lifecycle))
}

/// Run the control plane until Ctrl-C.
pub async fn run_orchestrator(config: Config) -> Result<()> {
    let orchestrator = Orchestrator::start(config).await?;
    info!("orchestrator running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    orchestrator.shutdown().await
}

/// Run one worker instance until Ctrl-C. Identity comes from the bootstrap
/// environment the lifecycle manager injects at container start.
pub async fn run_worker(config: Config) -> Result<()> {
    let agent_id = std::env::var("SWARMLET_AGENT_ID")
        .context("SWARMLET_AGENT_ID is not set; workers are started by the orchestrator")?;
    let instance_id = std::env::var("SWARMLET_INSTANCE_ID")
        .context("SWARMLET_INSTANCE_ID is not set; workers are started by the orchestrator")?;

    let transport = Arc::new(AmqpTransport::new(&config.broker.url));
    let bus = Arc::new(
        BusClient::new(transport, config.broker.clone()).with_instance_identity(&instance_id),
    );
    bus.connect().await?;

    let vault = FileVault::new(&vault_dir(&config), config.vault.encrypt);
    let worker = WorkerProcessor::new(
        bus.clone(),
        agent_id,
        instance_id,
        Arc::new(EchoCapability::new()),
        vault,
    );
    let subscription = worker.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down worker");
    bus.unsubscribe(&subscription).await?;
    bus.cleanup().await?;
    Ok(())
}

/// Resolve the vault directory: absolute paths as given, relative paths
/// under `~/.swarmlet/`.
fn vault_dir(config: &Config) -> PathBuf {
    if config.vault.dir.is_absolute() {
        return config.vault.dir.clone();
    }
    match UserDirs::new() {
        Some(dirs) => dirs
            .home_dir()
            .join(".swarmlet")
            .join(&config.vault.dir),
        None => config.vault.dir.clone(),
    }
}
