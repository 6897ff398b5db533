//! Agent lifecycle manager.
//!
//! Owns the per-agent state machine (starting, active, frozen, stopping,
//! error) and every transition between states: creation with admission
//! limits, inactivity freeze with state save, unfreeze with state restore,
//! recovery of errored agents, and fleet termination. Persisted status in
//! the state store is authoritative; containers and bus registrations are
//! driven to match it.

use crate::bus::{BusClient, BusError};
use crate::config::{Config, HealthFailurePolicy};
use crate::gateway::{Gateway, GatewayError};
use crate::protocol::{CommandPayload, EnvelopeBody, EventPayload, Priority, ResponseOutcome};
use crate::runtime::ContainerRuntime;
use crate::store::{AgentState, AgentStatus, StateStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("user {user_id} has reached the limit of {limit} agents")]
    UserLimit { user_id: String, limit: usize },

    #[error("system limit of {limit} agents reached")]
    SystemLimit { limit: usize },

    #[error("agent {agent_id} failed to become ready within {timeout_secs}s")]
    StartupTimeout { agent_id: String, timeout_secs: u64 },

    #[error("no state found for agent {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("agent {agent_id} has no container to operate on")]
    MissingContainer { agent_id: String },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a fleet termination.
#[derive(Debug, Default)]
pub struct TerminationReport {
    pub success: bool,
    pub terminated: Vec<String>,
    pub failed: Vec<FailedTermination>,
}

#[derive(Debug)]
pub struct FailedTermination {
    pub agent_id: String,
    pub error: String,
}

/// Fleet-wide status counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationStatus {
    pub active_agents: usize,
    pub frozen_agents: usize,
    pub failed_agents: usize,
}

pub struct LifecycleManager {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    bus: Arc<BusClient>,
    gateway: Gateway,
    config: Config,
    /// Serializes limit check, container start and initial persist so
    /// concurrent signups cannot slip past the caps.
    admission: tokio::sync::Mutex<()>,
    /// Consecutive health probe failures per agent id.
    health_failures: Mutex<HashMap<String, u32>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        bus: Arc<BusClient>,
        config: Config,
    ) -> Self {
        Self {
            store,
            runtime,
            gateway: Gateway::new(bus.clone()),
            bus,
            config,
            admission: tokio::sync::Mutex::new(()),
            health_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point for any user-originated activity. Creates, unfreezes or
    /// recovers the user's agent as needed and returns its id.
    pub async fn handle_user_activity(&self, user_id: &str) -> Result<String, LifecycleError> {
        let state = match self.store.agent_id_for_user(user_id).await? {
            Some(agent_id) => self.store.agent_state(&agent_id).await?,
            None => None,
        };

        match state {
            None => self.create_agent(user_id).await,
            Some(state) if state.status == AgentStatus::Frozen => {
                self.unfreeze_agent(state).await
            }
            Some(state) if state.status == AgentStatus::Error => self.recover_agent(state).await,
            Some(mut state) => {
                state.last_activity = Utc::now();
                self.store.save(&state).await?;
                Ok(state.agent_id)
            }
        }
    }

    /// Create and start a fresh agent for `user_id`.
    pub async fn create_agent(&self, user_id: &str) -> Result<String, LifecycleError> {
        // The random tail keeps ids fresh when recovery recreates an agent
        // within the same millisecond.
        let agent_id = format!(
            "agent-{user_id}-{}-{}",
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..6]
        );
        let instance_id = format!("inst-{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!(user_id, agent_id, "creating agent");

        // Admission and the initial persist happen under one lock so two
        // concurrent signups both see the other's starting record.
        {
            let _admission = self.admission.lock().await;
            self.check_limits(user_id).await?;

            // Declare the instance queue before the container starts so
            // nothing published during boot is lost.
            self.bus.register_instance(&agent_id, &instance_id).await?;

            let container_id = match self
                .runtime
                .create_and_start(user_id, &agent_id, self.bootstrap_env(&agent_id, &instance_id, user_id))
                .await
            {
                Ok(container_id) => container_id,
                Err(e) => {
                    self.bus.deregister_instance(&agent_id, &instance_id);
                    return Err(e.into());
                }
            };

            let mut state = AgentState::starting(user_id, &agent_id);
            state.container_id = Some(container_id);
            state.instance_id = Some(instance_id.clone());
            self.store.save(&state).await?;
        }

        match self.wait_for_ready(&agent_id).await {
            Ok(()) => {
                self.transition(&agent_id, AgentStatus::Active, None).await?;
                info!(agent_id, "agent created");
                Ok(agent_id)
            }
            Err(e) => {
                self.transition(&agent_id, AgentStatus::Error, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Save the agent's state and stop its container. Only active agents
    /// freeze; any failure along the way moves the agent to `error`.
    pub async fn freeze_agent(&self, agent_id: &str) -> Result<(), LifecycleError> {
        let state = self.require_state(agent_id).await?;
        if state.status != AgentStatus::Active {
            debug!(agent_id, status = %state.status, "skipping freeze");
            return Ok(());
        }
        info!(agent_id, "freezing agent");

        self.transition(agent_id, AgentStatus::Stopping, None).await?;
        match self.try_freeze(&state).await {
            Ok(()) => {
                info!(agent_id, "agent frozen");
                Ok(())
            }
            Err(e) => {
                warn!(agent_id, "freeze failed: {e}");
                self.transition(agent_id, AgentStatus::Error, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn try_freeze(&self, state: &AgentState) -> Result<(), LifecycleError> {
        let container_id = state
            .container_id
            .as_deref()
            .ok_or_else(|| LifecycleError::MissingContainer {
                agent_id: state.agent_id.clone(),
            })?;

        let response = self
            .gateway
            .publish_and_await(
                &state.agent_id,
                EnvelopeBody::Command(CommandPayload::SaveState {
                    user_id: state.user_id.clone(),
                    request_id: Uuid::new_v4().to_string(),
                }),
                Priority::High,
                Duration::from_secs(self.config.lifecycle.command_timeout_secs),
            )
            .await?;
        if let ResponseOutcome::Error { error } = response.outcome {
            return Err(anyhow::anyhow!("SAVE_STATE failed in worker: {error}").into());
        }

        self.runtime.stop(container_id).await?;

        let mut state = self.require_state(&state.agent_id).await?;
        state.status = AgentStatus::Frozen;
        state.last_frozen = Some(Utc::now());
        self.store.save(&state).await?;
        Ok(())
    }

    /// Resume the container of a frozen agent, restore its state and mark
    /// it active again. Returns the (unchanged) agent id.
    pub async fn unfreeze_agent(&self, state: AgentState) -> Result<String, LifecycleError> {
        let agent_id = state.agent_id.clone();
        info!(agent_id, "unfreezing agent");

        self.transition(&agent_id, AgentStatus::Starting, None).await?;
        match self.try_unfreeze(&state).await {
            Ok(()) => {
                info!(agent_id, "agent unfrozen");
                Ok(agent_id)
            }
            Err(e) => {
                warn!(agent_id, "unfreeze failed: {e}");
                self.transition(&agent_id, AgentStatus::Error, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn try_unfreeze(&self, state: &AgentState) -> Result<(), LifecycleError> {
        let container_id = state
            .container_id
            .as_deref()
            .ok_or_else(|| LifecycleError::MissingContainer {
                agent_id: state.agent_id.clone(),
            })?;

        self.runtime.resume(container_id).await?;
        self.ensure_registered(state).await?;
        self.wait_for_ready(&state.agent_id).await?;

        let response = self
            .gateway
            .publish_and_await(
                &state.agent_id,
                EnvelopeBody::Command(CommandPayload::LoadState {
                    user_id: state.user_id.clone(),
                    request_id: Uuid::new_v4().to_string(),
                }),
                Priority::High,
                Duration::from_secs(self.config.lifecycle.command_timeout_secs),
            )
            .await?;
        if let ResponseOutcome::Error { error } = response.outcome {
            return Err(anyhow::anyhow!("LOAD_STATE failed in worker: {error}").into());
        }

        let mut state = self.require_state(&state.agent_id).await?;
        let now = Utc::now();
        state.status = AgentStatus::Active;
        state.last_activity = now;
        state.last_unfrozen = Some(now);
        self.store.save(&state).await?;
        Ok(())
    }

    /// Replace an errored agent: discard the old container and record, then
    /// create a fresh agent for the same user.
    pub async fn recover_agent(&self, state: AgentState) -> Result<String, LifecycleError> {
        info!(agent_id = %state.agent_id, "recovering agent");

        if let Some(container_id) = &state.container_id {
            self.runtime.remove(container_id, true).await?;
        }
        if let Some(instance_id) = &state.instance_id {
            self.bus.deregister_instance(&state.agent_id, instance_id);
        }
        // The errored record would otherwise linger forever under the old
        // agent id.
        self.store.delete(&state.user_id, &state.agent_id).await?;
        self.health_failures.lock().remove(&state.agent_id);

        self.create_agent(&state.user_id).await
    }

    /// Forcefully terminate one agent and erase its records.
    pub async fn kill_agent(&self, agent_id: &str) -> Result<(), LifecycleError> {
        let state = self.require_state(agent_id).await?;
        info!(agent_id, "killing agent");

        if let Some(container_id) = &state.container_id {
            self.runtime.remove(container_id, true).await?;
        }
        if let Some(instance_id) = &state.instance_id {
            self.bus.deregister_instance(agent_id, instance_id);
        }
        self.store.delete(&state.user_id, agent_id).await?;
        self.health_failures.lock().remove(agent_id);
        Ok(())
    }

    /// Terminate every live agent concurrently, bounding each kill by the
    /// configured timeout, and report which succeeded.
    pub async fn kill_all_agents(&self) -> Result<TerminationReport, LifecycleError> {
        let states = self.store.all_agent_states().await?;
        let targets: Vec<_> = states
            .into_iter()
            .filter(|s| s.status.counts_toward_limits() && s.container_id.is_some())
            .collect();

        let mut report = TerminationReport {
            success: true,
            ..TerminationReport::default()
        };
        if targets.is_empty() {
            info!("no live agents to terminate");
            return Ok(report);
        }
        info!(count = targets.len(), "terminating all live agents");

        let kill_timeout = Duration::from_secs(self.config.lifecycle.kill_timeout_secs);
        let kills = targets.iter().map(|state| {
            let agent_id = state.agent_id.clone();
            async move {
                let outcome = tokio::time::timeout(kill_timeout, self.kill_agent(&agent_id)).await;
                let result: Result<(), String> = match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {kill_timeout:?}")),
                };
                (agent_id, result)
            }
        });

        for (agent_id, result) in futures_util::future::join_all(kills).await {
            match result {
                Ok(()) => report.terminated.push(agent_id),
                Err(error) => {
                    report.success = false;
                    report.failed.push(FailedTermination { agent_id, error });
                }
            }
        }
        info!(
            terminated = report.terminated.len(),
            failed = report.failed.len(),
            "fleet termination finished"
        );
        Ok(report)
    }

    pub async fn termination_status(&self) -> Result<TerminationStatus, LifecycleError> {
        let states = self.store.all_agent_states().await?;
        Ok(TerminationStatus {
            active_agents: states
                .iter()
                .filter(|s| s.status.counts_toward_limits())
                .count(),
            frozen_agents: states
                .iter()
                .filter(|s| s.status == AgentStatus::Frozen)
                .count(),
            failed_agents: states
                .iter()
                .filter(|s| s.status == AgentStatus::Error)
                .count(),
        })
    }

    /// One pass of the inactivity monitor: freeze every active agent whose
    /// last activity is older than the timeout.
    pub async fn run_inactivity_sweep_once(&self) {
        let states = match self.store.all_agent_states().await {
            Ok(states) => states,
            Err(e) => {
                error!("inactivity sweep could not list agents: {e:#}");
                return;
            }
        };

        let cutoff = chrono::Duration::seconds(self.config.lifecycle.inactivity_timeout_secs as i64);
        let now = Utc::now();
        for state in states {
            if state.status != AgentStatus::Active {
                continue;
            }
            if now - state.last_activity > cutoff {
                info!(agent_id = %state.agent_id, "freezing inactive agent");
                if let Err(e) = self.freeze_agent(&state.agent_id).await {
                    warn!(agent_id = %state.agent_id, "inactivity freeze failed: {e}");
                }
            }
        }
    }

    /// One pass of the health monitor: refresh resource snapshots and probe
    /// each active agent, applying the configured failure policy.
    pub async fn run_health_sweep_once(&self) {
        let states = match self.store.all_agent_states().await {
            Ok(states) => states,
            Err(e) => {
                error!("health sweep could not list agents: {e:#}");
                return;
            }
        };

        for state in states {
            if state.status != AgentStatus::Active {
                continue;
            }
            self.check_agent_health(&state).await;
        }
    }

    async fn check_agent_health(&self, state: &AgentState) {
        let agent_id = &state.agent_id;

        if let Some(container_id) = &state.container_id {
            match self.runtime.stats(container_id).await {
                Ok(stats) => {
                    if let Ok(Some(mut fresh)) = self.store.agent_state(agent_id).await {
                        fresh.memory_usage = Some(stats.memory_bytes);
                        fresh.cpu_usage = Some(stats.cpu_total);
                        if let Err(e) = self.store.save(&fresh).await {
                            warn!(agent_id, "failed to persist resource snapshot: {e:#}");
                        }
                    }
                }
                Err(e) => warn!(agent_id, "stats unavailable: {e:#}"),
            }
        }

        if let Err(e) = self.ensure_registered(state).await {
            warn!(agent_id, "could not re-register instance: {e}");
        }

        let probe = self
            .gateway
            .publish_and_await(
                agent_id,
                EnvelopeBody::Event(EventPayload::HealthCheck {
                    user_id: state.user_id.clone(),
                    request_id: Uuid::new_v4().to_string(),
                }),
                Priority::Low,
                Duration::from_secs(self.config.lifecycle.command_timeout_secs),
            )
            .await;

        match probe {
            Ok(response) if matches!(response.outcome, ResponseOutcome::Healthy) => {
                self.health_failures.lock().remove(agent_id);
            }
            Ok(response) => {
                warn!(agent_id, outcome = ?response.outcome, "unexpected health answer");
                self.record_health_failure(agent_id).await;
            }
            Err(e) => {
                warn!(agent_id, "health probe failed: {e}");
                self.record_health_failure(agent_id).await;
            }
        }
    }

    async fn record_health_failure(&self, agent_id: &str) {
        let failures = {
            let mut map = self.health_failures.lock();
            let count = map.entry(agent_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        match self.config.lifecycle.health_failure_policy {
            HealthFailurePolicy::Ignore => {
                debug!(agent_id, failures, "health failure recorded (policy: ignore)");
            }
            HealthFailurePolicy::MarkError => {
                if failures >= self.config.lifecycle.health_failure_threshold {
                    warn!(agent_id, failures, "marking unhealthy agent as errored");
                    if let Err(e) = self
                        .transition(agent_id, AgentStatus::Error, Some("health probes failing".into()))
                        .await
                    {
                        error!(agent_id, "failed to persist error status: {e}");
                    }
                    self.health_failures.lock().remove(agent_id);
                }
            }
        }
    }

    /// Spawn the periodic inactivity and health sweeps.
    pub fn spawn_sweeps(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let inactivity = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    manager.config.lifecycle.sweep_interval_secs,
                ));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.run_inactivity_sweep_once().await;
                }
            })
        };
        let health = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    manager.config.lifecycle.health_interval_secs,
                ));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.run_health_sweep_once().await;
                }
            })
        };
        vec![inactivity, health]
    }

    async fn check_limits(&self, user_id: &str) -> Result<(), LifecycleError> {
        let states = self.store.all_agent_states().await?;
        let live: Vec<_> = states
            .iter()
            .filter(|s| s.status.counts_toward_limits())
            .collect();

        let user_count = live.iter().filter(|s| s.user_id == user_id).count();
        if user_count >= self.config.limits.max_agents_per_user {
            return Err(LifecycleError::UserLimit {
                user_id: user_id.to_string(),
                limit: self.config.limits.max_agents_per_user,
            });
        }
        if live.len() >= self.config.limits.max_system_agents {
            return Err(LifecycleError::SystemLimit {
                limit: self.config.limits.max_system_agents,
            });
        }
        Ok(())
    }

    /// Probe the agent with health checks until it answers or the startup
    /// deadline passes.
    async fn wait_for_ready(&self, agent_id: &str) -> Result<(), LifecycleError> {
        let timeout_secs = self.config.lifecycle.startup_timeout_secs;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        let probe_interval = Duration::from_millis(self.config.lifecycle.probe_interval_ms);

        while tokio::time::Instant::now() < deadline {
            let remaining = deadline - tokio::time::Instant::now();
            let probe_timeout = remaining.min(Duration::from_secs(5));

            let probe = self
                .gateway
                .publish_and_await(
                    agent_id,
                    EnvelopeBody::Event(EventPayload::HealthCheck {
                        user_id: "system".to_string(),
                        request_id: Uuid::new_v4().to_string(),
                    }),
                    Priority::High,
                    probe_timeout,
                )
                .await;

            match probe {
                Ok(response) if matches!(response.outcome, ResponseOutcome::Healthy) => {
                    return Ok(());
                }
                Ok(response) => {
                    debug!(agent_id, outcome = ?response.outcome, "unexpected readiness answer");
                }
                Err(e) => debug!(agent_id, "readiness probe failed: {e}"),
            }
            tokio::time::sleep(probe_interval).await;
        }

        Err(LifecycleError::StartupTimeout {
            agent_id: agent_id.to_string(),
            timeout_secs,
        })
    }

    /// Re-register the persisted instance when the in-memory pool has lost
    /// it (controller restart, broker reconnect).
    async fn ensure_registered(&self, state: &AgentState) -> Result<(), LifecycleError> {
        if self.bus.pool().least_loaded(&state.agent_id).is_none() {
            if let Some(instance_id) = &state.instance_id {
                self.bus
                    .register_instance(&state.agent_id, instance_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn require_state(&self, agent_id: &str) -> Result<AgentState, LifecycleError> {
        self.store
            .agent_state(agent_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })
    }

    async fn transition(
        &self,
        agent_id: &str,
        status: AgentStatus,
        error_message: Option<String>,
    ) -> Result<(), LifecycleError> {
        let mut state = self.require_state(agent_id).await?;
        debug!(agent_id, from = %state.status, to = %status, "status transition");
        state.status = status;
        state.error_message = error_message;
        self.store.save(&state).await?;
        Ok(())
    }

    fn bootstrap_env(&self, agent_id: &str, instance_id: &str, user_id: &str) -> Vec<String> {
        vec![
            format!("SWARMLET_AGENT_ID={agent_id}"),
            format!("SWARMLET_INSTANCE_ID={instance_id}"),
            format!("SWARMLET_USER_ID={user_id}"),
            format!("SWARMLET_BROKER_URL={}", self.config.broker.url),
            format!("SWARMLET_STORE_URL={}", self.config.store.url),
        ]
    }
}
