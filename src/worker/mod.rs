//! Worker-side command processor.
//!
//! Runs inside each worker container: registers its instance, consumes the
//! instance queue, dispatches commands and events to the task capability,
//! and publishes exactly one response per request. Capability failures are
//! reported as `error` responses and never surface as bus-level failures;
//! only infrastructure faults (a response that cannot be published) leave
//! the delivery unacknowledged for retry.

pub mod vault;

pub use vault::FileVault;

use crate::bus::{BusClient, BusError, EnvelopeHandler, SubscribeOptions, Subscription,
    SubscriptionScope};
use crate::protocol::{CommandPayload, Envelope, EnvelopeBody, EnvelopeKind, EventPayload,
    ResponseOutcome, ResponsePayload, TaskChunk, TaskChunkKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The opaque unit of work a worker hosts. `invoke` runs one task;
/// `export_state` / `import_state` serialize its per-user memory for the
/// freeze/unfreeze cycle.
#[async_trait]
pub trait TaskCapability: Send + Sync {
    async fn invoke(&self, user_id: &str, message: &str) -> anyhow::Result<Vec<TaskChunk>>;

    async fn export_state(&self, user_id: &str) -> anyhow::Result<String>;

    async fn import_state(&self, user_id: &str, state: &str) -> anyhow::Result<()>;
}

/// Built-in capability that echoes messages and remembers the last one per
/// user. Stands in until a real capability is wired up.
#[derive(Debug, Default)]
pub struct EchoCapability {
    last_messages: Mutex<HashMap<String, String>>,
}

impl EchoCapability {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskCapability for EchoCapability {
    async fn invoke(&self, user_id: &str, message: &str) -> anyhow::Result<Vec<TaskChunk>> {
        self.last_messages
            .lock()
            .insert(user_id.to_string(), message.to_string());
        Ok(vec![TaskChunk {
            kind: TaskChunkKind::Agent,
            content: format!("echo: {message}"),
        }])
    }

    async fn export_state(&self, user_id: &str) -> anyhow::Result<String> {
        let last = self.last_messages.lock().get(user_id).cloned();
        Ok(serde_json::to_string(&last)?)
    }

    async fn import_state(&self, user_id: &str, state: &str) -> anyhow::Result<()> {
        let last: Option<String> = serde_json::from_str(state)?;
        if let Some(last) = last {
            self.last_messages.lock().insert(user_id.to_string(), last);
        }
        Ok(())
    }
}

/// One worker instance's processing loop.
#[derive(Clone)]
pub struct WorkerProcessor {
    bus: Arc<BusClient>,
    agent_id: String,
    instance_id: String,
    capability: Arc<dyn TaskCapability>,
    vault: FileVault,
}

impl WorkerProcessor {
    pub fn new(
        bus: Arc<BusClient>,
        agent_id: impl Into<String>,
        instance_id: impl Into<String>,
        capability: Arc<dyn TaskCapability>,
        vault: FileVault,
    ) -> Self {
        Self {
            bus,
            agent_id: agent_id.into(),
            instance_id: instance_id.into(),
            capability,
            vault,
        }
    }

    /// Register the instance and start consuming its queue. Returns the
    /// subscription handle so the caller can shut the consumer down.
    pub async fn start(&self) -> Result<Subscription, BusError> {
        self.bus
            .register_instance(&self.agent_id, &self.instance_id)
            .await?;

        let worker = self.clone();
        let handler: EnvelopeHandler = Arc::new(move |envelope| {
            let worker = worker.clone();
            Box::pin(async move { worker.handle_envelope(envelope).await })
        });

        let subscription = self
            .bus
            .subscribe(
                &self.agent_id,
                SubscriptionScope::Instance(self.instance_id.clone()),
                SubscribeOptions::default(),
                handler,
            )
            .await?;
        info!(
            agent_id = %self.agent_id,
            instance_id = %self.instance_id,
            "worker processor started"
        );
        Ok(subscription)
    }

    /// Dispatch one envelope and publish its response.
    async fn handle_envelope(&self, envelope: Envelope) -> anyhow::Result<()> {
        if envelope.kind() == EnvelopeKind::Response {
            // Not addressed to workers; acknowledge and move on.
            debug!(message_id = %envelope.metadata.message_id, "ignoring response envelope");
            return Ok(());
        }

        let user_id = envelope.body.user_id().to_string();
        let request_id = envelope.body.request_id().to_string();
        let priority = envelope.metadata.priority;

        let outcome = match &envelope.body {
            EnvelopeBody::Command(command) => self.run_command(command).await,
            EnvelopeBody::Event(EventPayload::HealthCheck { .. }) => ResponseOutcome::Healthy,
            EnvelopeBody::Response(_) => unreachable!("handled above"),
        };

        if let ResponseOutcome::Error { error } = &outcome {
            warn!(user_id, request_id, "command failed in worker: {error}");
        }

        self.bus
            .publish(
                &self.agent_id,
                EnvelopeBody::Response(ResponsePayload {
                    user_id,
                    request_id,
                    outcome,
                }),
                priority,
            )
            .await?;
        Ok(())
    }

    async fn run_command(&self, command: &CommandPayload) -> ResponseOutcome {
        match command {
            CommandPayload::ProcessMessage {
                user_id, message, ..
            } => match self.capability.invoke(user_id, message).await {
                Ok(chunks) => ResponseOutcome::TaskOutput { chunks },
                Err(e) => ResponseOutcome::Error {
                    error: format!("{e:#}"),
                },
            },
            CommandPayload::SaveState { user_id, .. } => match self.save_state(user_id).await {
                Ok(()) => ResponseOutcome::StateSaved,
                Err(e) => ResponseOutcome::Error {
                    error: format!("{e:#}"),
                },
            },
            CommandPayload::LoadState { user_id, .. } => match self.load_state(user_id).await {
                Ok(()) => ResponseOutcome::StateLoaded,
                Err(e) => ResponseOutcome::Error {
                    error: format!("{e:#}"),
                },
            },
        }
    }

    async fn save_state(&self, user_id: &str) -> anyhow::Result<()> {
        let state = self.capability.export_state(user_id).await?;
        self.vault.store(user_id, &state)?;
        Ok(())
    }

    async fn load_state(&self, user_id: &str) -> anyhow::Result<()> {
        // A user with no saved state is a fresh agent, not an error.
        if let Some(state) = self.vault.fetch(user_id)? {
            self.capability.import_state(user_id, &state).await?;
        }
        Ok(())
    }
}
