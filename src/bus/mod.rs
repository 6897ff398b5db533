//! Message bus client.
//!
//! Owns broker topology (main + dead-letter exchanges), publish with
//! least-load instance selection, filtered subscriptions with the
//! ack-after-success discipline, instance registration, reconnection with
//! exponential backoff and registration replay, and the dead-letter retry
//! consumer. The broker itself sits behind the [`BusTransport`] seam.

pub mod amqp;
pub mod memory;
pub mod pool;
pub mod transport;

pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;
pub use pool::InstancePool;
pub use transport::{BusDelivery, BusTransport, DeliveryAcker, PublishProps, QueueOptions};

use crate::config::BrokerConfig;
use crate::protocol::{routing, Envelope, EnvelopeBody, EnvelopeKind, Priority};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors surfaced by bus client operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A command envelope without a user id is a construction error,
    /// rejected before publish.
    #[error("envelope payload is missing a user id")]
    MissingUserId,

    #[error("no instance available for agent {agent_id}")]
    NoInstanceAvailable { agent_id: String },

    #[error("bus transport is not connected")]
    NotConnected,

    #[error("broker could not route or buffer publish to {routing_key}")]
    PublishRejected { routing_key: String },

    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Async handler invoked per delivered envelope. The subscription task
/// acknowledges only after the handler returns `Ok`.
pub type EnvelopeHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Predicate deciding whether a delivered envelope concerns this subscriber.
pub type EnvelopeFilter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// What a subscription binds to.
#[derive(Debug, Clone)]
pub enum SubscriptionScope {
    /// Durable worker-instance queue with dead-letter configuration, bound
    /// to `agent.<agentId>.<instanceId>.#`.
    Instance(String),
    /// Auto-deleted consumer-scoped queue without dead-letter configuration,
    /// bound to `agent.<agentId>.#`. Filter-rejects vanish instead of being
    /// re-published as duplicates.
    Ephemeral(String),
}

#[derive(Default)]
pub struct SubscribeOptions {
    pub filter: Option<EnvelopeFilter>,
}

/// Handle for one active consumer, usable for [`BusClient::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    pub consumer_tag: String,
    pub queue: String,
}

/// Bus client: one per process, explicitly constructed and passed to its
/// consumers (no process-wide singleton).
pub struct BusClient {
    transport: Arc<dyn BusTransport>,
    config: BrokerConfig,
    pool: InstancePool,
    /// Instance identity stamped on responses when this client runs inside
    /// a worker container.
    identity: Option<String>,
}

impl BusClient {
    pub fn new(transport: Arc<dyn BusTransport>, config: BrokerConfig) -> Self {
        Self {
            transport,
            config,
            pool: InstancePool::new(),
            identity: None,
        }
    }

    /// Mark this client as belonging to one worker instance; its responses
    /// carry that instance id so observers can settle the load counter.
    pub fn with_instance_identity(mut self, instance_id: impl Into<String>) -> Self {
        self.identity = Some(instance_id.into());
        self
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Establish the transport and declare the exchange topology. Fails
    /// fatally when the broker is unreachable; retry belongs to the caller.
    pub async fn connect(&self) -> Result<(), BusError> {
        self.transport.connect().await?;
        self.declare_topology().await?;
        info!(exchange = %self.config.exchange, "bus connected");
        Ok(())
    }

    async fn declare_topology(&self) -> Result<(), BusError> {
        self.transport
            .declare_exchange(&self.config.exchange, true)
            .await?;
        self.transport
            .declare_exchange(&self.config.dead_letter_exchange, true)
            .await?;
        self.transport
            .declare_queue(
                &self.config.dead_letter_queue,
                &QueueOptions {
                    durable: true,
                    ..QueueOptions::default()
                },
            )
            .await?;
        self.transport
            .bind_queue(
                &self.config.dead_letter_queue,
                &self.config.dead_letter_exchange,
                "#",
            )
            .await?;
        Ok(())
    }

    /// Publish one payload to an agent.
    ///
    /// Commands and events are routed to the least-loaded registered
    /// instance; responses are published instance-less on the agent scope.
    /// Returns the stamped envelope on success.
    pub async fn publish(
        &self,
        agent_id: &str,
        body: EnvelopeBody,
        priority: Priority,
    ) -> Result<Envelope, BusError> {
        if body.user_id().trim().is_empty() {
            return Err(BusError::MissingUserId);
        }
        if !self.transport.is_connected() {
            return Err(BusError::NotConnected);
        }

        let selected = match body.kind() {
            EnvelopeKind::Response => self.identity.clone(),
            EnvelopeKind::Command | EnvelopeKind::Event => Some(
                self.pool
                    .least_loaded(agent_id)
                    .ok_or_else(|| BusError::NoInstanceAvailable {
                        agent_id: agent_id.to_string(),
                    })?,
            ),
        };

        let kind = body.kind();
        let envelope = Envelope::stamped(body, agent_id, selected.clone(), priority);
        // Responses always route on the agent scope; the instance id in
        // their metadata only records where they came from.
        let routing_key = match kind {
            EnvelopeKind::Response => routing::agent_key(agent_id, kind),
            _ => envelope.routing_key(),
        };

        let payload = serde_json::to_vec(&envelope).map_err(anyhow::Error::from)?;
        let routed = self
            .transport
            .publish(
                &self.config.exchange,
                &routing_key,
                &payload,
                PublishProps {
                    persistent: true,
                    priority: envelope.metadata.priority.level(),
                },
            )
            .await?;
        if !routed {
            return Err(BusError::PublishRejected { routing_key });
        }

        if matches!(kind, EnvelopeKind::Command | EnvelopeKind::Event) {
            if let Some(instance_id) = &selected {
                self.pool.increment(agent_id, instance_id);
            }
        }

        debug!(
            agent_id,
            routing_key,
            message_id = %envelope.metadata.message_id,
            "published envelope"
        );
        Ok(envelope)
    }

    /// Declare the queue for `scope`, bind it, and start consuming.
    ///
    /// Per delivery: unparsable envelopes and envelopes the filter declines
    /// are rejected without requeue; the handler runs otherwise and the
    /// message is acknowledged only after it returns `Ok`. A failing handler
    /// requeues the message once; on its redelivery, failure dead-letters
    /// it instead (the durable retry backstop for commands).
    pub async fn subscribe(
        &self,
        agent_id: &str,
        scope: SubscriptionScope,
        options: SubscribeOptions,
        handler: EnvelopeHandler,
    ) -> Result<Subscription, BusError> {
        let (queue, pattern, queue_options, consumer_tag) = match &scope {
            SubscriptionScope::Instance(instance_id) => (
                routing::instance_queue(agent_id, instance_id),
                routing::instance_binding(agent_id, instance_id),
                self.instance_queue_options(),
                format!("instance-{instance_id}"),
            ),
            SubscriptionScope::Ephemeral(tag) => (
                routing::consumer_queue(agent_id, tag),
                routing::agent_binding(agent_id),
                QueueOptions {
                    auto_delete: true,
                    ..QueueOptions::default()
                },
                tag.clone(),
            ),
        };

        self.transport.declare_queue(&queue, &queue_options).await?;
        self.transport
            .bind_queue(&queue, &self.config.exchange, &pattern)
            .await?;
        let mut deliveries = self.transport.consume(&queue, &consumer_tag).await?;

        let filter = options.filter;
        let task_queue = queue.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let envelope: Envelope = match serde_json::from_slice(&delivery.body) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        // Malformed data will never succeed; permanent failure.
                        warn!(queue = %task_queue, "dropping unparsable envelope: {e}");
                        let _ = delivery.acker.nack(false).await;
                        continue;
                    }
                };

                if let Some(filter) = &filter {
                    if !filter(&envelope) {
                        let _ = delivery.acker.nack(false).await;
                        continue;
                    }
                }

                match handler(envelope).await {
                    Ok(()) => {
                        let _ = delivery.acker.ack().await;
                    }
                    Err(e) => {
                        let requeue = !delivery.redelivered;
                        warn!(
                            queue = %task_queue,
                            requeue,
                            "envelope handler failed: {e:#}"
                        );
                        let _ = delivery.acker.nack(requeue).await;
                    }
                }
            }
        });

        Ok(Subscription {
            consumer_tag,
            queue,
        })
    }

    /// Cancel one consumer without affecting others bound to the same queue.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BusError> {
        self.transport.cancel(&subscription.consumer_tag).await?;
        Ok(())
    }

    /// Register a worker instance: add it to the pool and (re)declare its
    /// durable queue so publishes can reach it.
    pub async fn register_instance(
        &self,
        agent_id: &str,
        instance_id: &str,
    ) -> Result<(), BusError> {
        self.declare_instance_queue(agent_id, instance_id).await?;
        self.pool.register(agent_id, instance_id);
        info!(agent_id, instance_id, "registered instance");
        Ok(())
    }

    /// Remove a worker instance from the pool. The durable queue stays; a
    /// restarted instance re-attaches to it.
    pub fn deregister_instance(&self, agent_id: &str, instance_id: &str) {
        self.pool.deregister(agent_id, instance_id);
        info!(agent_id, instance_id, "deregistered instance");
    }

    async fn declare_instance_queue(
        &self,
        agent_id: &str,
        instance_id: &str,
    ) -> Result<(), BusError> {
        let queue = routing::instance_queue(agent_id, instance_id);
        self.transport
            .declare_queue(&queue, &self.instance_queue_options())
            .await?;
        self.transport
            .bind_queue(
                &queue,
                &self.config.exchange,
                &routing::instance_binding(agent_id, instance_id),
            )
            .await?;
        Ok(())
    }

    fn instance_queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: true,
            auto_delete: false,
            dead_letter_exchange: Some(self.config.dead_letter_exchange.clone()),
            message_ttl_ms: Some(self.config.message_ttl_ms),
            max_priority: Some(self.config.max_priority),
        }
    }

    /// Reconnect with exponential backoff (base delay doubling per attempt,
    /// capped attempts). On success, replays every registered instance's
    /// queue declaration so bindings survive a broker restart; load counters
    /// are reset because they described a channel that no longer exists.
    pub async fn reconnect(&self) -> Result<(), BusError> {
        let mut delay =
            std::time::Duration::from_millis(self.config.reconnect_base_delay_ms.max(1));
        let attempts = self.config.reconnect_max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.try_reestablish().await {
                Ok(()) => {
                    info!(attempt, "bus reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, "reconnect attempt failed: {e:#}");
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(BusError::ReconnectExhausted { attempts })
    }

    async fn try_reestablish(&self) -> anyhow::Result<()> {
        self.transport.connect().await?;
        self.declare_topology()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        for (agent_id, instance_id) in self.pool.snapshot() {
            self.declare_instance_queue(&agent_id, &instance_id)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        self.pool.reset_loads();
        Ok(())
    }

    /// Durable retry path: consume the dead-letter queue and republish
    /// envelopes whose `delivery_attempts` is below the ceiling; everything
    /// else is logged as a permanent failure and dropped. Runs until the
    /// consumer channel closes.
    pub async fn run_dead_letter_consumer(&self) -> Result<(), BusError> {
        let mut deliveries = self
            .transport
            .consume(&self.config.dead_letter_queue, "dead-letter")
            .await?;
        info!(queue = %self.config.dead_letter_queue, "dead-letter consumer started");

        while let Some(delivery) = deliveries.recv().await {
            let mut envelope: Envelope = match serde_json::from_slice(&delivery.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("dropping unparsable dead-lettered message: {e}");
                    let _ = delivery.acker.ack().await;
                    continue;
                }
            };

            if envelope.metadata.delivery_attempts >= self.config.redelivery_ceiling {
                warn!(
                    message_id = %envelope.metadata.message_id,
                    agent_id = %envelope.metadata.agent_id,
                    attempts = envelope.metadata.delivery_attempts,
                    "dropping permanently failed envelope"
                );
                let _ = delivery.acker.ack().await;
                continue;
            }

            envelope.metadata.delivery_attempts += 1;
            let routing_key = envelope.routing_key();
            let payload = match serde_json::to_vec(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to serialize dead-lettered envelope: {e}");
                    let _ = delivery.acker.ack().await;
                    continue;
                }
            };

            let republished = match self
                .transport
                .publish(
                    &self.config.exchange,
                    &routing_key,
                    &payload,
                    PublishProps {
                        persistent: true,
                        priority: envelope.metadata.priority.level(),
                    },
                )
                .await
            {
                Ok(true) => {
                    debug!(
                        message_id = %envelope.metadata.message_id,
                        attempt = envelope.metadata.delivery_attempts,
                        "republished dead-lettered envelope"
                    );
                    true
                }
                Ok(false) => {
                    warn!(routing_key, "dead-letter republish was unrouted");
                    false
                }
                Err(e) => {
                    warn!("dead-letter republish failed: {e:#}");
                    false
                }
            };

            if republished {
                let _ = delivery.acker.ack().await;
            } else {
                // Requeue the untouched original so the envelope survives a
                // broker outage; the attempt counter only advances on a
                // successful republish.
                let _ = delivery.acker.nack(true).await;
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.reconnect_base_delay_ms,
                ))
                .await;
            }
        }
        Ok(())
    }

    /// Close channel then connection. Idempotent.
    pub async fn cleanup(&self) -> Result<(), BusError> {
        self.transport.close().await?;
        Ok(())
    }

    /// Short unique consumer tag for an ephemeral subscription.
    pub fn ephemeral_tag(prefix: &str) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{prefix}-{}", &id[..8])
    }
}
