//! Transport seam between the bus client and a concrete broker.
//!
//! The trait surface is exactly the set of operations the orchestration
//! layer issues against a broker: topology declaration, publish, consume,
//! ack/nack. Implement it to port the bus client to a new substrate; the
//! crate ships an AMQP implementation and an in-process one.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Arguments for queue declaration.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    /// Exchange rejected deliveries are routed to (`x-dead-letter-exchange`).
    pub dead_letter_exchange: Option<String>,
    /// Message TTL in milliseconds (`x-message-ttl`).
    pub message_ttl_ms: Option<u32>,
    /// Maximum priority the queue honors (`x-max-priority`).
    pub max_priority: Option<u8>,
}

/// Per-publish properties.
#[derive(Debug, Clone, Copy)]
pub struct PublishProps {
    /// Survive a broker restart.
    pub persistent: bool,
    /// Broker priority value.
    pub priority: u8,
}

/// Terminal disposition of one delivery. Consuming the acker enforces
/// exactly one of ack / nack per delivery at compile time.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Positively acknowledge; the broker forgets the message.
    async fn ack(self: Box<Self>) -> anyhow::Result<()>;

    /// Negatively acknowledge. With `requeue` the message goes back to the
    /// queue flagged as redelivered; without it the message dead-letters
    /// (when the queue is configured for it) or is dropped.
    async fn nack(self: Box<Self>, requeue: bool) -> anyhow::Result<()>;
}

/// One message handed to a consumer.
pub struct BusDelivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    pub acker: Box<dyn DeliveryAcker>,
}

impl std::fmt::Debug for BusDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusDelivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .finish()
    }
}

/// Broker operations the bus client depends on.
///
/// Implementations must be `Send + Sync`; one transport is shared across
/// the bus client, the dead-letter consumer, and every subscription task.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Establish (or re-establish) the connection and channel. Idempotent.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Whether publishes can currently reach the broker.
    fn is_connected(&self) -> bool;

    async fn declare_exchange(&self, name: &str, durable: bool) -> anyhow::Result<()>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> anyhow::Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> anyhow::Result<()>;

    /// Publish one message. Returns `false` when the broker reports it could
    /// not be routed or buffered.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        props: PublishProps,
    ) -> anyhow::Result<bool>;

    /// Begin consuming from a queue. Deliveries arrive on the returned
    /// channel until the consumer is cancelled or the connection drops.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<BusDelivery>>;

    /// Cancel one consumer without touching others on the same queue.
    async fn cancel(&self, consumer_tag: &str) -> anyhow::Result<()>;

    /// Close channel then connection. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}
