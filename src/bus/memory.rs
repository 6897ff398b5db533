//! In-process broker transport.
//!
//! Implements the [`BusTransport`] seam over plain process memory: topic
//! exchanges with AMQP-style pattern matching (`*` = one word, `#` = zero or
//! more), priority-ordered queue buffers, redelivery flags, and dead-letter
//! routing on negative acknowledgement. Used by the test suites and by
//! single-process deployments that don't want an external broker.
//!
//! Message TTL is accepted but not enforced here; nothing in-process lives
//! long enough for it to matter.

use super::transport::{BusDelivery, BusTransport, DeliveryAcker, PublishProps, QueueOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// AMQP topic matching: `*` matches exactly one dot-separated word,
/// `#` matches zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(token), Some(word)) if token == word => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    routing_key: String,
    priority: u8,
    seq: u64,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    sender: mpsc::UnboundedSender<BusDelivery>,
}

#[derive(Default)]
struct Queue {
    options: QueueOptions,
    buffer: Vec<Stored>,
    consumers: Vec<Consumer>,
    round_robin: usize,
}

#[derive(Default)]
struct BrokerState {
    connected: AtomicBool,
    refuse_connects: AtomicBool,
    exchanges: Mutex<HashMap<String, Vec<Binding>>>,
    queues: Mutex<HashMap<String, Queue>>,
    seq: AtomicU64,
}

/// Transport backed by an in-process topic broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<BrokerState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage (or recovery). Consumers stay attached;
    /// only publishes are gated, which matches a mid-reconnect bus client.
    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// Make subsequent `connect` calls fail, simulating an unreachable
    /// broker during reconnect attempts.
    pub fn fail_connects(&self, refuse: bool) {
        self.state.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Buffered (undelivered) message count for a queue. Test observability.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.buffer.len())
    }

    /// Whether a queue has been declared. Test observability.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.queues.lock().contains_key(queue)
    }

    /// Whether any declared queue name contains `fragment`. Test observability.
    pub fn has_queue_matching(&self, fragment: &str) -> bool {
        self.state
            .queues
            .lock()
            .keys()
            .any(|name| name.contains(fragment))
    }

    fn route(&self, exchange: &str, routing_key: &str, body: &[u8], priority: u8) -> usize {
        let targets: Vec<String> = {
            let exchanges = self.state.exchanges.lock();
            exchanges
                .get(exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|b| topic_matches(&b.pattern, routing_key))
                        .map(|b| b.queue.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for queue_name in &targets {
            let stored = Stored {
                body: body.to_vec(),
                routing_key: routing_key.to_string(),
                priority,
                seq: self.state.seq.fetch_add(1, Ordering::SeqCst),
                redelivered: false,
            };
            enqueue(&self.state, queue_name, stored);
        }
        targets.len()
    }
}

/// Insert into the queue buffer and hand out whatever can be delivered.
fn enqueue(state: &Arc<BrokerState>, queue_name: &str, stored: Stored) {
    {
        let mut queues = state.queues.lock();
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        let cap = queue.options.max_priority.unwrap_or(u8::MAX);
        let mut stored = stored;
        stored.priority = stored.priority.min(cap);
        queue.buffer.push(stored);
    }
    drain(state, queue_name);
}

/// Deliver buffered messages to attached consumers, highest priority first,
/// publish order within a priority.
fn drain(state: &Arc<BrokerState>, queue_name: &str) {
    let mut queues = state.queues.lock();
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    loop {
        if queue.buffer.is_empty() || queue.consumers.is_empty() {
            return;
        }

        let best = queue
            .buffer
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let stored = queue.buffer.remove(best);

        queue.round_robin = (queue.round_robin.wrapping_add(1)) % queue.consumers.len();
        let consumer = &queue.consumers[queue.round_robin];

        let delivery = BusDelivery {
            body: stored.body.clone(),
            routing_key: stored.routing_key.clone(),
            redelivered: stored.redelivered,
            acker: Box::new(MemoryAcker {
                state: Arc::clone(state),
                queue: queue_name.to_string(),
                stored: stored.clone(),
            }),
        };

        if consumer.sender.send(delivery).is_err() {
            // Receiver dropped without cancel; detach and put the message back.
            let tag = consumer.tag.clone();
            queue.consumers.retain(|c| c.tag != tag);
            queue.buffer.push(stored);
        }
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    stored: Stored,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(self: Box<Self>) -> anyhow::Result<()> {
        trace!(queue = %self.queue, seq = self.stored.seq, "ack");
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> anyhow::Result<()> {
        if requeue {
            let mut stored = self.stored;
            stored.redelivered = true;
            enqueue(&self.state, &self.queue, stored);
            return Ok(());
        }

        // Dead-letter when the queue is configured for it, otherwise drop.
        let dlx = {
            let queues = self.state.queues.lock();
            queues
                .get(&self.queue)
                .and_then(|q| q.options.dead_letter_exchange.clone())
        };
        if let Some(dlx) = dlx {
            let transport = MemoryTransport {
                state: Arc::clone(&self.state),
            };
            transport.route(&dlx, &self.stored.routing_key, &self.stored.body, 0);
        }
        Ok(())
    }
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn connect(&self) -> anyhow::Result<()> {
        if self.state.refuse_connects.load(Ordering::SeqCst) {
            anyhow::bail!("broker unreachable");
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str, _durable: bool) -> anyhow::Result<()> {
        self.state
            .exchanges
            .lock()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> anyhow::Result<()> {
        self.state
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Queue {
                options: options.clone(),
                ..Queue::default()
            });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> anyhow::Result<()> {
        let mut exchanges = self.state.exchanges.lock();
        let bindings = exchanges.entry(exchange.to_string()).or_default();
        if !bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern)
        {
            bindings.push(Binding {
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        props: PublishProps,
    ) -> anyhow::Result<bool> {
        if !self.is_connected() {
            anyhow::bail!("transport is not connected");
        }
        let routed = self.route(exchange, routing_key, body, props.priority);
        Ok(routed > 0)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<BusDelivery>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut queues = self.state.queues.lock();
            let queue_state = queues
                .get_mut(queue)
                .ok_or_else(|| anyhow::anyhow!("consume on undeclared queue {queue}"))?;
            queue_state.consumers.push(Consumer {
                tag: consumer_tag.to_string(),
                sender,
            });
        }
        drain(&self.state, queue);
        Ok(receiver)
    }

    async fn cancel(&self, consumer_tag: &str) -> anyhow::Result<()> {
        let mut auto_delete = Vec::new();
        {
            let mut queues = self.state.queues.lock();
            for (name, queue) in queues.iter_mut() {
                queue.consumers.retain(|c| c.tag != consumer_tag);
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    auto_delete.push(name.clone());
                }
            }
            for name in &auto_delete {
                queues.remove(name);
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
