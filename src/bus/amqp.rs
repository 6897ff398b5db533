//! AMQP broker transport (RabbitMQ wire shape).
//!
//! Declares topic exchanges, durable queues with `x-dead-letter-exchange` /
//! `x-message-ttl` / `x-max-priority` arguments, publishes persistent
//! messages with publisher confirms, and consumes with explicit ack/nack.

use super::transport::{BusDelivery, BusTransport, DeliveryAcker, PublishProps, QueueOptions};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

struct Link {
    connection: Connection,
    channel: Channel,
}

/// Transport backed by an AMQP broker.
pub struct AmqpTransport {
    url: String,
    link: Mutex<Option<Link>>,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            link: Mutex::new(None),
        }
    }

    fn channel(&self) -> Result<Channel> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.channel.clone())
            .context("AMQP transport is not connected")
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BusTransport for AmqpTransport {
    async fn connect(&self) -> Result<()> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .with_context(|| format!("Failed to connect to broker at {}", self.url))?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        *self.link.lock() = Some(Link {
            connection,
            channel,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.channel.status().connected())
    }

    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<()> {
        let channel = self.channel()?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange {name}"))?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()> {
        let channel = self.channel()?;

        let mut args = FieldTable::default();
        if let Some(dlx) = &options.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }
        if let Some(ttl) = options.message_ttl_ms {
            args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
        }
        if let Some(max) = options.max_priority {
            args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
        }

        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .with_context(|| format!("Failed to declare queue {name}"))?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let channel = self.channel()?;
        channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to bind queue {queue} to {exchange} ({pattern})"))?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        props: PublishProps,
    ) -> Result<bool> {
        let channel = self.channel()?;

        let properties = BasicProperties::default()
            .with_delivery_mode(if props.persistent { 2 } else { 1 })
            .with_priority(props.priority);

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                body,
                properties,
            )
            .await
            .context("Publish was not accepted by the channel")?
            .await
            .context("Broker did not confirm the publish")?;

        // A returned message means the broker could not route it anywhere.
        let acked = confirm.is_ack();
        let returned = confirm.take_message().is_some();
        Ok(acked && !returned)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusDelivery>> {
        let channel = self.channel()?;
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to consume from queue {queue}"))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let bus_delivery = BusDelivery {
                            body: delivery.data.clone(),
                            routing_key: delivery.routing_key.to_string(),
                            redelivered: delivery.redelivered,
                            acker: Box::new(AmqpAcker {
                                acker: delivery.acker.clone(),
                            }),
                        };
                        if sender.send(bus_delivery).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, "AMQP consumer error: {e}");
                        break;
                    }
                }
            }
        });
        Ok(receiver)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let channel = self.channel()?;
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .with_context(|| format!("Failed to cancel consumer {consumer_tag}"))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let link = self.link.lock().take();
        if let Some(link) = link {
            let _ = link.channel.close(200, "cleanup").await;
            let _ = link.connection.close(200, "cleanup").await;
        }
        Ok(())
    }
}
