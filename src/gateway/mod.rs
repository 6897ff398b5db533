//! Request/response correlation gateway.
//!
//! Bridges request-shaped callers onto the asynchronous bus: subscribe an
//! ephemeral consumer filtered on the `(user_id, request_id)` pair, then
//! publish, then await the matching response or a deadline. The consumer
//! exists before the publish so a worker that answers instantly cannot
//! race the subscription. Both exits tear the consumer down; its
//! auto-deleted queue vanishes with it.

use crate::bus::{BusClient, BusError, EnvelopeFilter, EnvelopeHandler, SubscribeOptions,
    SubscriptionScope};
use crate::protocol::{CommandPayload, EnvelopeBody, EnvelopeKind, Priority, ResponsePayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no response to request {request_id} within {timeout:?}")]
    Timeout {
        request_id: String,
        timeout: Duration,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Correlated request/response access to agents.
pub struct Gateway {
    bus: Arc<BusClient>,
}

impl Gateway {
    pub fn new(bus: Arc<BusClient>) -> Self {
        Self { bus }
    }

    /// Publish `body` to an agent and wait for the response carrying the
    /// same `(user_id, request_id)` pair.
    pub async fn publish_and_await(
        &self,
        agent_id: &str,
        body: EnvelopeBody,
        priority: Priority,
        timeout: Duration,
    ) -> Result<ResponsePayload, GatewayError> {
        let user_id = body.user_id().to_string();
        let request_id = body.request_id().to_string();

        let (sender, mut receiver) = mpsc::channel::<ResponsePayload>(1);
        let filter: EnvelopeFilter = {
            let user_id = user_id.clone();
            let request_id = request_id.clone();
            Arc::new(move |envelope| {
                envelope.kind() == EnvelopeKind::Response
                    && envelope.body.user_id() == user_id
                    && envelope.body.request_id() == request_id
            })
        };
        let handler: EnvelopeHandler = {
            let bus = self.bus.clone();
            let agent_id = agent_id.to_string();
            Arc::new(move |envelope| {
                let bus = bus.clone();
                let agent_id = agent_id.clone();
                let sender = sender.clone();
                Box::pin(async move {
                    // The response settles the load the command added.
                    if let Some(instance_id) = &envelope.metadata.instance_id {
                        bus.pool().decrement(&agent_id, instance_id);
                    }
                    if let EnvelopeBody::Response(payload) = envelope.body {
                        // A second match for the same pair has nowhere to go.
                        let _ = sender.try_send(payload);
                    }
                    Ok(())
                })
            })
        };

        let subscription = self
            .bus
            .subscribe(
                agent_id,
                SubscriptionScope::Ephemeral(BusClient::ephemeral_tag("corr")),
                SubscribeOptions {
                    filter: Some(filter),
                },
                handler,
            )
            .await?;

        let sent = match self.bus.publish(agent_id, body, priority).await {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = self.bus.unsubscribe(&subscription).await;
                return Err(e.into());
            }
        };
        debug!(agent_id, request_id, "awaiting correlated response");

        let outcome = tokio::time::timeout(timeout, receiver.recv()).await;
        let _ = self.bus.unsubscribe(&subscription).await;

        match outcome {
            Ok(Some(payload)) => Ok(payload),
            // The sender cannot drop while the subscription task holds it,
            // so a closed channel only happens after cancellation.
            Ok(None) | Err(_) => {
                // No response arrived to settle the load this command
                // added; settle it here. The counter floors at zero, so
                // a straggler response landing after the deadline cannot
                // drive it negative.
                if let Some(instance_id) = &sent.metadata.instance_id {
                    self.bus.pool().decrement(agent_id, instance_id);
                }
                Err(GatewayError::Timeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    /// Convenience wrapper: wrap a user message into PROCESS_MESSAGE with a
    /// fresh request id and await its output.
    pub async fn send_and_await(
        &self,
        agent_id: &str,
        user_id: &str,
        message: &str,
        priority: Priority,
        timeout: Duration,
    ) -> Result<ResponsePayload, GatewayError> {
        let body = EnvelopeBody::Command(CommandPayload::ProcessMessage {
            user_id: user_id.to_string(),
            request_id: Uuid::new_v4().to_string(),
            message: message.to_string(),
        });
        self.publish_and_await(agent_id, body, priority, timeout).await
    }
}
