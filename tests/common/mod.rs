#![allow(dead_code)]

//! Shared harness for integration tests: an in-process control plane over
//! the memory transport, plus a scripted stand-in for worker containers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use swarmlet::bus::{BusClient, BusTransport, MemoryTransport, PublishProps, QueueOptions};
use swarmlet::config::Config;
use swarmlet::lifecycle::LifecycleManager;
use swarmlet::protocol::{
    CommandPayload, Envelope, EnvelopeBody, EnvelopeKind, EventPayload, ResponseOutcome,
    ResponsePayload, TaskChunk, TaskChunkKind,
};
use swarmlet::runtime::FakeRuntime;
use swarmlet::store::{MemoryStore, StateStore};

/// Switches controlling how the stub worker answers.
pub struct StubBehavior {
    /// When false the stub swallows everything, simulating a dead worker.
    pub healthy: AtomicBool,
    pub fail_save: AtomicBool,
    pub fail_load: AtomicBool,
}

/// Consume every envelope on the exchange and answer commands and events
/// the way a live worker container would.
pub async fn spawn_stub_worker(
    transport: &MemoryTransport,
    exchange: &str,
) -> Arc<StubBehavior> {
    transport
        .declare_queue("stub-worker", &QueueOptions::default())
        .await
        .unwrap();
    transport
        .bind_queue("stub-worker", exchange, "agent.#")
        .await
        .unwrap();
    let mut deliveries = transport.consume("stub-worker", "stub-worker").await.unwrap();

    let behavior = Arc::new(StubBehavior {
        healthy: AtomicBool::new(true),
        fail_save: AtomicBool::new(false),
        fail_load: AtomicBool::new(false),
    });

    let switches = behavior.clone();
    let transport = transport.clone();
    let exchange = exchange.to_string();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let envelope: Envelope = match serde_json::from_slice(&delivery.body) {
                Ok(envelope) => envelope,
                Err(_) => {
                    let _ = delivery.acker.ack().await;
                    continue;
                }
            };
            if envelope.kind() == EnvelopeKind::Response
                || !switches.healthy.load(Ordering::SeqCst)
            {
                let _ = delivery.acker.ack().await;
                continue;
            }

            let outcome = match &envelope.body {
                EnvelopeBody::Event(EventPayload::HealthCheck { .. }) => ResponseOutcome::Healthy,
                EnvelopeBody::Command(CommandPayload::ProcessMessage { message, .. }) => {
                    ResponseOutcome::TaskOutput {
                        chunks: vec![TaskChunk {
                            kind: TaskChunkKind::Agent,
                            content: format!("echo: {message}"),
                        }],
                    }
                }
                EnvelopeBody::Command(CommandPayload::SaveState { .. }) => {
                    if switches.fail_save.load(Ordering::SeqCst) {
                        ResponseOutcome::Error {
                            error: "vault write failed".into(),
                        }
                    } else {
                        ResponseOutcome::StateSaved
                    }
                }
                EnvelopeBody::Command(CommandPayload::LoadState { .. }) => {
                    if switches.fail_load.load(Ordering::SeqCst) {
                        ResponseOutcome::Error {
                            error: "vault read failed".into(),
                        }
                    } else {
                        ResponseOutcome::StateLoaded
                    }
                }
                EnvelopeBody::Response(_) => unreachable!("filtered above"),
            };

            let response = Envelope::stamped(
                EnvelopeBody::Response(ResponsePayload {
                    user_id: envelope.body.user_id().to_string(),
                    request_id: envelope.body.request_id().to_string(),
                    outcome,
                }),
                &envelope.metadata.agent_id,
                envelope.metadata.instance_id.clone(),
                envelope.metadata.priority,
            );
            let routing_key = format!("agent.{}.response", envelope.metadata.agent_id);
            let _ = transport
                .publish(
                    &exchange,
                    &routing_key,
                    &serde_json::to_vec(&response).unwrap(),
                    PublishProps {
                        persistent: true,
                        priority: response.metadata.priority.level(),
                    },
                )
                .await;
            let _ = delivery.acker.ack().await;
        }
    });
    behavior
}

/// Full control plane over in-process fakes.
pub struct TestPlane {
    pub transport: MemoryTransport,
    pub bus: Arc<BusClient>,
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<FakeRuntime>,
    pub lifecycle: Arc<LifecycleManager>,
    pub stub: Arc<StubBehavior>,
}

/// Config with timeouts short enough for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.lifecycle.startup_timeout_secs = 2;
    config.lifecycle.probe_interval_ms = 25;
    config.lifecycle.command_timeout_secs = 2;
    config.lifecycle.kill_timeout_secs = 2;
    config
}

pub async fn plane(config: Config) -> TestPlane {
    let transport = MemoryTransport::new();
    let bus = Arc::new(BusClient::new(
        Arc::new(transport.clone()),
        config.broker.clone(),
    ));
    bus.connect().await.unwrap();

    let stub = spawn_stub_worker(&transport, &config.broker.exchange).await;

    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    let store_dyn: Arc<dyn StateStore> = store.clone();
    let lifecycle = Arc::new(LifecycleManager::new(
        store_dyn,
        runtime.clone(),
        bus.clone(),
        config,
    ));

    TestPlane {
        transport,
        bus,
        store,
        runtime,
        lifecycle,
        stub,
    }
}
