//! Request/response correlation through the full stack: gateway on one
//! side, a real worker processor on the other, memory transport between.

use std::sync::Arc;
use std::time::Duration;
use swarmlet::bus::{BusClient, MemoryTransport};
use swarmlet::config::BrokerConfig;
use swarmlet::gateway::{Gateway, GatewayError};
use swarmlet::protocol::{Priority, ResponseOutcome};
use swarmlet::worker::{EchoCapability, FileVault, WorkerProcessor};

struct Rig {
    gateway: Gateway,
    transport: MemoryTransport,
    _vault_dir: tempfile::TempDir,
}

async fn rig_with_worker() -> Rig {
    let transport = MemoryTransport::new();

    let worker_bus = Arc::new(
        BusClient::new(Arc::new(transport.clone()), BrokerConfig::default())
            .with_instance_identity("i1"),
    );
    worker_bus.connect().await.unwrap();
    let vault_dir = tempfile::tempdir().unwrap();
    WorkerProcessor::new(
        worker_bus,
        "a1",
        "i1",
        Arc::new(EchoCapability::new()),
        FileVault::new(vault_dir.path(), true),
    )
    .start()
    .await
    .unwrap();

    let controller_bus = Arc::new(BusClient::new(
        Arc::new(transport.clone()),
        BrokerConfig::default(),
    ));
    controller_bus.connect().await.unwrap();
    controller_bus.register_instance("a1", "i1").await.unwrap();

    Rig {
        gateway: Gateway::new(controller_bus),
        transport,
        _vault_dir: vault_dir,
    }
}

#[tokio::test]
async fn message_round_trip_through_a_real_worker() {
    let rig = rig_with_worker().await;

    let response = rig
        .gateway
        .send_and_await("a1", "u1", "hello", Priority::Medium, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(response.user_id, "u1");
    match response.outcome {
        ResponseOutcome::TaskOutput { chunks } => {
            assert_eq!(chunks[0].content, "echo: hello");
        }
        other => panic!("expected task output, got {other:?}"),
    }
}

#[tokio::test]
async fn many_concurrent_requests_get_their_own_responses() {
    let rig = rig_with_worker().await;
    let gateway = Arc::new(rig.gateway);

    let mut handles = Vec::new();
    for n in 0..8 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            let user = format!("user-{}", n % 3);
            let message = format!("message-{n}");
            let response = gateway
                .send_and_await(
                    "a1",
                    &user,
                    &message,
                    Priority::Medium,
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            (user, message, response)
        }));
    }

    for handle in handles {
        let (user, message, response) = handle.await.unwrap();
        assert_eq!(response.user_id, user);
        match response.outcome {
            ResponseOutcome::TaskOutput { chunks } => {
                assert_eq!(chunks[0].content, format!("echo: {message}"));
            }
            other => panic!("expected task output, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn unanswered_request_times_out_and_leaves_nothing_behind() {
    let transport = MemoryTransport::new();
    let bus = Arc::new(BusClient::new(
        Arc::new(transport.clone()),
        BrokerConfig::default(),
    ));
    bus.connect().await.unwrap();
    // Queue declared, nobody consuming it.
    bus.register_instance("a1", "i1").await.unwrap();

    let gateway = Gateway::new(bus);
    let err = gateway
        .send_and_await(
            "a1",
            "u1",
            "hello?",
            Priority::Medium,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!transport.has_queue_matching("corr"));
}

#[tokio::test]
async fn stale_responses_do_not_leak_into_later_requests() {
    let rig = rig_with_worker().await;

    // Too short to catch the answer; the response is dropped by the
    // filter of nobody and the queue vanishes.
    let _ = rig
        .gateway
        .send_and_await("a1", "u1", "first", Priority::Medium, Duration::from_micros(1))
        .await;

    let response = rig
        .gateway
        .send_and_await("a1", "u1", "second", Priority::Medium, Duration::from_secs(2))
        .await
        .unwrap();
    match response.outcome {
        ResponseOutcome::TaskOutput { chunks } => {
            assert_eq!(chunks[0].content, "echo: second");
        }
        other => panic!("expected task output, got {other:?}"),
    }
    let _ = rig.transport;
}
