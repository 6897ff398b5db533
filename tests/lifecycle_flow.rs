//! End-to-end lifecycle scenarios: creation with admission limits, the
//! freeze/unfreeze cycle, recovery, sweeps and fleet termination.

mod common;

use common::{fast_config, plane};
use std::sync::atomic::Ordering;
use swarmlet::config::HealthFailurePolicy;
use swarmlet::lifecycle::LifecycleError;
use swarmlet::runtime::{ContainerStats, FakeContainerState};
use swarmlet::store::{AgentStatus, StateStore};

#[tokio::test]
async fn create_freeze_unfreeze_keeps_the_agent_identity() {
    let plane = plane(fast_config()).await;

    let agent_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    let state = plane.store.agent_state(&agent_id).await.unwrap().unwrap();
    assert_eq!(state.status, AgentStatus::Active);
    let container_id = state.container_id.clone().unwrap();
    assert_eq!(
        plane.runtime.state_of(&container_id),
        Some(FakeContainerState::Running)
    );

    plane.lifecycle.freeze_agent(&agent_id).await.unwrap();
    let frozen = plane.store.agent_state(&agent_id).await.unwrap().unwrap();
    assert_eq!(frozen.status, AgentStatus::Frozen);
    assert!(frozen.last_frozen.is_some());
    assert_eq!(
        plane.runtime.state_of(&container_id),
        Some(FakeContainerState::Stopped)
    );

    // Returning user wakes the same agent; no new container is created.
    let woken_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    assert_eq!(woken_id, agent_id);
    assert_eq!(plane.runtime.container_count(), 1);

    let active = plane.store.agent_state(&agent_id).await.unwrap().unwrap();
    assert_eq!(active.status, AgentStatus::Active);
    assert!(active.last_unfrozen.unwrap() > frozen.last_frozen.unwrap());
    assert_eq!(
        plane.runtime.state_of(&container_id),
        Some(FakeContainerState::Running)
    );
}

#[tokio::test]
async fn activity_on_an_active_agent_only_refreshes_the_timestamp() {
    let plane = plane(fast_config()).await;

    let agent_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    let before = plane.store.agent_state(&agent_id).await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let same_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    assert_eq!(same_id, agent_id);

    let after = plane.store.agent_state(&agent_id).await.unwrap().unwrap();
    assert!(after.last_activity > before.last_activity);
    assert_eq!(plane.runtime.container_count(), 1);
}

#[tokio::test]
async fn user_limit_rejects_a_second_agent() {
    let plane = plane(fast_config()).await;
    plane.lifecycle.handle_user_activity("u1").await.unwrap();

    // The first agent is active, so direct creation must be refused.
    let err = plane.lifecycle.create_agent("u1").await.unwrap_err();
    assert!(matches!(err, LifecycleError::UserLimit { .. }));
    assert_eq!(plane.runtime.container_count(), 1);
}

#[tokio::test]
async fn system_limit_rejects_without_starting_a_container() {
    let mut config = fast_config();
    config.limits.max_system_agents = 1;
    let plane = plane(config).await;

    plane.lifecycle.handle_user_activity("u1").await.unwrap();
    let err = plane.lifecycle.handle_user_activity("u2").await.unwrap_err();
    assert!(matches!(err, LifecycleError::SystemLimit { .. }));
    assert_eq!(plane.runtime.container_count(), 1);
    assert!(plane.store.agent_id_for_user("u2").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_signups_never_exceed_the_system_cap() {
    let mut config = fast_config();
    config.limits.max_system_agents = 2;
    let plane = plane(config).await;

    let mut handles = Vec::new();
    for n in 0..6 {
        let lifecycle = plane.lifecycle.clone();
        handles.push(tokio::spawn(async move {
            lifecycle.handle_user_activity(&format!("user-{n}")).await
        }));
    }

    let mut created = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(LifecycleError::SystemLimit { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(created, 2);
    assert_eq!(rejected, 4);
    assert_eq!(plane.runtime.container_count(), 2);
}

#[tokio::test]
async fn unready_agent_times_out_and_is_marked_errored() {
    let plane = plane(fast_config()).await;
    plane.stub.healthy.store(false, Ordering::SeqCst);

    let err = plane.lifecycle.handle_user_activity("u1").await.unwrap_err();
    assert!(matches!(err, LifecycleError::StartupTimeout { .. }));

    let agent_id = plane.store.agent_id_for_user("u1").await.unwrap().unwrap();
    let state = plane.store.agent_state(&agent_id).await.unwrap().unwrap();
    assert_eq!(state.status, AgentStatus::Error);
}

#[tokio::test]
async fn failed_save_state_moves_the_agent_to_error() {
    let plane = plane(fast_config()).await;
    let agent_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();

    plane.stub.fail_save.store(true, Ordering::SeqCst);
    assert!(plane.lifecycle.freeze_agent(&agent_id).await.is_err());

    let state = plane.store.agent_state(&agent_id).await.unwrap().unwrap();
    assert_eq!(state.status, AgentStatus::Error);
    assert!(state.error_message.is_some());
    // The container was never stopped.
    let container_id = state.container_id.unwrap();
    assert_eq!(
        plane.runtime.state_of(&container_id),
        Some(FakeContainerState::Running)
    );
}

#[tokio::test]
async fn recovery_replaces_the_errored_agent() {
    let plane = plane(fast_config()).await;
    let old_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();

    let mut state = plane.store.agent_state(&old_id).await.unwrap().unwrap();
    let old_container = state.container_id.clone().unwrap();
    state.status = AgentStatus::Error;
    state.error_message = Some("container crashed".into());
    plane.store.save(&state).await.unwrap();

    let new_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    assert_ne!(new_id, old_id);
    assert!(plane.store.agent_state(&old_id).await.unwrap().is_none());
    assert_eq!(plane.runtime.state_of(&old_container), None);

    let fresh = plane.store.agent_state(&new_id).await.unwrap().unwrap();
    assert_eq!(fresh.status, AgentStatus::Active);
    assert_eq!(plane.runtime.container_count(), 1);
}

#[tokio::test]
async fn back_to_back_recoveries_always_mint_fresh_ids() {
    let plane = plane(fast_config()).await;
    let mut ids = vec![plane.lifecycle.handle_user_activity("u1").await.unwrap()];

    // Fake runtime and memory store recover in well under a millisecond, so
    // a timestamp-only id would repeat here.
    for _ in 0..3 {
        let current = ids.last().unwrap().clone();
        let mut state = plane.store.agent_state(&current).await.unwrap().unwrap();
        state.status = AgentStatus::Error;
        state.error_message = Some("container crashed".into());
        plane.store.save(&state).await.unwrap();

        ids.push(plane.lifecycle.handle_user_activity("u1").await.unwrap());
    }

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len(), "agent ids must never repeat: {ids:?}");
}

#[tokio::test]
async fn kill_all_reports_successes_and_failures() {
    let plane = plane(fast_config()).await;
    let a1 = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    let a2 = plane.lifecycle.handle_user_activity("u2").await.unwrap();
    let a3 = plane.lifecycle.handle_user_activity("u3").await.unwrap();

    let stuck = plane
        .store
        .agent_state(&a2)
        .await
        .unwrap()
        .unwrap()
        .container_id
        .unwrap();
    plane.runtime.fail_remove_for(&stuck);

    let report = plane.lifecycle.kill_all_agents().await.unwrap();
    assert!(!report.success);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].agent_id, a2);
    let mut terminated = report.terminated.clone();
    terminated.sort();
    let mut expected = vec![a1.clone(), a3.clone()];
    expected.sort();
    assert_eq!(terminated, expected);

    // Terminated agents are erased; the failed one keeps its record.
    assert!(plane.store.agent_state(&a1).await.unwrap().is_none());
    assert!(plane.store.agent_state(&a2).await.unwrap().is_some());
    assert!(plane.store.agent_state(&a3).await.unwrap().is_none());

    let status = plane.lifecycle.termination_status().await.unwrap();
    assert_eq!(status.active_agents, 1);
}

#[tokio::test]
async fn inactivity_sweep_freezes_idle_agents() {
    let mut config = fast_config();
    config.lifecycle.inactivity_timeout_secs = 60;
    let plane = plane(config).await;

    let idle = plane.lifecycle.handle_user_activity("idle").await.unwrap();
    let busy = plane.lifecycle.handle_user_activity("busy").await.unwrap();

    let mut state = plane.store.agent_state(&idle).await.unwrap().unwrap();
    state.last_activity = chrono::Utc::now() - chrono::Duration::seconds(120);
    plane.store.save(&state).await.unwrap();

    plane.lifecycle.run_inactivity_sweep_once().await;

    assert_eq!(
        plane.store.agent_state(&idle).await.unwrap().unwrap().status,
        AgentStatus::Frozen
    );
    assert_eq!(
        plane.store.agent_state(&busy).await.unwrap().unwrap().status,
        AgentStatus::Active
    );
}

#[tokio::test]
async fn health_sweep_persists_resource_snapshots() {
    let plane = plane(fast_config()).await;
    let agent_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    let container_id = plane
        .store
        .agent_state(&agent_id)
        .await
        .unwrap()
        .unwrap()
        .container_id
        .unwrap();
    plane.runtime.set_stats(
        &container_id,
        ContainerStats {
            memory_bytes: 96 * 1024 * 1024,
            cpu_total: 1_234_567,
        },
    );

    plane.lifecycle.run_health_sweep_once().await;

    let state = plane.store.agent_state(&agent_id).await.unwrap().unwrap();
    assert_eq!(state.memory_usage, Some(96 * 1024 * 1024));
    assert_eq!(state.cpu_usage, Some(1_234_567));
    assert_eq!(state.status, AgentStatus::Active);
}

#[tokio::test]
async fn mark_error_policy_trips_after_consecutive_failures() {
    let mut config = fast_config();
    config.lifecycle.command_timeout_secs = 1;
    config.lifecycle.health_failure_policy = HealthFailurePolicy::MarkError;
    config.lifecycle.health_failure_threshold = 2;
    let plane = plane(config).await;

    let agent_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    plane.stub.healthy.store(false, Ordering::SeqCst);

    plane.lifecycle.run_health_sweep_once().await;
    assert_eq!(
        plane.store.agent_state(&agent_id).await.unwrap().unwrap().status,
        AgentStatus::Active
    );

    plane.lifecycle.run_health_sweep_once().await;
    assert_eq!(
        plane.store.agent_state(&agent_id).await.unwrap().unwrap().status,
        AgentStatus::Error
    );
}

#[tokio::test]
async fn ignore_policy_keeps_the_agent_active() {
    let mut config = fast_config();
    config.lifecycle.command_timeout_secs = 1;
    config.lifecycle.health_failure_threshold = 1;
    let plane = plane(config).await;

    let agent_id = plane.lifecycle.handle_user_activity("u1").await.unwrap();
    plane.stub.healthy.store(false, Ordering::SeqCst);

    plane.lifecycle.run_health_sweep_once().await;
    plane.lifecycle.run_health_sweep_once().await;
    assert_eq!(
        plane.store.agent_state(&agent_id).await.unwrap().unwrap().status,
        AgentStatus::Active
    );
}
