//! In-process container runtime for tests.

use super::traits::{ContainerRuntime, ContainerStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeContainerState {
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct Inner {
    containers: HashMap<String, FakeContainerState>,
    /// Agent ids whose next create call should fail.
    fail_create_for: Vec<String>,
    /// Container ids whose stop call should fail.
    fail_stop_for: Vec<String>,
    /// Container ids whose remove call should fail.
    fail_remove_for: Vec<String>,
    stats: HashMap<String, ContainerStats>,
    stats_failures: Vec<String>,
}

/// Records lifecycle calls against an in-memory container table, with
/// injectable failures per agent or container.
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create_for(&self, agent_id: &str) {
        self.inner.lock().fail_create_for.push(agent_id.to_string());
    }

    pub fn fail_stop_for(&self, container_id: &str) {
        self.inner.lock().fail_stop_for.push(container_id.to_string());
    }

    pub fn fail_remove_for(&self, container_id: &str) {
        self.inner
            .lock()
            .fail_remove_for
            .push(container_id.to_string());
    }

    pub fn fail_stats_for(&self, container_id: &str) {
        self.inner
            .lock()
            .stats_failures
            .push(container_id.to_string());
    }

    pub fn set_stats(&self, container_id: &str, stats: ContainerStats) {
        self.inner
            .lock()
            .stats
            .insert(container_id.to_string(), stats);
    }

    pub fn state_of(&self, container_id: &str) -> Option<FakeContainerState> {
        self.inner.lock().containers.get(container_id).copied()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .lock()
            .containers
            .values()
            .filter(|s| **s == FakeContainerState::Running)
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().containers.len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_and_start(
        &self,
        _user_id: &str,
        agent_id: &str,
        _env: Vec<String>,
    ) -> anyhow::Result<String> {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.fail_create_for.iter().position(|a| a == agent_id) {
            inner.fail_create_for.remove(pos);
            anyhow::bail!("simulated create failure for {agent_id}");
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        inner.containers.insert(id.clone(), FakeContainerState::Running);
        Ok(id)
    }

    async fn stop(&self, container_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.fail_stop_for.iter().position(|c| c == container_id) {
            inner.fail_stop_for.remove(pos);
            anyhow::bail!("simulated stop failure for {container_id}");
        }
        match inner.containers.get_mut(container_id) {
            Some(state) => {
                *state = FakeContainerState::Stopped;
                Ok(())
            }
            None => anyhow::bail!("no such container {container_id}"),
        }
    }

    async fn resume(&self, container_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        match inner.containers.get_mut(container_id) {
            Some(state) => {
                *state = FakeContainerState::Running;
                Ok(())
            }
            None => anyhow::bail!("no such container {container_id}"),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.fail_remove_for.iter().position(|c| c == container_id) {
            inner.fail_remove_for.remove(pos);
            anyhow::bail!("simulated remove failure for {container_id}");
        }
        if let Some(state) = inner.containers.get(container_id) {
            if *state == FakeContainerState::Running && !force {
                anyhow::bail!("container {container_id} is running");
            }
            inner.containers.remove(container_id);
        }
        // Removing an unknown container is fine, matching the Docker path.
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> anyhow::Result<ContainerStats> {
        let inner = self.inner.lock();
        if inner.stats_failures.iter().any(|c| c == container_id) {
            anyhow::bail!("simulated stats failure for {container_id}");
        }
        if !inner.containers.contains_key(container_id) {
            anyhow::bail!("no such container {container_id}");
        }
        Ok(inner.stats.get(container_id).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_transitions() {
        let runtime = FakeRuntime::new();
        let id = runtime
            .create_and_start("u1", "a1", vec![])
            .await
            .unwrap();
        assert_eq!(runtime.state_of(&id), Some(FakeContainerState::Running));

        runtime.stop(&id).await.unwrap();
        assert_eq!(runtime.state_of(&id), Some(FakeContainerState::Stopped));

        runtime.resume(&id).await.unwrap();
        assert_eq!(runtime.state_of(&id), Some(FakeContainerState::Running));

        runtime.remove(&id, true).await.unwrap();
        assert_eq!(runtime.state_of(&id), None);
    }

    #[tokio::test]
    async fn remove_requires_force_while_running() {
        let runtime = FakeRuntime::new();
        let id = runtime
            .create_and_start("u1", "a1", vec![])
            .await
            .unwrap();
        assert!(runtime.remove(&id, false).await.is_err());
        assert!(runtime.remove(&id, true).await.is_ok());
    }

    #[tokio::test]
    async fn injected_create_failure_fires_once() {
        let runtime = FakeRuntime::new();
        runtime.fail_create_for("a1");
        assert!(runtime.create_and_start("u1", "a1", vec![]).await.is_err());
        assert!(runtime.create_and_start("u1", "a1", vec![]).await.is_ok());
    }
}
