use async_trait::async_trait;

/// Resource snapshot for one running container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStats {
    /// Current memory usage in bytes.
    pub memory_bytes: u64,
    /// Cumulative CPU time consumed, in the engine's native units.
    pub cpu_total: u64,
}

/// Operations the lifecycle manager performs on worker containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container for the agent, inject `env`, and start it.
    /// Returns the container id.
    async fn create_and_start(
        &self,
        user_id: &str,
        agent_id: &str,
        env: Vec<String>,
    ) -> anyhow::Result<String>;

    /// Stop a running container, keeping its filesystem for later resume.
    async fn stop(&self, container_id: &str) -> anyhow::Result<()>;

    /// Start a previously stopped container again.
    async fn resume(&self, container_id: &str) -> anyhow::Result<()>;

    /// Remove a container. With `force`, a running container is killed
    /// first; a container that no longer exists is not an error.
    async fn remove(&self, container_id: &str, force: bool) -> anyhow::Result<()>;

    /// One-shot resource snapshot.
    async fn stats(&self, container_id: &str) -> anyhow::Result<ContainerStats>;
}
