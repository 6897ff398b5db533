//! Docker implementation of the container runtime.
//!
//! Worker containers get hard memory/swap limits and a CPU share weight
//! from [`RuntimeConfig`], plus owner labels so stray containers can be
//! traced back to their agent.

use super::traits::{ContainerRuntime, ContainerStats};
use crate::config::RuntimeConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, RemoveContainerOptionsBuilder, StatsOptionsBuilder,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;

const STOP_GRACE_SECS: i32 = 10;

pub struct DockerRuntime {
    docker: Docker,
    config: RuntimeConfig,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect(config: RuntimeConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to the Docker daemon")?;
        Ok(Self { docker, config })
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(
        &self,
        user_id: &str,
        agent_id: &str,
        env: Vec<String>,
    ) -> Result<String> {
        let mut labels = HashMap::new();
        labels.insert("swarmlet.agent-id".to_string(), agent_id.to_string());
        labels.insert("swarmlet.user-id".to_string(), user_id.to_string());

        let body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: Some(self.config.memory_limit_mb as i64 * 1024 * 1024),
                memory_swap: Some(self.config.memory_swap_mb as i64 * 1024 * 1024),
                cpu_shares: Some(i64::from(self.config.cpu_shares)),
                network_mode: if self.config.network.is_empty() {
                    None
                } else {
                    Some(self.config.network.clone())
                },
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&format!("swarmlet-{agent_id}"))
                        .build(),
                ),
                body,
            )
            .await
            .with_context(|| format!("Failed to create container for agent {agent_id}"))?;

        self.docker
            .start_container(
                &created.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .with_context(|| format!("Failed to start container for agent {agent_id}"))?;

        Ok(created.id)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.docker
            .stop_container(
                container_id,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
            .with_context(|| format!("Failed to stop container {container_id}"))?;
        Ok(())
    }

    async fn resume(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(
                container_id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .with_context(|| format!("Failed to resume container {container_id}"))?;
        Ok(())
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let result = self
            .docker
            .remove_container(
                container_id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(force)
                        .v(true)
                        .build(),
                ),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("Failed to remove container {container_id}"))
            }
        }
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptionsBuilder::new().stream(false).build()),
        );
        let snapshot = stream
            .next()
            .await
            .with_context(|| format!("No stats reported for container {container_id}"))?
            .with_context(|| format!("Failed to read stats for container {container_id}"))?;

        let memory_bytes = snapshot
            .memory_stats
            .as_ref()
            .and_then(|m| m.usage)
            .unwrap_or(0);
        let cpu_total = snapshot
            .cpu_stats
            .as_ref()
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0);

        Ok(ContainerStats {
            memory_bytes,
            cpu_total,
        })
    }
}
