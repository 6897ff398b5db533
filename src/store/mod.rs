//! Agent state store.
//!
//! Two keyspaces: `user:<userId>:agentId` maps a user to their current
//! agent, `agent:<agentId>:state` holds the JSON state record. Writes and
//! deletes touch both keys atomically so a crash never leaves a user index
//! pointing at a missing record. The store is the authoritative source for
//! lifecycle status and admission counting; in-memory caches are not.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Active,
    Frozen,
    Stopping,
    Error,
}

impl AgentStatus {
    /// Whether this agent counts against per-user and system capacity
    /// limits. Frozen, stopping and errored agents hold no live resources.
    pub fn counts_toward_limits(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Frozen => "frozen",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persistent record for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub user_id: String,
    pub agent_id: String,
    pub status: AgentStatus,
    /// Absent between a failed start and recovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Bus instance identity handed to the worker at start, kept so the
    /// controller can re-register the instance after its own restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frozen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_unfrozen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Latest resource snapshot from the health sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<u64>,
}

impl AgentState {
    /// Fresh record for an agent that is being started for `user_id`.
    pub fn starting(user_id: &str, agent_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            status: AgentStatus::Starting,
            container_id: None,
            instance_id: None,
            created_at: now,
            last_activity: now,
            last_frozen: None,
            last_unfrozen: None,
            error_message: None,
            memory_usage: None,
            cpu_usage: None,
        }
    }
}

pub(crate) fn user_key(user_id: &str) -> String {
    format!("user:{user_id}:agentId")
}

pub(crate) fn agent_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:state")
}

/// Persistence operations the lifecycle manager depends on.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The agent currently mapped to a user, if any.
    async fn agent_id_for_user(&self, user_id: &str) -> anyhow::Result<Option<String>>;

    async fn agent_state(&self, agent_id: &str) -> anyhow::Result<Option<AgentState>>;

    /// Write the state record and the user index in one atomic step.
    async fn save(&self, state: &AgentState) -> anyhow::Result<()>;

    /// Remove the state record and the user index in one atomic step.
    async fn delete(&self, user_id: &str, agent_id: &str) -> anyhow::Result<()>;

    /// Every persisted agent record, for sweeps and fleet operations.
    async fn all_agent_states(&self) -> anyhow::Result<Vec<AgentState>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::Starting).unwrap(),
            "\"starting\""
        );
        let status: AgentStatus = serde_json::from_str("\"frozen\"").unwrap();
        assert_eq!(status, AgentStatus::Frozen);
    }

    #[test]
    fn only_live_statuses_count_toward_limits() {
        assert!(AgentStatus::Starting.counts_toward_limits());
        assert!(AgentStatus::Active.counts_toward_limits());
        assert!(!AgentStatus::Frozen.counts_toward_limits());
        assert!(!AgentStatus::Stopping.counts_toward_limits());
        assert!(!AgentStatus::Error.counts_toward_limits());
    }

    #[test]
    fn keyspace_layout() {
        assert_eq!(user_key("u1"), "user:u1:agentId");
        assert_eq!(agent_key("agent-u1-7"), "agent:agent-u1-7:state");
    }

    #[test]
    fn state_round_trips() {
        let mut state = AgentState::starting("u1", "agent-u1-7");
        state.status = AgentStatus::Active;
        state.container_id = Some("c1".into());
        state.memory_usage = Some(64 * 1024 * 1024);

        let raw = serde_json::to_string(&state).unwrap();
        let parsed: AgentState = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, state);
    }
}
