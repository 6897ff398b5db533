//! In-process state store for tests and single-node runs.

use super::{AgentState, StateStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    /// user id → agent id.
    users: HashMap<String, String>,
    /// agent id → state record.
    agents: HashMap<String, AgentState>,
}

/// HashMap-backed [`StateStore`] with the same two-keyspace shape as the
/// Redis store. Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn agent_id_for_user(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.inner.lock().users.get(user_id).cloned())
    }

    async fn agent_state(&self, agent_id: &str) -> anyhow::Result<Option<AgentState>> {
        Ok(self.inner.lock().agents.get(agent_id).cloned())
    }

    async fn save(&self, state: &AgentState) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner
            .users
            .insert(state.user_id.clone(), state.agent_id.clone());
        inner.agents.insert(state.agent_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str, agent_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.users.remove(user_id);
        inner.agents.remove(agent_id);
        Ok(())
    }

    async fn all_agent_states(&self) -> anyhow::Result<Vec<AgentState>> {
        let mut states: Vec<_> = self.inner.lock().agents.values().cloned().collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AgentStatus;

    #[tokio::test]
    async fn save_updates_both_keyspaces() {
        let store = MemoryStore::new();
        let state = AgentState::starting("u1", "a1");
        store.save(&state).await.unwrap();

        assert_eq!(
            store.agent_id_for_user("u1").await.unwrap().as_deref(),
            Some("a1")
        );
        assert_eq!(
            store.agent_state("a1").await.unwrap().unwrap().status,
            AgentStatus::Starting
        );
    }

    #[tokio::test]
    async fn delete_removes_both_keyspaces() {
        let store = MemoryStore::new();
        store.save(&AgentState::starting("u1", "a1")).await.unwrap();
        store.delete("u1", "a1").await.unwrap();

        assert!(store.agent_id_for_user("u1").await.unwrap().is_none());
        assert!(store.agent_state("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn all_agent_states_is_sorted_by_agent_id() {
        let store = MemoryStore::new();
        store.save(&AgentState::starting("u2", "b2")).await.unwrap();
        store.save(&AgentState::starting("u1", "a1")).await.unwrap();

        let states = store.all_agent_states().await.unwrap();
        let ids: Vec<_> = states.iter().map(|s| s.agent_id.as_str()).collect();
        assert_eq!(ids, ["a1", "b2"]);
    }

    #[tokio::test]
    async fn resaving_overwrites_the_record() {
        let store = MemoryStore::new();
        let mut state = AgentState::starting("u1", "a1");
        store.save(&state).await.unwrap();

        state.status = AgentStatus::Active;
        state.container_id = Some("c1".into());
        store.save(&state).await.unwrap();

        let loaded = store.agent_state("a1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Active);
        assert_eq!(loaded.container_id.as_deref(), Some("c1"));
    }
}
