//! Redis-backed state store.
//!
//! Uses a multiplexed async connection shared across tasks. Atomicity of
//! the two-key writes comes from `MULTI`/`EXEC` pipelines; enumeration uses
//! cursor-based `SCAN` so a large fleet never blocks the server.

use super::{agent_key, user_key, AgentState, StateStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

/// [`StateStore`] over a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port`). Fails fatally when the
    /// server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid Redis URL {url}"))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .with_context(|| format!("Failed to connect to Redis at {url}"))?;
        Ok(Self { conn })
    }

    async fn scan_agent_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("agent:*:state")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .context("SCAN over agent state keys failed")?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn agent_id_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let agent_id: Option<String> = conn
            .get(user_key(user_id))
            .await
            .context("Failed to read user index")?;
        Ok(agent_id)
    }

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(agent_key(agent_id))
            .await
            .context("Failed to read agent state")?;
        match raw {
            Some(raw) => {
                let state = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt state record for agent {agent_id}"))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &AgentState) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(state).context("Failed to serialize agent state")?;
        redis::pipe()
            .atomic()
            .set(user_key(&state.user_id), &state.agent_id)
            .set(agent_key(&state.agent_id), raw)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to persist agent state")?;
        Ok(())
    }

    async fn delete(&self, user_id: &str, agent_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(user_key(user_id))
            .del(agent_key(agent_id))
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to delete agent state")?;
        Ok(())
    }

    async fn all_agent_states(&self) -> Result<Vec<AgentState>> {
        let keys = self.scan_agent_keys().await?;
        let mut conn = self.conn.clone();
        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn
                .get(&key)
                .await
                .with_context(|| format!("Failed to read {key}"))?;
            let Some(raw) = raw else {
                // Deleted between SCAN and GET.
                continue;
            };
            match serde_json::from_str::<AgentState>(&raw) {
                Ok(state) => states.push(state),
                Err(e) => warn!(key, "skipping corrupt agent state record: {e}"),
            }
        }
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(states)
    }
}
