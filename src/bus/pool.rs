//! Instance pool & load tracker.
//!
//! Per logical agent, the set of live worker instances plus a load counter
//! per instance, used to pick a publish target (least-load policy). This is
//! an in-memory cache per bus-client process: it is rebuilt from instance
//! registration replay after a reconnect and is never authoritative for
//! admission decisions; the state store is.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct AgentPool {
    /// instance id → load counter.
    loads: HashMap<String, u64>,
}

/// Rebuildable instance/load bookkeeping owned by the bus client.
#[derive(Debug, Default)]
pub struct InstancePool {
    agents: RwLock<HashMap<String, AgentPool>>,
}

impl InstancePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance, creating the agent entry on first registration.
    /// Re-registering an existing instance keeps its load counter.
    pub fn register(&self, agent_id: &str, instance_id: &str) {
        let mut agents = self.agents.write();
        agents
            .entry(agent_id.to_string())
            .or_default()
            .loads
            .entry(instance_id.to_string())
            .or_insert(0);
    }

    /// Remove an instance; drops the agent entry when it was the last one.
    pub fn deregister(&self, agent_id: &str, instance_id: &str) {
        let mut agents = self.agents.write();
        if let Some(pool) = agents.get_mut(agent_id) {
            pool.loads.remove(instance_id);
            if pool.loads.is_empty() {
                agents.remove(agent_id);
            }
        }
    }

    /// Pick the registered instance with the lowest load counter.
    /// Ties break deterministically on instance id.
    pub fn least_loaded(&self, agent_id: &str) -> Option<String> {
        let agents = self.agents.read();
        let pool = agents.get(agent_id)?;
        pool.loads
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(instance_id, _)| instance_id.clone())
    }

    /// Bump an instance's load counter after a successful publish.
    pub fn increment(&self, agent_id: &str, instance_id: &str) {
        let mut agents = self.agents.write();
        if let Some(load) = agents
            .get_mut(agent_id)
            .and_then(|pool| pool.loads.get_mut(instance_id))
        {
            *load += 1;
        }
    }

    /// Drop an instance's load counter when its round-trip completes.
    /// Floors at zero.
    pub fn decrement(&self, agent_id: &str, instance_id: &str) {
        let mut agents = self.agents.write();
        if let Some(load) = agents
            .get_mut(agent_id)
            .and_then(|pool| pool.loads.get_mut(instance_id))
        {
            *load = load.saturating_sub(1);
        }
    }

    pub fn load(&self, agent_id: &str, instance_id: &str) -> Option<u64> {
        self.agents
            .read()
            .get(agent_id)
            .and_then(|pool| pool.loads.get(instance_id).copied())
    }

    /// All `(agent_id, instance_id)` registrations, for reconnect replay.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let agents = self.agents.read();
        let mut entries: Vec<_> = agents
            .iter()
            .flat_map(|(agent_id, pool)| {
                pool.loads
                    .keys()
                    .map(move |instance_id| (agent_id.clone(), instance_id.clone()))
            })
            .collect();
        entries.sort();
        entries
    }

    /// Zero every load counter. Used after a reconnect: counters describe a
    /// channel that no longer exists.
    pub fn reset_loads(&self) {
        let mut agents = self.agents.write();
        for pool in agents.values_mut() {
            for load in pool.loads.values_mut() {
                *load = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_loaded_picks_lowest_counter() {
        let pool = InstancePool::new();
        pool.register("a1", "i1");
        pool.register("a1", "i2");

        pool.increment("a1", "i1");
        pool.increment("a1", "i1");
        pool.increment("a1", "i2");

        assert_eq!(pool.least_loaded("a1").as_deref(), Some("i2"));
    }

    #[test]
    fn empty_pool_yields_no_instance() {
        let pool = InstancePool::new();
        assert!(pool.least_loaded("a1").is_none());

        pool.register("a1", "i1");
        pool.deregister("a1", "i1");
        assert!(pool.least_loaded("a1").is_none());
    }

    #[test]
    fn ties_break_on_instance_id() {
        let pool = InstancePool::new();
        pool.register("a1", "i2");
        pool.register("a1", "i1");
        assert_eq!(pool.least_loaded("a1").as_deref(), Some("i1"));
    }

    #[test]
    fn decrement_floors_at_zero() {
        let pool = InstancePool::new();
        pool.register("a1", "i1");
        pool.decrement("a1", "i1");
        assert_eq!(pool.load("a1", "i1"), Some(0));
    }

    #[test]
    fn reregistration_keeps_load() {
        let pool = InstancePool::new();
        pool.register("a1", "i1");
        pool.increment("a1", "i1");
        pool.register("a1", "i1");
        assert_eq!(pool.load("a1", "i1"), Some(1));
    }

    #[test]
    fn snapshot_lists_all_registrations() {
        let pool = InstancePool::new();
        pool.register("a1", "i1");
        pool.register("a1", "i2");
        pool.register("a2", "i3");

        let snapshot = pool.snapshot();
        assert_eq!(
            snapshot,
            vec![
                ("a1".to_string(), "i1".to_string()),
                ("a1".to_string(), "i2".to_string()),
                ("a2".to_string(), "i3".to_string()),
            ]
        );
    }

    #[test]
    fn reset_loads_zeroes_counters_but_keeps_instances() {
        let pool = InstancePool::new();
        pool.register("a1", "i1");
        pool.increment("a1", "i1");
        pool.reset_loads();
        assert_eq!(pool.load("a1", "i1"), Some(0));
        assert_eq!(pool.least_loaded("a1").as_deref(), Some("i1"));
    }
}
