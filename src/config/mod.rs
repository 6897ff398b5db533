//! Swarmlet configuration, loaded from `config.toml`.
//!
//! Resolution order: explicit `--config` path → `SWARMLET_CONFIG` env →
//! `~/.swarmlet/config.toml` → built-in defaults. Broker and store URLs can
//! additionally be overridden with `SWARMLET_BROKER_URL` / `SWARMLET_STORE_URL`
//! so containers can be pointed at the right endpoints through their
//! environment alone.

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Broker connection and exchange topology (`[broker]`).
    pub broker: BrokerConfig,
    /// State store connection (`[store]`).
    pub store: StoreConfig,
    /// Container runtime settings (`[runtime]`).
    pub runtime: RuntimeConfig,
    /// Admission ceilings (`[limits]`).
    pub limits: LimitsConfig,
    /// Lifecycle timeouts and sweep intervals (`[lifecycle]`).
    pub lifecycle: LifecycleConfig,
    /// Encrypted state vault (`[vault]`).
    pub vault: VaultConfig,
}

/// Broker connection, exchange topology, and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Main topic exchange all agent traffic is published to.
    pub exchange: String,
    /// Dead-letter topic exchange for exhausted deliveries.
    pub dead_letter_exchange: String,
    /// Queue the dead-letter consumer reads from.
    pub dead_letter_queue: String,
    /// Per-queue message TTL in milliseconds.
    pub message_ttl_ms: u32,
    /// Max priority declared on worker queues (priorities map low=1, medium=5, high=9).
    pub max_priority: u8,
    /// Reconnect attempts before the bus client gives up.
    pub reconnect_max_attempts: u32,
    /// Base reconnect delay in milliseconds, doubled per attempt.
    pub reconnect_base_delay_ms: u64,
    /// Delivery attempts ceiling before the dead-letter consumer drops an envelope.
    pub redelivery_ceiling: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".into(),
            exchange: "swarmlet.main".into(),
            dead_letter_exchange: "swarmlet.dlx".into(),
            dead_letter_queue: "swarmlet.dead-letter".into(),
            message_ttl_ms: 60_000,
            max_priority: 9,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            redelivery_ceiling: 3,
        }
    }
}

/// Key-value state store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".into(),
        }
    }
}

/// Container runtime settings for worker containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Image run for every worker container.
    pub image: String,
    /// Hard memory limit in MiB.
    pub memory_limit_mb: u64,
    /// Memory+swap ceiling in MiB.
    pub memory_swap_mb: u64,
    /// Relative CPU shares.
    pub cpu_shares: u32,
    /// Docker network to attach, empty for the engine default.
    pub network: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: "swarmlet-worker:latest".into(),
            memory_limit_mb: 256,
            memory_swap_mb: 512,
            cpu_shares: 512,
            network: String::new(),
        }
    }
}

/// Admission ceilings for concurrently live agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Agents in {starting, active} allowed per user.
    pub max_agents_per_user: usize,
    /// Agents in {starting, active} allowed system-wide.
    pub max_system_agents: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_agents_per_user: 1,
            max_system_agents: 10,
        }
    }
}

/// What the health sweep does when a container stops answering stat calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HealthFailurePolicy {
    /// Record the failure and keep going (the conservative default).
    #[default]
    Ignore,
    /// Move the agent to `error` after `health_failure_threshold`
    /// consecutive failures so the next activity call recovers it.
    MarkError,
}

/// Lifecycle timeouts, sweep intervals, and health policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds of user inactivity before an active agent is frozen.
    pub inactivity_timeout_secs: u64,
    /// Seconds a new or unfreezing agent gets to answer its readiness probe.
    pub startup_timeout_secs: u64,
    /// Milliseconds between readiness probe attempts within the startup window.
    pub probe_interval_ms: u64,
    /// Seconds to wait for SAVE_STATE / LOAD_STATE responses.
    pub command_timeout_secs: u64,
    /// Seconds between inactivity sweep passes.
    pub sweep_interval_secs: u64,
    /// Seconds between health sweep passes.
    pub health_interval_secs: u64,
    /// Per-agent timeout for fleet termination, in seconds.
    pub kill_timeout_secs: u64,
    /// Health sweep failure policy.
    pub health_failure_policy: HealthFailurePolicy,
    /// Consecutive stat failures tolerated before `mark-error` acts.
    pub health_failure_threshold: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 30 * 60,
            startup_timeout_secs: 30,
            probe_interval_ms: 1_000,
            command_timeout_secs: 30,
            sweep_interval_secs: 60,
            health_interval_secs: 60,
            kill_timeout_secs: 30,
            health_failure_policy: HealthFailurePolicy::Ignore,
            health_failure_threshold: 3,
        }
    }
}

/// Encrypted per-user state vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory state blobs are written to.
    pub dir: PathBuf,
    /// Encrypt blobs at rest. Disable only for debugging.
    pub encrypt: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("vault"),
            encrypt: true,
        }
    }
}

impl Config {
    /// Load configuration, falling back to defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => Some(p.to_path_buf()),
            None => match std::env::var("SWARMLET_CONFIG") {
                Ok(p) => Some(PathBuf::from(p)),
                Err(_) => Self::default_path(),
            },
        };

        let mut config = match resolved {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            _ => Self::default(),
        };

        if let Ok(url) = std::env::var("SWARMLET_BROKER_URL") {
            config.broker.url = url;
        }
        if let Ok(url) = std::env::var("SWARMLET_STORE_URL") {
            config.store.url = url;
        }

        Ok(config)
    }

    /// `~/.swarmlet/config.toml`, when a home directory can be resolved.
    fn default_path() -> Option<PathBuf> {
        UserDirs::new().map(|dirs| dirs.home_dir().join(".swarmlet").join("config.toml"))
    }
}
