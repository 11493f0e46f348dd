/// Configuration management for the rankflow orchestration core
///
/// Handles backend connection, worker pool sizing, event namespacing and
/// workspace placement. Every value can be overridden through environment
/// variables so the same binary runs unchanged in containers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Queue that carries the root job of every flow
pub const ORCHESTRATOR_QUEUE: &str = "orchestrator";
/// General-purpose queue for CPU/network-bound agents
pub const SMART_AGENTS_QUEUE: &str = "smart-agents";
/// Lower-priority queue for best-effort background agents
pub const AUTO_TASKS_QUEUE: &str = "auto-tasks";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Durable backend configuration
    pub database: DatabaseConfig,
    /// Worker pool configuration
    pub workers: WorkerConfig,
    /// Event bus configuration
    pub events: EventConfig,
    /// Cron scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Agent workspace configuration
    pub workspace: WorkspaceConfig,
    /// Downstream agent endpoint configuration
    pub agents: AgentConfig,
}

/// Durable backend (queues, flows, schedules) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (e.g. "sqlite://data/rankflow.db")
    pub url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrency limit per named queue; one pool is started per entry
    pub concurrency: HashMap<String, usize>,
    /// How long an idle worker waits before polling its queue again
    pub poll_interval_ms: u64,
    /// Job lease length; an active job whose lease is not renewed for this
    /// long is assumed orphaned by a dead worker
    pub stalled_after_secs: u64,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Namespace prefix shared by every tenant channel
    pub prefix: String,
    /// Which pub/sub transport carries the events
    pub transport: EventTransport,
    /// How often shared-transport subscriptions read the event log
    pub poll_interval_ms: u64,
    /// Event log rows older than this are pruned by the running service
    pub retention_secs: u64,
}

/// Pub/sub transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTransport {
    /// Event log in the shared database; visible to every process
    Sqlite,
    /// In-process broadcast channels; visible to this process only
    Memory,
}

impl FromStr for EventTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(EventTransport::Sqlite),
            "memory" => Ok(EventTransport::Memory),
            other => Err(format!("unknown event transport '{other}'")),
        }
    }
}

/// Cron scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often timers are reconciled with the schedule table
    pub sync_interval_ms: u64,
}

/// Workspace isolator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory under which per-run sandboxes are created
    pub root_dir: String,
}

/// Configuration for the HTTP agent that delegates to downstream services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the agent service; agents are disabled when unset
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let mut concurrency = HashMap::new();
        concurrency.insert(
            ORCHESTRATOR_QUEUE.to_string(),
            env_parse("RANKFLOW_CONCURRENCY_ORCHESTRATOR", 2),
        );
        concurrency.insert(
            SMART_AGENTS_QUEUE.to_string(),
            env_parse("RANKFLOW_CONCURRENCY_SMART_AGENTS", 5),
        );
        concurrency.insert(
            AUTO_TASKS_QUEUE.to_string(),
            env_parse("RANKFLOW_CONCURRENCY_AUTO_TASKS", 2),
        );

        Self {
            database: DatabaseConfig {
                url: std::env::var("RANKFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/rankflow.db".to_string()),
                max_connections: env_parse("RANKFLOW_DB_MAX_CONNECTIONS", 5),
            },
            workers: WorkerConfig {
                concurrency,
                poll_interval_ms: env_parse("RANKFLOW_POLL_INTERVAL_MS", 250),
                stalled_after_secs: env_parse("RANKFLOW_STALLED_AFTER_SECS", 30),
            },
            events: EventConfig {
                prefix: std::env::var("RANKFLOW_EVENT_PREFIX")
                    .unwrap_or_else(|_| "rankflow".to_string()),
                transport: env_parse("RANKFLOW_EVENT_TRANSPORT", EventTransport::Sqlite),
                poll_interval_ms: env_parse("RANKFLOW_EVENT_POLL_MS", 100),
                retention_secs: env_parse("RANKFLOW_EVENT_RETENTION_SECS", 86_400),
            },
            scheduler: SchedulerConfig {
                sync_interval_ms: env_parse("RANKFLOW_SCHEDULE_SYNC_MS", 5_000),
            },
            workspace: WorkspaceConfig {
                root_dir: std::env::var("RANKFLOW_WORKSPACE_DIR")
                    .unwrap_or_else(|_| "data/workspaces".to_string()),
            },
            agents: AgentConfig {
                endpoint: std::env::var("RANKFLOW_AGENT_ENDPOINT")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                timeout_secs: env_parse("RANKFLOW_AGENT_TIMEOUT_SECS", 120),
            },
        }
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("RANKFLOW_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("RANKFLOW_TEST_GARBAGE", 7usize), 7);
        std::env::set_var("RANKFLOW_TEST_GARBAGE", " 12 ");
        assert_eq!(env_parse("RANKFLOW_TEST_GARBAGE", 7usize), 12);
        std::env::remove_var("RANKFLOW_TEST_GARBAGE");
    }

    #[test]
    fn test_event_transport_parses_case_insensitively() {
        assert_eq!("SQLite".parse::<EventTransport>(), Ok(EventTransport::Sqlite));
        assert_eq!("memory".parse::<EventTransport>(), Ok(EventTransport::Memory));
        assert!("redis".parse::<EventTransport>().is_err());
    }

    #[test]
    fn test_default_has_one_pool_per_builtin_queue() {
        let config = Config::default();
        for queue in [ORCHESTRATOR_QUEUE, SMART_AGENTS_QUEUE, AUTO_TASKS_QUEUE] {
            assert!(config.workers.concurrency.contains_key(queue));
        }
    }
}
