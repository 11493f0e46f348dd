/// Runtime Layer
///
/// Everything that happens after a flow is enqueued:
/// - Agent contract and job-name registry
/// - Execution engine running one claimed job end to end
/// - Bounded-concurrency worker pools, one per queue
/// - Per-run workspace sandboxes
/// - Durable cron scheduler that submits flows on a cadence

// Agent trait, execution context and agent registry
pub mod agent;

// Single-job execution with retry decisions and lifecycle events
pub mod engine;

// Worker pools draining named queues
pub mod worker;

// Per-run sandbox directories
pub mod workspace;

// Root-job finaliser that summarises a flow
pub mod summary;

// Agent delegating to a downstream HTTP service
pub mod http_agent;

// Background cron scheduler service for recurring flows
pub mod scheduler;

// Re-export main types
pub use agent::{agent_fn, Agent, AgentError, AgentRegistry, ExecutionContext};
pub use engine::{ExecutionEngine, JobOutcome};
pub use http_agent::{register_http_agents, HttpAgent};
pub use scheduler::{CronSchedulerService, ScheduleError};
pub use summary::{register_flow_finalizer, FlowSummaryAgent, FLOW_SUMMARY_AGENT};
pub use worker::{run_pools, run_worker, WorkerHandle, WorkerOptions};
pub use workspace::{Workspace, WorkspaceError, WorkspaceIsolator};
