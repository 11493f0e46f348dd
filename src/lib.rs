/// Rankflow: multi-tenant workflow orchestration core
///
/// Composes templated job trees, persists them in a durable queue backend,
/// drains queues with bounded worker pools, fans lifecycle events out per
/// tenant and fires flows on cron schedules.

// Core configuration and setup
pub mod config;

// Durable queue, flow and schedule storage on SQLite
pub mod backend;

// Workflow layer - templates, DAG validation and flow composition
pub mod workflow;

// Tenant-scoped event bus
pub mod events;

// Runtime - execution engine, worker pools, workspaces and cron scheduler
pub mod runtime;

// Service wiring and process lifecycle
pub mod server;

// Re-export commonly used types for external consumers
pub use backend::{FlowHandle, JobRecord, JobState, ScheduleEntry, SqliteBackend};
pub use events::{Event, EventBus, EventType};
pub use runtime::{Agent, AgentError, AgentRegistry, CronSchedulerService, ExecutionEngine};
pub use server::{build_app, run_service, App};
pub use workflow::{FlowComposer, FlowInput, TemplateRegistry};
