/// Agent contract and registry
///
/// The orchestration core never implements agent logic. It resolves an
/// `Agent` by job name from a registry built once at process start and
/// hands it the typed payload plus an execution context.
///
/// The context also carries the tenant's event bus, so an agent can raise
/// domain events such as `serp.rank.anomaly` on its own tenant's channel.

use crate::backend::types::{ChildResult, JobState};
use crate::events::{Event, EventBus};
use crate::workflow::types::JobPayload;
use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of a failed agent invocation
///
/// The engine's retry decision depends only on the variant: retryable
/// errors consume the job's attempt budget, terminal errors end it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("retryable agent failure: {0}")]
    Retryable(String),

    #[error("terminal agent failure: {0}")]
    Terminal(String),
}

impl AgentError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        AgentError::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        AgentError::Terminal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            AgentError::Retryable(msg) | AgentError::Terminal(msg) => msg,
        }
    }
}

/// Everything an agent may know about the job it is running
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub tenant_id: String,
    pub job_name: String,
    pub queue: String,
    pub flow_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    /// Sandbox directory, removed after the invocation
    pub workspace: PathBuf,
    /// Terminal outcomes of this job's prerequisites
    pub children: Vec<ChildResult>,
    pub events: EventBus,
}

impl ExecutionContext {
    /// Return values of completed prerequisites, keyed by job name
    pub fn children_values(&self) -> Map<String, Value> {
        self.children
            .iter()
            .filter(|c| c.state == JobState::Completed)
            .map(|c| (c.name.clone(), c.value.clone().unwrap_or(Value::Null)))
            .collect()
    }

    /// Output of one completed prerequisite
    pub fn child_output(&self, name: &str) -> Option<&Value> {
        self.children
            .iter()
            .find(|c| c.name == name && c.state == JobState::Completed)
            .and_then(|c| c.value.as_ref())
    }

    pub fn failed_children(&self) -> usize {
        self.children
            .iter()
            .filter(|c| c.state == JobState::Failed)
            .count()
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Publish a domain event on this job's tenant channel
    ///
    /// Events addressed to any other tenant are refused.
    pub async fn emit(&self, event: &Event) -> anyhow::Result<usize> {
        if event.tenant_id != self.tenant_id {
            bail!(
                "job {} of tenant '{}' cannot publish for tenant '{}'",
                self.job_id,
                self.tenant_id,
                event.tenant_id
            );
        }
        self.events.publish(event).await
    }

    /// Announce a ranking position change for one keyword
    pub async fn report_rank_anomaly(
        &self,
        keyword: &str,
        previous: u32,
        current: u32,
    ) -> anyhow::Result<usize> {
        self.emit(&Event::rank_anomaly(&self.tenant_id, keyword, previous, current))
            .await
    }
}

/// Domain handler invoked for a job name
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, payload: &JobPayload, ctx: &ExecutionContext) -> Result<Value, AgentError>;
}

/// Agent backed by an async closure over owned inputs
pub struct FnAgent<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as an `Agent`
pub fn agent_fn<F, Fut>(f: F) -> FnAgent<F, Fut>
where
    F: Fn(JobPayload, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentError>> + Send,
{
    FnAgent {
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Agent for FnAgent<F, Fut>
where
    F: Fn(JobPayload, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentError>> + Send,
{
    async fn run(&self, payload: &JobPayload, ctx: &ExecutionContext) -> Result<Value, AgentError> {
        (self.f)(payload.clone(), ctx.clone()).await
    }
}

/// Job name -> agent lookup, built once and injected into the engine
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the agent serving `name`
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        let name = name.into();
        tracing::debug!("🤖 Registered agent: {}", name);
        self.agents.insert(name, agent);
    }

    /// Builder form of `register`
    pub fn with(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.register(name, agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{AgentTask, FlowInput, GenericParams};
    use serde_json::json;

    fn context(children: Vec<ChildResult>) -> ExecutionContext {
        ExecutionContext {
            job_id: "job-1".into(),
            tenant_id: "t".into(),
            job_name: "content-writer".into(),
            queue: "smart-agents".into(),
            flow_id: "flow-1".into(),
            attempt: 1,
            max_attempts: 3,
            workspace: PathBuf::from("/tmp/ws"),
            children,
            events: EventBus::in_memory("test"),
        }
    }

    fn child(name: &str, state: JobState, value: Option<Value>) -> ChildResult {
        ChildResult {
            job_id: format!("{name}-id"),
            name: name.into(),
            state,
            value,
            error: None,
        }
    }

    #[test]
    fn test_children_values_skip_failures() {
        let ctx = context(vec![
            child("content-brief", JobState::Completed, Some(json!({"outline": []}))),
            child("serp-analysis", JobState::Failed, None),
        ]);
        let values = ctx.children_values();
        assert_eq!(values.len(), 1);
        assert_eq!(ctx.child_output("content-brief"), Some(&json!({"outline": []})));
        assert!(ctx.child_output("serp-analysis").is_none());
        assert_eq!(ctx.failed_children(), 1);
    }

    #[tokio::test]
    async fn test_registry_resolves_closure_agent() {
        let registry = AgentRegistry::new().with(
            "echo",
            Arc::new(agent_fn(|payload: JobPayload, ctx: ExecutionContext| async move {
                Ok::<_, AgentError>(json!({"tenant": payload.tenant_id, "attempt": ctx.attempt}))
            })),
        );
        let agent = registry.get("echo").unwrap();
        let payload = FlowInput::new("t", "p").payload(AgentTask::Generic(GenericParams {
            name: "echo".into(),
            params: Value::Null,
        }));
        let out = agent.run(&payload, &context(Vec::new())).await.unwrap();
        assert_eq!(out, json!({"tenant": "t", "attempt": 1}));
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_emit_is_confined_to_own_tenant() {
        let ctx = context(Vec::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = ctx.events.subscribe("t", move |event: Event| {
            let _ = tx.send(event);
        });
        subscription.start().await.unwrap();

        assert_eq!(ctx.report_rank_anomaly("rust jobs", 3, 14).await.unwrap(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, crate::events::EventType::SerpRankAnomaly);
        assert_eq!(event.payload["currentPosition"], 14);

        let foreign = Event::rank_anomaly("other-tenant", "rust jobs", 3, 14);
        assert!(ctx.emit(&foreign).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_kind_drives_retry() {
        assert!(AgentError::retryable("timeout").is_retryable());
        assert!(!AgentError::terminal("bad input").is_retryable());
        assert_eq!(AgentError::terminal("bad input").message(), "bad input");
    }
}
