/// Job Execution Engine
///
/// Runs one claimed job end to end: resolve the agent by job name (falling
/// back to the agent its payload addresses), set up a
/// workspace, announce the start, invoke the agent, then record the outcome
/// and announce it. The retry decision is a pure function of the agent's
/// error kind and the job's remaining attempt budget.

use crate::backend::{FlowStatus, JobRecord, SqliteBackend};
use crate::events::{Event, EventBus};
use crate::runtime::agent::{AgentError, AgentRegistry, ExecutionContext};
use crate::runtime::workspace::WorkspaceIsolator;
use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happened to a processed job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    /// Re-enqueued; runs again after `delay`
    Retrying { delay: Duration, error: String },
    /// Attempt budget spent or terminal error
    Failed(String),
    /// The attempt lost ownership of the job (stalled and recovered)
    Discarded,
}

/// Executes claimed jobs against the agent registry
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    backend: SqliteBackend,
    agents: Arc<AgentRegistry>,
    events: EventBus,
    workspaces: WorkspaceIsolator,
}

impl ExecutionEngine {
    pub fn new(
        backend: SqliteBackend,
        agents: Arc<AgentRegistry>,
        events: EventBus,
        workspaces: WorkspaceIsolator,
    ) -> Self {
        Self {
            backend,
            agents,
            events,
            workspaces,
        }
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    /// Process one job that `claim_next` returned
    ///
    /// Agent failures never surface as `Err`: they become a job outcome and
    /// an event. `Err` means the backend itself could not be updated.
    pub async fn process(&self, job: JobRecord) -> Result<JobOutcome> {
        let started = Instant::now();
        let tenant_id = job.tenant_id().to_string();

        tracing::info!(
            job_id = %job.id,
            queue = %job.queue,
            tenant_id = %tenant_id,
            flow_id = %job.flow_id,
            "🚀 Running job '{}' (attempt {}/{})",
            job.name,
            job.attempts_made,
            job.options.attempts
        );

        let agent = self
            .agents
            .get(&job.name)
            .or_else(|| self.agents.get(job.payload.task.agent_name()));
        let result = match agent {
            Some(agent) => self.invoke(agent, &job).await,
            None => Err(AgentError::terminal(format!(
                "no agent registered for '{}'",
                job.name
            ))),
        };

        let outcome = match result {
            Ok(value) => self.record_success(&job, value).await?,
            Err(error) => self.record_failure(&job, error).await?,
        };

        tracing::debug!(job_id = %job.id, "⏱️ Job '{}' processed in {:?}", job.name, started.elapsed());
        Ok(outcome)
    }

    /// Workspace lifetime wraps the invocation on every exit path
    async fn invoke(
        &self,
        agent: Arc<dyn crate::runtime::agent::Agent>,
        job: &JobRecord,
    ) -> Result<Value, AgentError> {
        let workspace = self
            .workspaces
            .create(&job.name, &job.id)
            .await
            .map_err(|e| AgentError::retryable(e.to_string()))?;

        let children = match self.backend.children_results(&job.id).await {
            Ok(children) => children,
            Err(e) => {
                let _ = workspace.cleanup().await;
                return Err(AgentError::retryable(format!("failed to load prerequisites: {e}")));
            }
        };

        let ctx = ExecutionContext {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id().to_string(),
            job_name: job.name.clone(),
            queue: job.queue.clone(),
            flow_id: job.flow_id.clone(),
            attempt: job.attempts_made,
            max_attempts: job.options.attempts,
            workspace: workspace.path().to_path_buf(),
            children,
            events: self.events.clone(),
        };

        self.emit(Event::task_started(
            job.tenant_id(),
            &job.id,
            &job.name,
            job.attempts_made,
        ))
        .await;

        // Separate task so a panicking agent only fails this attempt
        let payload = job.payload.clone();
        let handle = tokio::spawn(async move { agent.run(&payload, &ctx).await });
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(AgentError::retryable("agent panicked")),
            Err(e) => Err(AgentError::retryable(format!("agent task aborted: {e}"))),
        };

        if let Err(e) = workspace.cleanup().await {
            tracing::error!(job_id = %job.id, "❌ {}", e);
        }
        result
    }

    async fn record_success(&self, job: &JobRecord, value: Value) -> Result<JobOutcome> {
        if !self.backend.complete_job(job, &value).await? {
            tracing::warn!(job_id = %job.id, "⚠️ Dropping result of '{}': job no longer owned", job.name);
            return Ok(JobOutcome::Discarded);
        }

        tracing::info!(job_id = %job.id, queue = %job.queue, tenant_id = %job.tenant_id(), "✅ Job '{}' completed", job.name);
        self.emit(Event::task_completed(job.tenant_id(), &job.id, &job.name, &value))
            .await;
        Ok(JobOutcome::Completed(value))
    }

    async fn record_failure(&self, job: &JobRecord, error: AgentError) -> Result<JobOutcome> {
        let message = error.message().to_string();

        if error.is_retryable() && job.can_retry() {
            let delay = job.options.backoff.delay_for(job.attempts_made);
            if !self.backend.retry_job(job, delay, &message).await? {
                return Ok(JobOutcome::Discarded);
            }
            tracing::warn!(
                job_id = %job.id,
                queue = %job.queue,
                tenant_id = %job.tenant_id(),
                "🔁 Job '{}' failed, retrying in {:?}: {}",
                job.name,
                delay,
                message
            );
            self.emit(Event::task_failed(job.tenant_id(), &job.id, &job.name, &message, true))
                .await;
            return Ok(JobOutcome::Retrying {
                delay,
                error: message,
            });
        }

        if !self.backend.fail_job(job, &message).await? {
            return Ok(JobOutcome::Discarded);
        }
        tracing::error!(
            job_id = %job.id,
            queue = %job.queue,
            tenant_id = %job.tenant_id(),
            "❌ Job '{}' failed after {} attempt(s): {}",
            job.name,
            job.attempts_made,
            message
        );
        self.emit(Event::task_failed(job.tenant_id(), &job.id, &job.name, &message, false))
            .await;
        Ok(JobOutcome::Failed(message))
    }

    /// Publish, logging instead of failing: events never decide a job's fate
    async fn emit(&self, event: Event) {
        if let Err(e) = self.events.publish(&event).await {
            tracing::warn!(tenant_id = %event.tenant_id, "⚠️ Failed to publish {}: {}", event.event_type, e);
        }
    }

    /// Poll a flow's status until it is drained or `timeout` elapses
    pub async fn wait_until_drained(
        &self,
        flow_id: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<FlowStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self
                .backend
                .flow_status(flow_id)
                .await?
                .ok_or_else(|| anyhow!("Unknown flow: {}", flow_id))?;
            if status.is_drained() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                bail!("Flow {} not drained after {:?}", flow_id, timeout);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
