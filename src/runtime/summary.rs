/// Flow finaliser
///
/// Root jobs are named after their template and run once every child is
/// terminal. Their payload addresses the `flow-summary` agent, which the
/// engine falls back to when no agent is registered under the template
/// name, so templates registered at any time are finalised. The agent
/// tallies the children's outcomes so the flow's root record carries a
/// summary.

use crate::backend::types::JobState;
use crate::runtime::agent::{Agent, AgentError, AgentRegistry, ExecutionContext};
use crate::workflow::types::{AgentTask, JobPayload};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
pub struct FlowSummaryAgent;

#[async_trait]
impl Agent for FlowSummaryAgent {
    async fn run(&self, payload: &JobPayload, ctx: &ExecutionContext) -> Result<Value, AgentError> {
        let flow = match &payload.task {
            AgentTask::FlowSummary(params) => params.flow.clone(),
            _ => ctx.job_name.clone(),
        };

        let completed = ctx
            .children
            .iter()
            .filter(|c| c.state == JobState::Completed)
            .count();
        let failed = ctx.failed_children();
        let children: Vec<Value> = ctx
            .children
            .iter()
            .map(|c| json!({"name": c.name, "state": c.state, "error": c.error}))
            .collect();

        tracing::info!(
            flow_id = %ctx.flow_id,
            tenant_id = %payload.tenant_id,
            "📋 Flow '{}' finished: {} completed, {} failed",
            flow,
            completed,
            failed
        );

        Ok(json!({
            "flow": flow,
            "completed": completed,
            "failed": failed,
            "total": ctx.children.len(),
            "children": children,
        }))
    }
}

/// Agent id addressed by every root job's payload
pub const FLOW_SUMMARY_AGENT: &str = "flow-summary";

/// Register the summary agent that finalises root jobs
pub fn register_flow_finalizer(agents: &mut AgentRegistry) {
    agents.register(FLOW_SUMMARY_AGENT, Arc::new(FlowSummaryAgent));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::ChildResult;
    use crate::events::EventBus;
    use crate::workflow::types::{FlowInput, SummaryParams};
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_summary_counts_outcomes() {
        let child = |name: &str, state| ChildResult {
            job_id: name.into(),
            name: name.into(),
            state,
            value: None,
            error: None,
        };
        let ctx = ExecutionContext {
            job_id: "root".into(),
            tenant_id: "t".into(),
            job_name: "comprehensive-seo-audit".into(),
            queue: "orchestrator".into(),
            flow_id: "f".into(),
            attempt: 1,
            max_attempts: 3,
            workspace: PathBuf::from("/tmp"),
            children: vec![
                child("technical-audit", JobState::Completed),
                child("site-speed", JobState::Failed),
                child("rank-tracker", JobState::Completed),
            ],
            events: EventBus::in_memory("test"),
        };
        let payload = FlowInput::new("t", "p").payload(AgentTask::FlowSummary(SummaryParams {
            flow: "comprehensive-seo-audit".into(),
        }));

        let out = FlowSummaryAgent.run(&payload, &ctx).await.unwrap();
        assert_eq!(out["completed"], 2);
        assert_eq!(out["failed"], 1);
        assert_eq!(out["total"], 3);
        assert_eq!(out["flow"], "comprehensive-seo-audit");
    }

    #[test]
    fn test_finalizer_matches_root_payload_address() {
        let mut agents = AgentRegistry::new();
        register_flow_finalizer(&mut agents);
        let task = AgentTask::FlowSummary(SummaryParams { flow: "any".into() });
        assert!(agents.get(task.agent_name()).is_some());
        assert_eq!(agents.len(), 1);
    }
}
