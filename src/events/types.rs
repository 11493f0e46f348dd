/// Event vocabulary published on the tenant-scoped bus

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Fixed set of lifecycle and domain event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.task.started")]
    AgentTaskStarted,
    #[serde(rename = "agent.task.completed")]
    AgentTaskCompleted,
    #[serde(rename = "agent.task.failed")]
    AgentTaskFailed,
    #[serde(rename = "flow.submitted")]
    FlowSubmitted,
    #[serde(rename = "schedule.triggered")]
    ScheduleTriggered,
    #[serde(rename = "serp.rank.anomaly")]
    SerpRankAnomaly,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentTaskStarted => "agent.task.started",
            EventType::AgentTaskCompleted => "agent.task.completed",
            EventType::AgentTaskFailed => "agent.task.failed",
            EventType::FlowSubmitted => "flow.submitted",
            EventType::ScheduleTriggered => "schedule.triggered",
            EventType::SerpRankAnomaly => "serp.rank.anomaly",
        }
    }

    /// Raised by agents themselves rather than by the engine's lifecycle
    pub fn is_domain(&self) -> bool {
        matches!(self, EventType::SerpRankAnomaly)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable event record: `{type, tenantId, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub tenant_id: String,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: EventType, tenant_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            tenant_id: tenant_id.into(),
            payload,
        }
    }

    pub fn task_started(tenant_id: &str, job_id: &str, job_name: &str, attempt: u32) -> Self {
        Self::new(
            EventType::AgentTaskStarted,
            tenant_id,
            json!({
                "tenantId": tenant_id,
                "jobId": job_id,
                "jobName": job_name,
                "attempt": attempt,
            }),
        )
    }

    pub fn task_completed(tenant_id: &str, job_id: &str, job_name: &str, result: &Value) -> Self {
        Self::new(
            EventType::AgentTaskCompleted,
            tenant_id,
            json!({
                "tenantId": tenant_id,
                "jobId": job_id,
                "jobName": job_name,
                "result": result,
            }),
        )
    }

    pub fn task_failed(
        tenant_id: &str,
        job_id: &str,
        job_name: &str,
        error: &str,
        will_retry: bool,
    ) -> Self {
        Self::new(
            EventType::AgentTaskFailed,
            tenant_id,
            json!({
                "tenantId": tenant_id,
                "jobId": job_id,
                "jobName": job_name,
                "error": error,
                "willRetry": will_retry,
            }),
        )
    }

    pub fn flow_submitted(tenant_id: &str, flow_id: &str, template: &str, job_count: usize) -> Self {
        Self::new(
            EventType::FlowSubmitted,
            tenant_id,
            json!({
                "tenantId": tenant_id,
                "flowId": flow_id,
                "template": template,
                "jobCount": job_count,
            }),
        )
    }

    pub fn schedule_triggered(
        tenant_id: &str,
        schedule_id: &str,
        flow_name: &str,
        flow_id: &str,
    ) -> Self {
        Self::new(
            EventType::ScheduleTriggered,
            tenant_id,
            json!({
                "tenantId": tenant_id,
                "scheduleId": schedule_id,
                "flowName": flow_name,
                "flowId": flow_id,
            }),
        )
    }

    /// Domain event raised by rank-tracking agents
    pub fn rank_anomaly(tenant_id: &str, keyword: &str, previous: u32, current: u32) -> Self {
        Self::new(
            EventType::SerpRankAnomaly,
            tenant_id,
            json!({
                "tenantId": tenant_id,
                "keyword": keyword,
                "previousPosition": previous,
                "currentPosition": current,
            }),
        )
    }

    /// `jobId` of an `agent.task.*` event
    pub fn job_id(&self) -> Option<&str> {
        self.payload.get("jobId").and_then(Value::as_str)
    }

    /// `willRetry` of an `agent.task.failed` event
    pub fn will_retry(&self) -> Option<bool> {
        self.payload.get("willRetry").and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = Event::task_failed("tenant-a", "job-1", "rank-tracker", "timeout", true);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent.task.failed");
        assert_eq!(json["tenantId"], "tenant-a");
        assert_eq!(json["payload"]["willRetry"], true);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.job_id(), Some("job-1"));
        assert_eq!(back.will_retry(), Some(true));
    }

    #[test]
    fn test_type_names_match_serde() {
        for event_type in [
            EventType::AgentTaskStarted,
            EventType::AgentTaskCompleted,
            EventType::AgentTaskFailed,
            EventType::FlowSubmitted,
            EventType::ScheduleTriggered,
            EventType::SerpRankAnomaly,
        ] {
            assert_eq!(
                serde_json::to_value(event_type).unwrap(),
                Value::String(event_type.as_str().to_string())
            );
        }
    }
}
