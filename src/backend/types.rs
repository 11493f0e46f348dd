/// Record types persisted by the durable backend

use crate::workflow::types::{FlowInput, JobOptions, JobPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Held until every prerequisite is terminal
    WaitingChildren,
    Waiting,
    Active,
    /// Waiting for a retry backoff to elapse
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::WaitingChildren => "waiting-children",
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting-children" => Ok(JobState::WaitingChildren),
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(anyhow::anyhow!("Unknown job state: {}", other)),
        }
    }
}

/// A job as stored in the queue backend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Stable across retries; the logical job token
    pub id: String,
    pub flow_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub queue: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub state: JobState,
    /// Attempts started so far (1 while the first attempt runs)
    pub attempts_made: u32,
    pub run_at: DateTime<Utc>,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn tenant_id(&self) -> &str {
        &self.payload.tenant_id
    }

    /// Whether a failure of the current attempt still leaves budget for another
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.options.attempts
    }
}

/// Terminal outcome of a prerequisite, as seen by its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildResult {
    pub job_id: String,
    pub name: String,
    pub state: JobState,
    pub value: Option<Value>,
    pub error: Option<String>,
}

/// Handle returned once a flow has been accepted by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowHandle {
    pub flow_id: String,
    pub root_job_id: String,
    /// Every job id created for the flow, root first
    pub job_ids: Vec<String>,
}

/// Job counts per state for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub waiting_children: u64,
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::WaitingChildren => self.waiting_children += count,
            JobState::Waiting => self.waiting += count,
            JobState::Active => self.active += count,
            JobState::Delayed => self.delayed += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
        }
    }

    /// Jobs that still have work ahead of them
    pub fn pending(&self) -> u64 {
        self.waiting_children + self.waiting + self.active + self.delayed
    }
}

/// Aggregate status of a flow across every queue it touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatus {
    pub flow_id: String,
    pub template: String,
    pub tenant_id: String,
    pub queues: BTreeMap<String, JobCounts>,
}

impl FlowStatus {
    /// No waiting, active or delayed job remains on any participating queue
    ///
    /// Says nothing about success: inspect `failed` counts or job records.
    pub fn is_drained(&self) -> bool {
        self.queues.values().all(|c| c.pending() == 0)
    }

    pub fn totals(&self) -> JobCounts {
        let mut total = JobCounts::default();
        for counts in self.queues.values() {
            total.waiting_children += counts.waiting_children;
            total.waiting += counts.waiting;
            total.active += counts.active;
            total.delayed += counts.delayed;
            total.completed += counts.completed;
            total.failed += counts.failed;
        }
        total
    }
}

/// Recurring trigger for a workflow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// Globally unique; upserts replace by id
    pub id: String,
    pub cron_expression: String,
    /// IANA timezone name the cron expression is evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub flow_name: String,
    pub flow_input: FlowInput,
    /// Disabled entries are kept but never fire
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

impl ScheduleEntry {
    pub fn new(
        id: impl Into<String>,
        cron_expression: impl Into<String>,
        flow_name: impl Into<String>,
        flow_input: FlowInput,
    ) -> Self {
        Self {
            id: id.into(),
            cron_expression: cron_expression.into(),
            timezone: default_timezone(),
            flow_name: flow_name.into(),
            flow_input,
            enabled: true,
            last_fired_at: None,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_round_trips_through_str() {
        for state in [
            JobState::WaitingChildren,
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn test_drained_ignores_terminal_counts() {
        let mut counts = JobCounts::default();
        counts.add(JobState::Completed, 3);
        counts.add(JobState::Failed, 2);
        let mut status = FlowStatus {
            flow_id: "f".into(),
            template: "t".into(),
            tenant_id: "tenant".into(),
            queues: BTreeMap::from([("smart-agents".to_string(), counts)]),
        };
        assert!(status.is_drained());

        status
            .queues
            .entry("auto-tasks".into())
            .or_default()
            .add(JobState::Delayed, 1);
        assert!(!status.is_drained());
        assert_eq!(status.totals().failed, 2);
    }

    #[test]
    fn test_schedule_entry_defaults_from_json() {
        let entry: ScheduleEntry = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "cronExpression": "0 9 * * 1",
            "flowName": "seo-monitoring-sweep",
            "flowInput": {"tenantId": "t", "projectId": "p"}
        }))
        .unwrap();
        assert_eq!(entry.timezone, "UTC");
        assert!(entry.enabled);
    }
}
