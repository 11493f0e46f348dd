/// Core workflow type definitions
///
/// Defines the runtime job graph that the Flow Composer hands to the queue
/// backend: typed flow input, per-agent job payloads, retry options and the
/// flow descriptor itself. Everything here is serialized as camelCase JSON
/// because payloads cross the process boundary to downstream agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Typed input handed to a workflow template generator
///
/// Carries the tenancy identifiers every job inherits plus the SEO-specific
/// knobs the built-in templates read. Unused fields are simply ignored by
/// templates that don't need them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInput {
    /// Owning tenant, required and non-empty
    pub tenant_id: String,
    /// Project within the tenant
    pub project_id: String,
    /// Target site domain (e.g. "example.com")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Keywords the flow works on
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Competitor domains for gap analysis
    #[serde(default)]
    pub competitors: Vec<String>,
    /// Physical location for local SEO (e.g. "Austin, TX")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Search locale (e.g. "en-US")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl FlowInput {
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            domain: None,
            keywords: Vec::new(),
            competitors: Vec::new(),
            location: None,
            locale: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_competitors<I, S>(mut self, competitors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.competitors = competitors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Domain or an empty string, for templates that always emit domain jobs
    pub fn domain_or_default(&self) -> String {
        self.domain.clone().unwrap_or_default()
    }

    /// Build a payload for one agent task, stamped with this input's tenancy
    pub fn payload(&self, task: AgentTask) -> JobPayload {
        JobPayload {
            tenant_id: self.tenant_id.clone(),
            project_id: self.project_id.clone(),
            task,
        }
    }
}

/// Serializable job payload: tenancy identifiers plus the agent-specific task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub tenant_id: String,
    pub project_id: String,
    pub task: AgentTask,
}

/// Agent-specific task parameters, tagged by agent name
///
/// Each variant maps to exactly one agent so a handler knows its payload
/// shape statically. `Generic` covers agents registered outside the
/// built-in vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "agent", content = "params", rename_all = "kebab-case")]
pub enum AgentTask {
    KeywordResearch(KeywordParams),
    ContentBrief(KeywordParams),
    ContentWriter(KeywordParams),
    SerpAnalysis(KeywordParams),
    RankTracker(KeywordParams),
    SerpMonitor(KeywordParams),
    SerpFeatures(KeywordParams),
    TechnicalAudit(DomainParams),
    OnPageAudit(DomainParams),
    ContentAudit(DomainParams),
    BacklinkAudit(DomainParams),
    BacklinkMonitor(DomainParams),
    SiteSpeed(DomainParams),
    MobileUsability(DomainParams),
    SchemaValidation(DomainParams),
    CompetitorAnalysis(CompetitorParams),
    KeywordGap(CompetitorParams),
    GbpAudit(LocalParams),
    CitationAudit(LocalParams),
    ReviewMonitor(LocalParams),
    LocalRankTracker(LocalParams),
    FlowSummary(SummaryParams),
    Generic(GenericParams),
}

impl AgentTask {
    /// Agent ids of the built-in task vocabulary, excluding `flow-summary`
    pub const BUILTIN_AGENTS: &'static [&'static str] = &[
        "keyword-research",
        "content-brief",
        "content-writer",
        "serp-analysis",
        "rank-tracker",
        "serp-monitor",
        "serp-features",
        "technical-audit",
        "on-page-audit",
        "content-audit",
        "backlink-audit",
        "backlink-monitor",
        "site-speed",
        "mobile-usability",
        "schema-validation",
        "competitor-analysis",
        "keyword-gap",
        "gbp-audit",
        "citation-audit",
        "review-monitor",
        "local-rank-tracker",
    ];

    /// Stable agent id this task is addressed to
    pub fn agent_name(&self) -> &str {
        match self {
            AgentTask::KeywordResearch(_) => "keyword-research",
            AgentTask::ContentBrief(_) => "content-brief",
            AgentTask::ContentWriter(_) => "content-writer",
            AgentTask::SerpAnalysis(_) => "serp-analysis",
            AgentTask::RankTracker(_) => "rank-tracker",
            AgentTask::SerpMonitor(_) => "serp-monitor",
            AgentTask::SerpFeatures(_) => "serp-features",
            AgentTask::TechnicalAudit(_) => "technical-audit",
            AgentTask::OnPageAudit(_) => "on-page-audit",
            AgentTask::ContentAudit(_) => "content-audit",
            AgentTask::BacklinkAudit(_) => "backlink-audit",
            AgentTask::BacklinkMonitor(_) => "backlink-monitor",
            AgentTask::SiteSpeed(_) => "site-speed",
            AgentTask::MobileUsability(_) => "mobile-usability",
            AgentTask::SchemaValidation(_) => "schema-validation",
            AgentTask::CompetitorAnalysis(_) => "competitor-analysis",
            AgentTask::KeywordGap(_) => "keyword-gap",
            AgentTask::GbpAudit(_) => "gbp-audit",
            AgentTask::CitationAudit(_) => "citation-audit",
            AgentTask::ReviewMonitor(_) => "review-monitor",
            AgentTask::LocalRankTracker(_) => "local-rank-tracker",
            AgentTask::FlowSummary(_) => "flow-summary",
            AgentTask::Generic(params) => &params.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordParams {
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainParams {
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorParams {
    pub domain: String,
    pub competitors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalParams {
    pub location: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryParams {
    /// Template the summarised flow was built from
    pub flow: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericParams {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// Delay policy between failed attempts of the same job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
    /// delay_ms * 2^(failures - 1)
    Exponential {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts have failed so far
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 1000 }
    }
}

/// Retry and retention options for a single job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total attempts including the first one
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Purge the job record once it completes
    #[serde(default)]
    pub remove_on_complete: bool,
    /// Purge the job record once it fails terminally
    #[serde(default)]
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, remove_on_complete: bool, remove_on_fail: bool) -> Self {
        self.remove_on_complete = remove_on_complete;
        self.remove_on_fail = remove_on_fail;
        self
    }
}

/// One unit of work bound for a named queue
///
/// `children` are prerequisites: this job stays in `waiting-children` until
/// each of them reaches a terminal state, and can read their results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Agent id the job is routed to
    pub name: String,
    pub queue_name: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<JobDescriptor>,
}

impl JobDescriptor {
    /// Job addressed to the agent named by its task
    pub fn new(queue_name: impl Into<String>, payload: JobPayload) -> Self {
        let name = payload.task.agent_name().to_string();
        Self::named(name, queue_name, payload)
    }

    /// Job with an explicit name (root jobs are named after their template)
    pub fn named(name: impl Into<String>, queue_name: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            payload,
            options: JobOptions::default(),
            children: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Add a prerequisite whose output this job consumes
    pub fn with_prerequisite(mut self, child: JobDescriptor) -> Self {
        self.children.push(child);
        self
    }

    /// Number of jobs in this subtree, including this one
    pub fn total_jobs(&self) -> usize {
        1 + self.children.iter().map(JobDescriptor::total_jobs).sum::<usize>()
    }

    /// Visit this job and every prerequisite, depth first
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a JobDescriptor)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// A root job plus its ordered children: one invocation of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDescriptor {
    /// Template the flow was composed from
    pub template: String,
    pub root: JobDescriptor,
    pub children: Vec<JobDescriptor>,
}

impl FlowDescriptor {
    /// Total job records the flow creates, root included
    pub fn job_count(&self) -> usize {
        1 + self.children.iter().map(JobDescriptor::total_jobs).sum::<usize>()
    }

    /// Every distinct queue the flow touches, in first-seen order
    pub fn queues(&self) -> Vec<String> {
        let mut queues = vec![self.root.queue_name.clone()];
        for child in &self.children {
            child.walk(&mut |job| {
                if !queues.contains(&job.queue_name) {
                    queues.push(job.queue_name.clone());
                }
            });
        }
        queues
    }

    pub fn tenant_id(&self) -> &str {
        &self.root.payload.tenant_id
    }
}
