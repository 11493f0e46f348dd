/// Built-in workflow templates
///
/// Four flows ship with the engine. They differ only in which agents they
/// include and how those agents are chained. Queue rules:
/// - `smart-agents`: crawl/analysis agents that are CPU or network bound
/// - `auto-tasks`: best-effort background collectors that may lag

use crate::config::{AUTO_TASKS_QUEUE, ORCHESTRATOR_QUEUE, SMART_AGENTS_QUEUE};
use crate::workflow::registry::{TemplateRegistry, WorkflowTemplate};
use crate::workflow::types::{
    AgentTask, Backoff, CompetitorParams, DomainParams, FlowInput, JobDescriptor, JobOptions,
    KeywordParams, LocalParams,
};

pub const CONTENT_PIPELINE: &str = "seo-content-pipeline";
pub const MONITORING_SWEEP: &str = "seo-monitoring-sweep";
pub const COMPREHENSIVE_AUDIT: &str = "comprehensive-seo-audit";
pub const LOCAL_SEO: &str = "local-seo-flow";

/// All built-in templates
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        content_pipeline(),
        monitoring_sweep(),
        comprehensive_audit(),
        local_seo(),
    ]
}

/// Register every built-in template into `registry`
pub fn register_builtin_templates(registry: &TemplateRegistry) {
    for template in builtin_templates() {
        registry.register(template);
    }
}

fn keywords(input: &FlowInput) -> KeywordParams {
    KeywordParams {
        keywords: input.keywords.clone(),
        locale: input.locale.clone(),
    }
}

fn domain(input: &FlowInput) -> DomainParams {
    DomainParams {
        domain: input.domain_or_default(),
    }
}

fn competitors(input: &FlowInput) -> CompetitorParams {
    CompetitorParams {
        domain: input.domain_or_default(),
        competitors: input.competitors.clone(),
    }
}

fn local(input: &FlowInput) -> LocalParams {
    LocalParams {
        location: input.location.clone().unwrap_or_default(),
        keywords: input.keywords.clone(),
    }
}

fn job(input: &FlowInput, queue: &str, task: AgentTask) -> JobDescriptor {
    JobDescriptor::new(queue, input.payload(task))
}

/// Research -> brief -> article, with SERP analysis alongside
///
/// Each chained stage consumes its prerequisite's output, so the research
/// job is a child of the brief job, which is a child of the writer job.
pub fn content_pipeline() -> WorkflowTemplate {
    WorkflowTemplate::new(CONTENT_PIPELINE, ORCHESTRATOR_QUEUE, |input| {
        let chained = JobOptions::default()
            .with_attempts(3)
            .with_backoff(Backoff::Exponential { delay_ms: 2000 });

        let research = job(input, SMART_AGENTS_QUEUE, AgentTask::KeywordResearch(keywords(input)))
            .with_options(chained.clone());
        let brief = job(input, SMART_AGENTS_QUEUE, AgentTask::ContentBrief(keywords(input)))
            .with_options(chained.clone())
            .with_prerequisite(research);
        let writer = job(input, SMART_AGENTS_QUEUE, AgentTask::ContentWriter(keywords(input)))
            .with_options(chained)
            .with_prerequisite(brief);

        vec![
            writer,
            job(input, SMART_AGENTS_QUEUE, AgentTask::SerpAnalysis(keywords(input))),
        ]
    })
    .with_description("Keyword research, content brief and article generation")
}

/// Recurring rank/SERP checks; domain checks only when a domain is given
pub fn monitoring_sweep() -> WorkflowTemplate {
    WorkflowTemplate::new(MONITORING_SWEEP, ORCHESTRATOR_QUEUE, |input| {
        // sweeps run on a schedule, so successful records are not kept
        let options = JobOptions::default().with_retention(true, false);

        let mut jobs = vec![
            job(input, SMART_AGENTS_QUEUE, AgentTask::RankTracker(keywords(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::SerpMonitor(keywords(input))),
        ];
        if input.domain.is_some() {
            jobs.push(job(input, AUTO_TASKS_QUEUE, AgentTask::BacklinkMonitor(domain(input))));
            jobs.push(job(input, AUTO_TASKS_QUEUE, AgentTask::SiteSpeed(domain(input))));
        }
        jobs.into_iter().map(|j| j.with_options(options.clone())).collect()
    })
    .with_description("Rank, SERP, backlink and speed monitoring")
}

/// Full-site audit: eleven independent agents
pub fn comprehensive_audit() -> WorkflowTemplate {
    WorkflowTemplate::new(COMPREHENSIVE_AUDIT, ORCHESTRATOR_QUEUE, |input| {
        vec![
            job(input, SMART_AGENTS_QUEUE, AgentTask::TechnicalAudit(domain(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::OnPageAudit(domain(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::ContentAudit(domain(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::SchemaValidation(domain(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::SiteSpeed(domain(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::MobileUsability(domain(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::CompetitorAnalysis(competitors(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::KeywordGap(competitors(input))),
            job(input, AUTO_TASKS_QUEUE, AgentTask::BacklinkAudit(domain(input))),
            job(input, AUTO_TASKS_QUEUE, AgentTask::SerpFeatures(keywords(input))),
            job(input, AUTO_TASKS_QUEUE, AgentTask::RankTracker(keywords(input))),
        ]
    })
    .with_description("Technical, on-page, content, backlink and competitor audit")
}

/// Business profile, citations, reviews and local pack rankings
pub fn local_seo() -> WorkflowTemplate {
    WorkflowTemplate::new(LOCAL_SEO, ORCHESTRATOR_QUEUE, |input| {
        vec![
            job(input, SMART_AGENTS_QUEUE, AgentTask::GbpAudit(local(input))),
            job(input, SMART_AGENTS_QUEUE, AgentTask::LocalRankTracker(local(input))),
            job(input, AUTO_TASKS_QUEUE, AgentTask::CitationAudit(local(input))),
            job(input, AUTO_TASKS_QUEUE, AgentTask::ReviewMonitor(local(input))),
        ]
    })
    .with_description("Local SEO: business profile, citations, reviews, local rankings")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> FlowInput {
        FlowInput::new("tenant-a", "proj-1")
            .with_domain("example.com")
            .with_keywords(["rust seo", "async rust"])
            .with_competitors(["rival.com"])
            .with_location("Austin, TX")
    }

    #[test]
    fn test_four_builtins_registered() {
        let registry = TemplateRegistry::new();
        register_builtin_templates(&registry);
        assert_eq!(registry.len(), 4);
        for name in [CONTENT_PIPELINE, MONITORING_SWEEP, COMPREHENSIVE_AUDIT, LOCAL_SEO] {
            assert!(registry.get(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn test_audit_has_eleven_independent_children() {
        let children = comprehensive_audit().generate(&input());
        assert_eq!(children.len(), 11);
        assert!(children.iter().all(|c| c.children.is_empty()));
        assert!(children.iter().any(|c| c.queue_name == AUTO_TASKS_QUEUE));
        assert!(children.iter().any(|c| c.queue_name == SMART_AGENTS_QUEUE));
    }

    #[test]
    fn test_content_pipeline_chains_prerequisites() {
        let children = content_pipeline().generate(&input());
        assert_eq!(children.len(), 2);
        let writer = &children[0];
        assert_eq!(writer.name, "content-writer");
        assert_eq!(writer.children[0].name, "content-brief");
        assert_eq!(writer.children[0].children[0].name, "keyword-research");
        assert_eq!(writer.total_jobs(), 3);
    }

    #[test]
    fn test_monitoring_skips_domain_jobs_without_domain() {
        let with_domain = monitoring_sweep().generate(&input());
        let without = monitoring_sweep().generate(&FlowInput::new("t", "p"));
        assert_eq!(with_domain.len(), 4);
        assert_eq!(without.len(), 2);
        assert!(with_domain.iter().all(|j| j.options.remove_on_complete));
    }

    #[test]
    fn test_children_carry_tenancy() {
        for template in builtin_templates() {
            for child in template.generate(&input()) {
                child.walk(&mut |job| {
                    assert_eq!(job.payload.tenant_id, "tenant-a");
                    assert_eq!(job.payload.project_id, "proj-1");
                });
            }
        }
    }

    #[test]
    fn test_children_use_builtin_agents() {
        for template in builtin_templates() {
            for child in template.generate(&input()) {
                child.walk(&mut |job| {
                    assert!(
                        AgentTask::BUILTIN_AGENTS.contains(&job.name.as_str()),
                        "{} is not a built-in agent",
                        job.name
                    );
                });
            }
        }
    }
}
