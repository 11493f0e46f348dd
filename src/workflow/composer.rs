/// Flow Composer
///
/// Turns a template name plus typed input into a parent/children job tree
/// and hands it to the backend in one atomic call.

use crate::backend::{FlowHandle, SqliteBackend};
use crate::events::{Event, EventBus};
use crate::workflow::registry::TemplateRegistry;
use crate::workflow::types::{AgentTask, FlowDescriptor, FlowInput, JobDescriptor, SummaryParams};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("unknown workflow template '{0}'")]
    UnknownTemplate(String),

    #[error("flow input for '{template}' has no tenant id")]
    MissingTenant { template: String },

    /// A generator may legitimately return no children for some input, but
    /// a flow of only its root would run a summary over nothing, so such a
    /// submission is refused instead of enqueued.
    #[error("template '{0}' produced no jobs")]
    EmptyFlow(String),

    #[error("failed to submit flow: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Builds and submits flows from registered templates
#[derive(Debug, Clone)]
pub struct FlowComposer {
    templates: Arc<TemplateRegistry>,
    backend: SqliteBackend,
    events: EventBus,
}

impl FlowComposer {
    pub fn new(templates: Arc<TemplateRegistry>, backend: SqliteBackend, events: EventBus) -> Self {
        Self {
            templates,
            backend,
            events,
        }
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Resolve the template and build the flow tree, without enqueueing
    ///
    /// Unknown names fail loudly. Every job in the tree carries the input's
    /// tenant and project ids. Generator output with no children is rejected
    /// with `EmptyFlow`.
    pub fn compose(&self, template_name: &str, input: &FlowInput) -> Result<FlowDescriptor, ComposeError> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| ComposeError::UnknownTemplate(template_name.to_string()))?;

        if input.tenant_id.trim().is_empty() {
            return Err(ComposeError::MissingTenant {
                template: template_name.to_string(),
            });
        }

        let children = template.generate(input);
        if children.is_empty() {
            return Err(ComposeError::EmptyFlow(template_name.to_string()));
        }

        let mut stamped = true;
        for child in &children {
            child.walk(&mut |job: &JobDescriptor| {
                stamped &= job.payload.tenant_id == input.tenant_id
                    && job.payload.project_id == input.project_id;
            });
        }
        if !stamped {
            return Err(ComposeError::MissingTenant {
                template: template_name.to_string(),
            });
        }

        let root = JobDescriptor::named(
            template.name.clone(),
            template.parent_queue.clone(),
            input.payload(AgentTask::FlowSummary(SummaryParams {
                flow: template.name.clone(),
            })),
        );

        Ok(FlowDescriptor {
            template: template.name.clone(),
            root,
            children,
        })
    }

    /// Compose and atomically enqueue a flow
    pub async fn submit(&self, template_name: &str, input: &FlowInput) -> Result<FlowHandle, ComposeError> {
        let flow = self.compose(template_name, input)?;
        let handle = self.backend.add_flow(&flow).await?;

        tracing::info!(
            flow_id = %handle.flow_id,
            tenant_id = %input.tenant_id,
            "📥 Submitted flow '{}' with {} jobs across {:?}",
            flow.template,
            handle.job_ids.len(),
            flow.queues()
        );

        let event = Event::flow_submitted(
            &input.tenant_id,
            &handle.flow_id,
            &flow.template,
            handle.job_ids.len(),
        );
        if let Err(e) = self.events.publish(&event).await {
            tracing::warn!(flow_id = %handle.flow_id, "⚠️ Failed to publish flow.submitted: {}", e);
        }

        Ok(handle)
    }
}
