/// Lock-free workflow template registry using ArcSwap
///
/// Templates are registered once at process start and looked up by name on
/// every compose call. Registration swaps the whole map pointer, so readers
/// never block and never observe a half-updated registry.

use crate::workflow::types::{FlowInput, JobDescriptor};
use arc_swap::ArcSwap;
use std::{collections::HashMap, fmt, sync::Arc};

/// Generator from typed flow input to the flow's child jobs
pub type TemplateGenerator = dyn Fn(&FlowInput) -> Vec<JobDescriptor> + Send + Sync;

/// Named definition that turns a flow input into a job tree
///
/// Immutable once built. The root job is named after the template and runs
/// on `parent_queue`; the generator decides children and their queues.
#[derive(Clone)]
pub struct WorkflowTemplate {
    pub name: String,
    pub parent_queue: String,
    pub description: String,
    generator: Arc<TemplateGenerator>,
}

impl WorkflowTemplate {
    pub fn new<F>(name: impl Into<String>, parent_queue: impl Into<String>, generator: F) -> Self
    where
        F: Fn(&FlowInput) -> Vec<JobDescriptor> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            parent_queue: parent_queue.into(),
            description: String::new(),
            generator: Arc::new(generator),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Run the generator for one input
    pub fn generate(&self, input: &FlowInput) -> Vec<JobDescriptor> {
        (self.generator)(input)
    }
}

impl fmt::Debug for WorkflowTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowTemplate")
            .field("name", &self.name)
            .field("parent_queue", &self.parent_queue)
            .finish_non_exhaustive()
    }
}

/// Lock-free template registry
///
/// Constructed once and injected into the Flow Composer; there is no
/// process-wide instance.
#[derive(Debug)]
pub struct TemplateRegistry {
    /// Key: template name, Value: template definition
    templates: ArcSwap<HashMap<String, Arc<WorkflowTemplate>>>,
}

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            templates: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Register a template, replacing any previous template with the same name
    pub fn register(&self, template: WorkflowTemplate) {
        let name = template.name.clone();
        self.templates.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(name.clone(), Arc::new(template.clone()));
            next
        });
        tracing::info!("📋 Registered workflow template: {}", name);
    }

    /// Get a template by name (lock-free read)
    pub fn get(&self, name: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates.load().get(name).cloned()
    }

    /// List registered template names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.load().is_empty()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
