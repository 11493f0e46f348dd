/// Workflow Layer
///
/// Authoring-time and composition concerns:
/// - Type definitions (flow input, job payloads, job/flow descriptors)
/// - DAG validation of declarative workflow graphs with petgraph
/// - Lock-free template registry using ArcSwap
/// - Built-in SEO workflow templates
/// - Flow Composer that turns a template into an enqueued job tree

// Core workflow type definitions
pub mod types;

// Authoring-time graph validation (duplicates, missing deps, cycles)
pub mod dag;

// Template registry using ArcSwap for lock-free lookups
pub mod registry;

// Built-in workflow templates
pub mod templates;

// Template -> job tree composition and atomic submission
pub mod composer;

// Re-export commonly used types
pub use composer::{ComposeError, FlowComposer};
pub use dag::{DagError, DagNode, ParsedDag};
pub use registry::{TemplateRegistry, WorkflowTemplate};
pub use types::{AgentTask, Backoff, FlowDescriptor, FlowInput, JobDescriptor, JobOptions, JobPayload};
