//! Orchestration and workflow execution for the Warden engine.
//!
//! Runs analysis requests across the registered agents in one of several
//! execution modes, and drives multi-step workflows over a dependency graph
//! with retries, cancellation and versioned artifacts.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Runs agents in direct, legacy, shadow, comparison or fallback mode.
//! - [`AnalysisResult`] — Fixed-shape result document shared by every mode.
//! - [`WorkflowEngine`] — Schedules ready steps, retries failures and stores artifacts.
//! - [`WorkflowTemplate`] — Validated, cycle-free step graph.
//! - [`WorkflowStore`] — Persistence for templates, runs, history and artifacts.
//! - [`WardenConfig`] — TOML configuration for every component.

/// Versioned step outputs.
pub mod artifact;
/// Legacy/direct result comparison.
pub mod comparison;
/// TOML configuration.
pub mod config;
/// The orchestrator and its execution modes.
pub mod engine;
/// The prior single-path analyzer.
pub mod legacy;
/// Execution mode selection.
pub mod mode;
/// Aggregated analysis results.
pub mod result;
/// Step retry policy.
pub mod retry;
/// Workflow runs and step history.
pub mod run;
/// Workflow persistence.
pub mod store;
/// Workflow templates and graph validation.
pub mod template;
/// DAG workflow engine.
pub mod workflow;

pub use artifact::{content_digest, Artifact, NewArtifact, FINDINGS_KIND};
pub use comparison::{histogram_similarity, ComparisonHistory, ComparisonRecord, ComparisonThresholds};
pub use config::{AgentOverride, OrchestratorConfig, ValidatorConfig, WardenConfig, WorkflowConfig};
pub use engine::{ModeOutput, Orchestrator, OrchestratorStats};
pub use legacy::{LegacyAnalyzer, SinglePromptAnalyzer, LEGACY_AGENT};
pub use mode::ExecutionMode;
pub use result::{
    AgentProvenance, AgentRunStatus, AnalysisResult, FallbackInfo, ResultSummary, SeverityHistogram,
    RESULT_SCHEMA_VERSION,
};
pub use retry::RetryPolicy;
pub use run::{RunStatus, StepExecution, StepState, StepStatus, WorkflowRun};
pub use store::{InMemoryWorkflowStore, JsonFileWorkflowStore, WorkflowStore};
pub use template::{find_cycle, topological_order, StepSpec, TemplateSpec, WorkflowTemplate};
pub use workflow::{StepExecutor, StepOutput, StepResult, WorkflowEngine};
