use crate::finding::Finding;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Shared input for one run. Each step receives its own clone, so agents
/// never observe each other's mutations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Run this context belongs to.
    pub run_id: Uuid,
    /// Document text under analysis.
    #[serde(default)]
    pub input_text: Option<String>,
    /// Structured description of the system (architecture, data flows, ...).
    #[serde(default)]
    pub structured_input: Option<serde_json::Value>,
    /// Findings produced earlier in the run, visible to downstream agents.
    #[serde(default)]
    pub prior_findings: Vec<Finding>,
    /// Per-run configuration.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    /// Create an empty context for a run.
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            ..Default::default()
        }
    }

    /// Set the document text.
    pub fn with_input_text(mut self, text: impl Into<String>) -> Self {
        self.input_text = Some(text.into());
        self
    }

    /// Set the structured input.
    pub fn with_structured_input(mut self, value: serde_json::Value) -> Self {
        self.structured_input = Some(value);
        self
    }

    /// Replace the prior findings.
    pub fn with_prior_findings(mut self, findings: Vec<Finding>) -> Self {
        self.prior_findings = findings;
        self
    }

    /// Add one per-run option.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Whether non-blank document text is present.
    pub fn has_document(&self) -> bool {
        self.input_text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Whether non-null structured input is present.
    pub fn has_structured_input(&self) -> bool {
        self.structured_input.as_ref().is_some_and(|v| !v.is_null())
    }

    /// Merge a JSON object into the per-run configuration; non-objects are ignored.
    pub fn merge_config(&mut self, overrides: &serde_json::Value) {
        if let Some(map) = overrides.as_object() {
            for (k, v) in map {
                self.config.insert(k.clone(), v.clone());
            }
        }
    }
}
