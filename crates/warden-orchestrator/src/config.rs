use crate::comparison::ComparisonThresholds;
use crate::mode::ExecutionMode;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use warden_agents::{AgentRegistry, AgentSettings, HealthConfig};
use warden_core::{WardenError, WardenResult};
use warden_security::Strictness;

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Mode used by `Orchestrator::analyze`.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Agents to run in direct mode; empty means every agent enabled by default.
    #[serde(default)]
    pub enabled_agents: Vec<String>,
    /// Run agents one at a time in priority order.
    #[serde(default)]
    pub sequential: bool,
    /// Minimum severity similarity before a comparison alerts.
    #[serde(default = "default_alert_threshold")]
    pub comparison_alert_threshold: f64,
    /// Largest finding-count delta before a comparison alerts.
    #[serde(default = "default_max_count_delta")]
    pub comparison_max_count_delta: u64,
    /// Comparison records kept in memory.
    #[serde(default = "default_comparison_history")]
    pub comparison_history: usize,
}

fn default_alert_threshold() -> f64 {
    0.8
}

fn default_max_count_delta() -> u64 {
    5
}

fn default_comparison_history() -> usize {
    100
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            enabled_agents: Vec::new(),
            sequential: false,
            comparison_alert_threshold: default_alert_threshold(),
            comparison_max_count_delta: default_max_count_delta(),
            comparison_history: default_comparison_history(),
        }
    }
}

impl OrchestratorConfig {
    /// Alert thresholds for comparison records.
    pub fn comparison_thresholds(&self) -> ComparisonThresholds {
        ComparisonThresholds {
            min_similarity: self.comparison_alert_threshold,
            max_count_delta: self.comparison_max_count_delta,
        }
    }
}

/// `[workflow]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Steps executed concurrently per batch.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// Wall-clock budget of a run, in seconds.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Used by steps that carry no retry override.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_run_timeout_secs() -> u64 {
    4 * 60 * 60
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            run_timeout_secs: default_run_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkflowConfig {
    /// Run budget as a `Duration`.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// `[validator]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Validation level.
    #[serde(default)]
    pub strictness: Strictness,
}

/// One `[[agents]]` entry: settings applied to a registered agent on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOverride {
    /// Agent the settings apply to.
    pub name: String,
    /// Settings applied on load.
    #[serde(flatten)]
    pub settings: AgentSettings,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Orchestration settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Circuit breaker settings.
    #[serde(default)]
    pub health: HealthConfig,
    /// Workflow engine settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Validator settings.
    #[serde(default)]
    pub validator: ValidatorConfig,
    /// Per-agent overrides.
    #[serde(default)]
    pub agents: Vec<AgentOverride>,
}

impl WardenConfig {
    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> WardenResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), mode = %config.orchestrator.mode, "Configuration loaded");
        Ok(config)
    }

    /// Parse TOML text.
    pub fn from_toml_str(raw: &str) -> WardenResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| WardenError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> WardenResult<()> {
        let threshold = self.orchestrator.comparison_alert_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(WardenError::Config(format!(
                "comparison_alert_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.workflow.max_parallel_steps == 0 {
            return Err(WardenError::Config("max_parallel_steps must be at least 1".into()));
        }
        if self.workflow.retry.max_attempts == 0 {
            return Err(WardenError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.health.failure_threshold == 0 {
            return Err(WardenError::Config("failure_threshold must be at least 1".into()));
        }
        Ok(())
    }

    /// Reload every `[[agents]]` override into the registry. Unknown agents
    /// are skipped with a warning; returns how many were applied.
    pub fn apply_agent_overrides(&self, registry: &AgentRegistry) -> usize {
        let mut applied = 0;
        for entry in &self.agents {
            match registry.reload(&entry.name, entry.settings.clone()) {
                Ok(()) => applied += 1,
                Err(e) => warn!(agent = %entry.name, error = %e, "Skipping agent override"),
            }
        }
        applied
    }
}
