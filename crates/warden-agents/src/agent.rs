use crate::descriptor::AgentDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use warden_core::{ExecutionContext, Finding, WardenResult};

/// Runtime configuration for one agent. Swapped as a whole on reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Overrides the agent's built-in system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Overrides the generation token limit.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Overrides the sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Agent-specific options.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AgentSettings {
    /// Set the system prompt override.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the token limit override.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the temperature override.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Add an agent-specific option.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A unit of analysis that turns an execution context into findings.
///
/// Agents are shared across runs and called concurrently; any per-agent state
/// (such as a response cache) must be internally synchronized.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Static metadata: name, priority, requirements.
    fn descriptor(&self) -> &AgentDescriptor;

    /// Settings restored by recovery and used when nothing was reloaded.
    fn default_settings(&self) -> AgentSettings {
        AgentSettings::default()
    }

    /// Analyze the context and return findings.
    async fn analyze(
        &self,
        ctx: &ExecutionContext,
        settings: &AgentSettings,
    ) -> WardenResult<Vec<Finding>>;

    /// Drop any agent-local cached state.
    async fn clear_cache(&self) -> WardenResult<()> {
        Ok(())
    }

    /// Cheap liveness check used by recovery and the background sweep.
    async fn probe(&self) -> WardenResult<()> {
        Ok(())
    }
}
