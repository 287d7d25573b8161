use serde::{Deserialize, Serialize};
use warden_core::{ExecutionContext, WardenError, WardenResult};

/// Lowest (earliest-running) priority an agent may declare.
pub const MIN_PRIORITY: u16 = 1;
/// Highest (latest-running) priority an agent may declare.
pub const MAX_PRIORITY: u16 = 1000;

/// Broad area an agent analyzes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCategory {
    /// Threat modeling (STRIDE and similar).
    Threat,
    /// Vulnerability scanning.
    Vulnerability,
    /// Regulatory and standards compliance.
    Compliance,
    /// Architecture and design review.
    Architecture,
}

impl std::fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentCategory::Threat => "threat",
            AgentCategory::Vulnerability => "vulnerability",
            AgentCategory::Compliance => "compliance",
            AgentCategory::Architecture => "architecture",
        };
        f.write_str(s)
    }
}

/// Inputs an agent needs before it can run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequirements {
    /// The context must carry non-empty input text.
    #[serde(default)]
    pub needs_document: bool,
    /// The context must carry structured input.
    #[serde(default)]
    pub needs_structured_input: bool,
}

impl AgentRequirements {
    /// Fails with [`WardenError::ContextRequirement`] when the context lacks a required input.
    pub fn check(&self, agent: &str, ctx: &ExecutionContext) -> WardenResult<()> {
        if self.needs_document && !ctx.has_document() {
            return Err(WardenError::ContextRequirement {
                agent: agent.to_string(),
                reason: "no document text in context".into(),
            });
        }
        if self.needs_structured_input && !ctx.has_structured_input() {
            return Err(WardenError::ContextRequirement {
                agent: agent.to_string(),
                reason: "no structured input in context".into(),
            });
        }
        Ok(())
    }

    /// Whether the context satisfies every requirement.
    pub fn is_met(&self, ctx: &ExecutionContext) -> bool {
        self.check("", ctx).is_ok()
    }
}

/// Static metadata describing a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique registry name.
    pub name: String,
    /// Agent version, reported in provenance.
    pub version: String,
    /// One-line description.
    pub description: String,
    /// Kind of analysis the agent performs.
    pub category: AgentCategory,
    /// 1..=1000, lower runs earlier.
    pub priority: u16,
    /// What the context must contain for the agent to run.
    #[serde(default)]
    pub requirements: AgentRequirements,
    /// Included when the orchestrator config names no agents.
    pub enabled_by_default: bool,
    /// Name the prior single-path implementation used for this analysis.
    #[serde(default)]
    pub legacy_alias: Option<String>,
}

impl AgentDescriptor {
    /// Create a descriptor with version 1.0.0 and priority 100.
    pub fn new(name: impl Into<String>, category: AgentCategory) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            description: String::new(),
            category,
            priority: 100,
            requirements: AgentRequirements::default(),
            enabled_by_default: true,
            legacy_alias: None,
        }
    }

    /// Set the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority (1..=1000, lower runs earlier).
    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    /// Require input text.
    pub fn needs_document(mut self) -> Self {
        self.requirements.needs_document = true;
        self
    }

    /// Require structured input.
    pub fn needs_structured_input(mut self) -> Self {
        self.requirements.needs_structured_input = true;
        self
    }

    /// Exclude the agent from the default selection.
    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    /// Also resolve the agent under an older name.
    pub fn with_legacy_alias(mut self, alias: impl Into<String>) -> Self {
        self.legacy_alias = Some(alias.into());
        self
    }

    /// Checked at registration.
    pub fn validate(&self) -> WardenResult<()> {
        if self.name.trim().is_empty() {
            return Err(WardenError::Validation("agent name must not be empty".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(WardenError::Validation(format!(
                "agent '{}' priority {} outside {MIN_PRIORITY}..={MAX_PRIORITY}",
                self.name, self.priority
            )));
        }
        if let Some(alias) = &self.legacy_alias {
            if alias.trim().is_empty() || alias == &self.name {
                return Err(WardenError::Validation(format!(
                    "agent '{}' has an invalid legacy alias",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
