use serde::{Deserialize, Serialize};
use warden_core::WardenError;

/// Strategy for running an analysis request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run the current agent set.
    #[default]
    Direct,
    /// Run only the prior single-path analyzer.
    Legacy,
    /// Run both, return the legacy result, record a comparison.
    Shadow,
    /// Run both and return the comparison record.
    Comparison,
    /// Run direct; on failure re-run legacy and mark the result as fallback.
    DirectWithFallback,
}

impl ExecutionMode {
    /// Every mode, in declaration order.
    pub const ALL: [ExecutionMode; 5] = [
        ExecutionMode::Direct,
        ExecutionMode::Legacy,
        ExecutionMode::Shadow,
        ExecutionMode::Comparison,
        ExecutionMode::DirectWithFallback,
    ];

    /// Configuration name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Direct => "direct",
            ExecutionMode::Legacy => "legacy",
            ExecutionMode::Shadow => "shadow",
            ExecutionMode::Comparison => "comparison",
            ExecutionMode::DirectWithFallback => "direct_with_fallback",
        }
    }

    /// Whether the mode runs the legacy analyzer at all.
    pub fn uses_legacy(self) -> bool {
        !matches!(self, ExecutionMode::Direct)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| WardenError::Config(format!("Unknown execution mode '{s}'")))
    }
}
