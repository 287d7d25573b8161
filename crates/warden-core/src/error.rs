use thiserror::Error;

/// A convenience `Result` alias using [`WardenError`].
pub type WardenResult<T> = Result<T, WardenError>;

/// Top-level error type for the Warden engine.
///
/// Variants follow the failure taxonomy of the orchestration core: template
/// and input problems are rejected up front, provider problems are transient,
/// and infrastructure problems abort the run that hit them.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Malformed template, context, or result document.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No agent is registered under the requested name or alias.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// An agent name or alias is already taken.
    #[error("Agent already registered: {0}")]
    AgentCollision(String),

    /// The agent's declared input requirements are not met by the context.
    #[error("Context requirement not met for agent '{agent}': {reason}")]
    ContextRequirement {
        /// Agent whose requirements were checked.
        agent: String,
        /// Which requirement failed.
        reason: String,
    },

    /// The generation provider could not be reached.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A call exceeded its execution timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The generation provider rejected the call due to rate limiting.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The agent's circuit breaker is open; the call was not attempted.
    #[error("Circuit open for agent '{agent}' (retry after {retry_after_secs}s)")]
    CircuitOpen {
        /// Agent whose breaker is open.
        agent: String,
        /// Seconds until the breaker may move to half-open.
        retry_after_secs: u64,
    },

    /// The step graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DagCycle {
        /// Step ids along the cycle, first id repeated at the end.
        path: Vec<String>,
    },

    /// The persistence layer failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A run was asked to make an illegal state transition.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A template, run, or artifact does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The surrounding run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An error from the orchestrator itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WardenError::Timeout(_)
                | WardenError::RateLimited(_)
                | WardenError::ProviderUnavailable(_)
        )
    }

    /// Short machine-readable name of the variant, used in step history.
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::Validation(_) => "validation",
            WardenError::AgentNotFound(_) => "agent_not_found",
            WardenError::AgentCollision(_) => "agent_collision",
            WardenError::ContextRequirement { .. } => "context_requirement",
            WardenError::ProviderUnavailable(_) => "provider_unavailable",
            WardenError::Timeout(_) => "timeout",
            WardenError::RateLimited(_) => "rate_limited",
            WardenError::CircuitOpen { .. } => "circuit_open",
            WardenError::DagCycle { .. } => "dag_cycle",
            WardenError::Persistence(_) => "persistence",
            WardenError::InvalidTransition { .. } => "invalid_transition",
            WardenError::NotFound(_) => "not_found",
            WardenError::Cancelled(_) => "cancelled",
            WardenError::Orchestrator(_) => "orchestrator",
            WardenError::Config(_) => "config",
            WardenError::Json(_) => "json",
            WardenError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_includes_path() {
        let err = WardenError::DagCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_transient_classification() {
        assert!(WardenError::Timeout("60s".into()).is_transient());
        assert!(WardenError::RateLimited("429".into()).is_transient());
        assert!(WardenError::ProviderUnavailable("503".into()).is_transient());
        assert!(!WardenError::Validation("bad".into()).is_transient());
        assert!(!WardenError::CircuitOpen {
            agent: "x".into(),
            retry_after_secs: 10
        }
        .is_transient());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(WardenError::Persistence("disk".into()).kind(), "persistence");
        let err = WardenError::ContextRequirement {
            agent: "stride".into(),
            reason: "no document".into(),
        };
        assert_eq!(err.kind(), "context_requirement");
    }
}
