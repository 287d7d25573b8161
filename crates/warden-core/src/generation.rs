use crate::error::WardenResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// User prompt.
    pub prompt: String,
    /// System prompt, if any.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Token limit for the reply.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl GenerationRequest {
    /// Create a request with default limits.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set token limit and temperature.
    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

/// Text produced by a generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    /// Reply text.
    pub content: String,
    /// Tokens billed for the call.
    pub tokens_used: u64,
}

/// Capability to call a language-generation provider.
///
/// Implementations wrap a concrete provider API. They report failures as
/// [`WardenError::ProviderUnavailable`](crate::WardenError::ProviderUnavailable),
/// [`WardenError::Timeout`](crate::WardenError::Timeout) or
/// [`WardenError::RateLimited`](crate::WardenError::RateLimited) so callers can
/// tell transient failures apart.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Send one request to the provider.
    async fn generate(&self, request: GenerationRequest) -> WardenResult<Generation>;
}
