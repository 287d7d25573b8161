use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use warden_core::{
    parse_findings, ExecutionContext, Finding, GenerationBackend, GenerationRequest, WardenResult,
};

/// Source-agent name stamped on findings from the single-path analyzer.
pub const LEGACY_AGENT: &str = "legacy";

/// The prior single-path implementation, kept for shadow and fallback runs.
#[async_trait]
pub trait LegacyAnalyzer: Send + Sync {
    /// Source-agent name for produced findings.
    fn name(&self) -> &str {
        LEGACY_AGENT
    }

    /// Analyzer version.
    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Produce findings for `ctx` in one pass.
    async fn analyze(&self, ctx: &ExecutionContext) -> WardenResult<Vec<Finding>>;
}

const MONOLITHIC_PROMPT: &str = "\
You are a security analyst. In one pass, produce a threat model, a \
vulnerability assessment and a compliance gap analysis for the system below.

Respond with a single JSON object {\"findings\": [...]} where each finding has \
\"id\", \"title\", \"description\", \"category\" (threat | vulnerability | compliance), \
\"classification\", \"component\", \"impact\", \"likelihood\", \"mitigation\" and \
\"confidence\".
";

/// Legacy analyzer issuing one monolithic prompt covering every category.
pub struct SinglePromptAnalyzer {
    backend: Arc<dyn GenerationBackend>,
    max_tokens: u32,
    temperature: f32,
}

impl SinglePromptAnalyzer {
    /// Analyzer with default token and temperature limits.
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            max_tokens: 8192,
            temperature: 0.2,
        }
    }

    /// Override generation limits.
    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn build_prompt(ctx: &ExecutionContext) -> String {
        let mut prompt = String::from(MONOLITHIC_PROMPT);
        if let Some(text) = &ctx.input_text {
            prompt.push_str("\n## System description\n");
            prompt.push_str(text);
            prompt.push('\n');
        }
        if let Some(structured) = ctx.structured_input.as_ref().filter(|v| !v.is_null()) {
            prompt.push_str("\n## Structured input\n");
            prompt.push_str(&structured.to_string());
            prompt.push('\n');
        }
        prompt
    }
}

#[async_trait]
impl LegacyAnalyzer for SinglePromptAnalyzer {
    async fn analyze(&self, ctx: &ExecutionContext) -> WardenResult<Vec<Finding>> {
        let request = GenerationRequest::new(Self::build_prompt(ctx))
            .with_limits(self.max_tokens, self.temperature);
        let generation = self.backend.generate(request).await?;
        let findings = parse_findings(&generation.content, LEGACY_AGENT)?;
        debug!(findings = findings.len(), tokens = generation.tokens_used, "Legacy analysis parsed");
        Ok(findings)
    }
}
