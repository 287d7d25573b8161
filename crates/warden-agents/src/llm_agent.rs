use crate::agent::{Agent, AgentSettings};
use crate::descriptor::AgentDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;
use warden_core::{
    parse_findings, ExecutionContext, Finding, GenerationBackend, GenerationRequest, WardenResult,
};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TEMPERATURE: f32 = 0.2;
const PROBE_PROMPT: &str = "Reply with the single word OK.";

/// Prior findings included in a prompt, at most.
const MAX_PRIOR_FINDINGS: usize = 50;

/// Cached replies kept per agent before the oldest is evicted.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

const OUTPUT_INSTRUCTIONS: &str = "\
Respond with a single JSON object of the form {\"findings\": [...]}. Each finding has: \
\"id\", \"title\", \"description\", \"category\" (threat | vulnerability | compliance), \
\"classification\", \"component\", \"impact\" and \"likelihood\" (low | medium | high | critical), \
\"mitigation\", and \"confidence\" (0.0 to 1.0). Return an empty list when nothing applies.";

/// An agent that builds a prompt from the context and parses findings from
/// a generation backend's reply.
///
/// Replies are cached by prompt fingerprint, oldest evicted first, until
/// [`Agent::clear_cache`].
pub struct LlmAgent {
    descriptor: AgentDescriptor,
    system_prompt: String,
    backend: Arc<dyn GenerationBackend>,
    defaults: AgentSettings,
    cache: Mutex<PromptCache>,
}

/// Fingerprint-keyed replies with insertion-order eviction.
struct PromptCache {
    capacity: usize,
    entries: HashMap<String, Vec<Finding>>,
    order: VecDeque<String>,
}

impl PromptCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<Finding>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, findings: Vec<Finding>) {
        if self.entries.insert(key.clone(), findings).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl LlmAgent {
    /// Create an agent with default settings and an empty cache.
    pub fn new(
        descriptor: AgentDescriptor,
        system_prompt: impl Into<String>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        Self {
            descriptor,
            system_prompt: system_prompt.into(),
            backend,
            defaults: AgentSettings::default(),
            cache: Mutex::new(PromptCache::new(DEFAULT_CACHE_CAPACITY)),
        }
    }

    /// Settings this agent starts with and returns to on recovery.
    pub fn with_default_settings(mut self, settings: AgentSettings) -> Self {
        self.defaults = settings;
        self
    }

    /// Keep at most `capacity` cached replies (minimum one).
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Mutex::new(PromptCache::new(capacity));
        self
    }

    /// Number of replies currently cached.
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    fn build_prompt(&self, ctx: &ExecutionContext) -> String {
        let mut prompt = String::new();
        if let Some(text) = ctx.input_text.as_deref().filter(|t| !t.trim().is_empty()) {
            let _ = write!(prompt, "## Document\n{text}\n\n");
        }
        if let Some(structured) = ctx.structured_input.as_ref().filter(|v| !v.is_null()) {
            let rendered =
                serde_json::to_string_pretty(structured).unwrap_or_else(|_| structured.to_string());
            let _ = write!(prompt, "## Structured input\n{rendered}\n\n");
        }
        if !ctx.prior_findings.is_empty() {
            prompt.push_str("## Findings from earlier steps\n");
            for f in ctx.prior_findings.iter().take(MAX_PRIOR_FINDINGS) {
                let _ = writeln!(prompt, "- [{}/{}] {}", f.category, f.impact, f.title);
            }
            prompt.push('\n');
        }
        if !ctx.config.is_empty() {
            let mut keys: Vec<_> = ctx.config.keys().collect();
            keys.sort();
            prompt.push_str("## Run options\n");
            for key in keys {
                let _ = writeln!(prompt, "- {key}: {}", ctx.config[key]);
            }
            prompt.push('\n');
        }
        prompt.push_str(OUTPUT_INSTRUCTIONS);
        prompt
    }
}

fn fingerprint(system_prompt: &str, prompt: &str, max_tokens: u32, temperature: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system_prompt.as_bytes());
    hasher.update([0]);
    hasher.update(prompt.as_bytes());
    hasher.update(max_tokens.to_le_bytes());
    hasher.update(temperature.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl Agent for LlmAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn default_settings(&self) -> AgentSettings {
        self.defaults.clone()
    }

    async fn analyze(
        &self,
        ctx: &ExecutionContext,
        settings: &AgentSettings,
    ) -> WardenResult<Vec<Finding>> {
        let system_prompt = settings
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.system_prompt.clone());
        let max_tokens = settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let temperature = settings.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let prompt = self.build_prompt(ctx);

        let key = fingerprint(&system_prompt, &prompt, max_tokens, temperature);
        let cached = self.cache.lock().get(&key);
        if let Some(hit) = cached {
            debug!(agent = %self.descriptor.name, "Prompt cache hit");
            return Ok(hit);
        }

        let request = GenerationRequest::new(prompt)
            .with_system_prompt(system_prompt)
            .with_limits(max_tokens, temperature);
        let generation = self.backend.generate(request).await?;
        let findings = parse_findings(&generation.content, &self.descriptor.name)?;
        debug!(
            agent = %self.descriptor.name,
            findings = findings.len(),
            tokens = generation.tokens_used,
            "Generation parsed"
        );

        self.cache.lock().insert(key, findings.clone());
        Ok(findings)
    }

    async fn clear_cache(&self) -> WardenResult<()> {
        self.cache.lock().clear();
        Ok(())
    }

    async fn probe(&self) -> WardenResult<()> {
        self.backend
            .generate(GenerationRequest::new(PROBE_PROMPT).with_limits(8, 0.0))
            .await
            .map(|_| ())
    }
}
