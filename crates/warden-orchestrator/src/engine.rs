use crate::comparison::{ComparisonHistory, ComparisonRecord};
use crate::config::OrchestratorConfig;
use crate::legacy::LegacyAnalyzer;
use crate::mode::ExecutionMode;
use crate::result::{AgentProvenance, AgentRunStatus, AnalysisResult};
use crate::workflow::{StepExecutor, StepOutput};
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use warden_agents::{AgentHandle, AgentRegistry, HealthMonitor};
use warden_core::{ExecutionContext, Finding, Outcome, WardenError, WardenResult};
use warden_security::{ValidationReport, Validator};

/// What an orchestration call returns: a result document, or in comparison
/// mode the comparison record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModeOutput {
    /// An aggregated result.
    Result(AnalysisResult),
    /// A legacy versus direct comparison.
    Comparison(ComparisonRecord),
}

impl ModeOutput {
    /// The result, unless this is a comparison.
    pub fn into_result(self) -> Option<AnalysisResult> {
        match self {
            ModeOutput::Result(result) => Some(result),
            ModeOutput::Comparison(_) => None,
        }
    }

    /// The comparison record, if any.
    pub fn into_comparison(self) -> Option<ComparisonRecord> {
        match self {
            ModeOutput::Comparison(record) => Some(record),
            ModeOutput::Result(_) => None,
        }
    }
}

/// Process-wide orchestration counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Analyses started.
    pub total_runs: u64,
    /// Successful runs keyed by mode name.
    pub successes: BTreeMap<String, u64>,
    /// Analyses that returned an error.
    pub failures: u64,
    /// Direct runs replaced by the legacy result.
    pub fallbacks: u64,
}

impl OrchestratorStats {
    /// Fallbacks per run, 0 when nothing ran.
    pub fn fallback_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.fallbacks as f64 / self.total_runs as f64
        }
    }
}

struct AgentRun {
    provenance: AgentProvenance,
    findings: Vec<Finding>,
}

/// Runs analysis requests across the registered agents.
///
/// Owns shared handles to the registry, health monitor and validator, so
/// several orchestrators (or a workflow engine) can share one agent pool.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    monitor: Arc<HealthMonitor>,
    validator: Arc<Validator>,
    legacy: Option<Arc<dyn LegacyAnalyzer>>,
    config: OrchestratorConfig,
    stats: Mutex<OrchestratorStats>,
    comparisons: ComparisonHistory,
}

impl Orchestrator {
    /// Create an orchestrator over shared agent handles.
    pub fn new(
        registry: Arc<AgentRegistry>,
        monitor: Arc<HealthMonitor>,
        validator: Arc<Validator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            monitor,
            validator,
            legacy: None,
            comparisons: ComparisonHistory::new(config.comparison_history),
            config,
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    /// Attach the single-path analyzer used by legacy, shadow, comparison and
    /// fallback modes.
    pub fn with_legacy(mut self, legacy: Arc<dyn LegacyAnalyzer>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    /// Agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Health monitor wrapping every agent call.
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Finding validator.
    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().clone()
    }

    /// Recent comparison records.
    pub fn comparisons(&self) -> &ComparisonHistory {
        &self.comparisons
    }

    /// Analyze using the configured mode.
    pub async fn analyze(&self, ctx: &ExecutionContext) -> WardenResult<ModeOutput> {
        self.analyze_with_mode(ctx, self.config.mode).await
    }

    /// Analyze using an explicit mode.
    pub async fn analyze_with_mode(
        &self,
        ctx: &ExecutionContext,
        mode: ExecutionMode,
    ) -> WardenResult<ModeOutput> {
        let started = Instant::now();
        info!(run = %ctx.run_id, mode = %mode, "Orchestrator: starting analysis");
        self.stats.lock().total_runs += 1;

        let output = self.run_mode(ctx, mode).await;

        let mut stats = self.stats.lock();
        match &output {
            Ok(out) => {
                *stats.successes.entry(mode.as_str().to_string()).or_default() += 1;
                if let ModeOutput::Result(result) = out {
                    if result.is_fallback() {
                        stats.fallbacks += 1;
                    }
                }
                info!(
                    run = %ctx.run_id,
                    mode = %mode,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Orchestrator: analysis complete"
                );
            }
            Err(e) => {
                stats.failures += 1;
                warn!(run = %ctx.run_id, mode = %mode, error = %e, "Orchestrator: analysis failed");
            }
        }
        output
    }

    async fn run_mode(&self, ctx: &ExecutionContext, mode: ExecutionMode) -> WardenResult<ModeOutput> {
        let report = self.validator.validate_input(ctx);
        if !report.is_valid() {
            return Err(WardenError::Validation(report.error_summary()));
        }
        let ctx = self.validator.sanitize_context(ctx);

        match mode {
            ExecutionMode::Direct => Ok(ModeOutput::Result(self.run_direct(&ctx).await?)),
            ExecutionMode::Legacy => Ok(ModeOutput::Result(self.run_legacy(&ctx).await?)),
            ExecutionMode::Shadow => {
                let (legacy, direct) = tokio::join!(self.run_legacy(&ctx), self.run_direct(&ctx));
                let legacy = legacy?;
                match direct {
                    Ok(direct) => {
                        self.record_comparison(&ctx, &legacy, &direct);
                    }
                    Err(e) => {
                        warn!(run = %ctx.run_id, error = %e, "Shadow direct path failed");
                    }
                }
                Ok(ModeOutput::Result(legacy.with_mode(ExecutionMode::Shadow)))
            }
            ExecutionMode::Comparison => {
                let (legacy, direct) = tokio::join!(self.run_legacy(&ctx), self.run_direct(&ctx));
                let record = self.record_comparison(&ctx, &legacy?, &direct?);
                Ok(ModeOutput::Comparison(record))
            }
            ExecutionMode::DirectWithFallback => {
                let reason = match self.run_direct(&ctx).await {
                    Ok(result) => {
                        let report = self.validator.validate_result_document(&result.to_document());
                        if report.is_valid() {
                            return Ok(ModeOutput::Result(
                                result.with_mode(ExecutionMode::DirectWithFallback),
                            ));
                        }
                        format!("output schema validation failed: {}", report.error_summary())
                    }
                    Err(e) => e.to_string(),
                };
                warn!(run = %ctx.run_id, reason = %reason, "Falling back to legacy analyzer");
                let legacy = self.run_legacy(&ctx).await.map_err(|e| {
                    WardenError::Orchestrator(format!(
                        "direct path failed ({reason}) and fallback failed ({e})"
                    ))
                })?;
                Ok(ModeOutput::Result(
                    legacy
                        .with_mode(ExecutionMode::DirectWithFallback)
                        .with_fallback(reason),
                ))
            }
        }
    }

    fn record_comparison(
        &self,
        ctx: &ExecutionContext,
        legacy: &AnalysisResult,
        direct: &AnalysisResult,
    ) -> ComparisonRecord {
        let record =
            ComparisonRecord::compare(ctx.run_id, legacy, direct, self.config.comparison_thresholds());
        if record.alert {
            warn!(
                run = %ctx.run_id,
                similarity = record.severity_similarity,
                count_delta = record.count_delta,
                "Legacy and direct results diverge"
            );
        } else {
            debug!(run = %ctx.run_id, similarity = record.severity_similarity, "Comparison recorded");
        }
        self.comparisons.push(record.clone());
        record
    }

    fn selected_agents(&self) -> Vec<AgentHandle> {
        if self.config.enabled_agents.is_empty() {
            self.registry.default_enabled()
        } else {
            self.registry.list_enabled(&self.config.enabled_agents)
        }
    }

    /// Run the selected agents and aggregate their findings.
    pub async fn run_direct(&self, ctx: &ExecutionContext) -> WardenResult<AnalysisResult> {
        let handles = self.selected_agents();
        if handles.is_empty() {
            return Err(WardenError::Orchestrator("no agents selected".into()));
        }

        let runs: Vec<AgentRun> = if self.config.sequential {
            let mut runs = Vec::with_capacity(handles.len());
            for handle in &handles {
                runs.push(self.run_agent(handle, ctx).await);
            }
            runs
        } else {
            join_all(handles.iter().map(|h| self.run_agent(h, ctx))).await
        };

        let attempted: Vec<&AgentRun> = runs
            .iter()
            .filter(|r| r.provenance.status != AgentRunStatus::Skipped)
            .collect();
        if !attempted.is_empty()
            && attempted
                .iter()
                .all(|r| r.provenance.status == AgentRunStatus::Failed)
        {
            let detail = attempted
                .iter()
                .map(|r| {
                    format!(
                        "{}: {}",
                        r.provenance.agent,
                        r.provenance.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(WardenError::Orchestrator(format!(
                "all {} agents failed: {detail}",
                attempted.len()
            )));
        }

        let mut provenance = Vec::with_capacity(runs.len());
        let mut findings = Vec::new();
        for run in runs {
            provenance.push(run.provenance);
            findings.extend(run.findings);
        }
        Ok(self.aggregate(findings, provenance, ExecutionMode::Direct))
    }

    /// Run only the single-path analyzer.
    pub async fn run_legacy(&self, ctx: &ExecutionContext) -> WardenResult<AnalysisResult> {
        let legacy = self
            .legacy
            .as_ref()
            .ok_or_else(|| WardenError::Orchestrator("no legacy analyzer configured".into()))?;
        let started = Instant::now();
        let findings = legacy.analyze(ctx).await?;
        let provenance = AgentProvenance {
            agent: legacy.name().to_string(),
            version: legacy.version().to_string(),
            status: AgentRunStatus::Succeeded,
            findings: findings.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        };
        Ok(self.aggregate(findings, vec![provenance], ExecutionMode::Legacy))
    }

    fn aggregate(
        &self,
        findings: Vec<Finding>,
        provenance: Vec<AgentProvenance>,
        mode: ExecutionMode,
    ) -> AnalysisResult {
        let validated = self.validator.validate_findings(findings);
        warn_rejected(None, &validated.report);
        let mut result = AnalysisResult::from_findings(validated.findings, provenance, mode);
        result.summary.redactions = validated.report.redactions;
        result.summary.duplicates_removed = validated.report.duplicates_removed;
        result
    }

    async fn run_agent(&self, handle: &AgentHandle, ctx: &ExecutionContext) -> AgentRun {
        let descriptor = handle.descriptor();
        let mut provenance = AgentProvenance {
            agent: descriptor.name.clone(),
            version: descriptor.version.clone(),
            status: AgentRunStatus::Succeeded,
            findings: 0,
            duration_ms: 0,
            error: None,
        };

        if let Err(e) = descriptor.requirements.check(&descriptor.name, ctx) {
            debug!(agent = %descriptor.name, reason = %e, "Agent skipped");
            provenance.status = AgentRunStatus::Skipped;
            provenance.error = Some(e.to_string());
            return AgentRun {
                provenance,
                findings: Vec::new(),
            };
        }

        let started = Instant::now();
        let result = self.monitor.execute(&self.registry, handle, ctx).await;
        provenance.duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(findings) => {
                provenance.findings = findings.len();
                AgentRun {
                    provenance,
                    findings,
                }
            }
            Err(e) => {
                warn!(agent = %descriptor.name, error = %e, "Agent failed");
                provenance.status = if matches!(e, WardenError::ContextRequirement { .. }) {
                    AgentRunStatus::Skipped
                } else {
                    AgentRunStatus::Failed
                };
                provenance.error = Some(e.to_string());
                AgentRun {
                    provenance,
                    findings: Vec::new(),
                }
            }
        }
    }
}

/// Log every validation error; returns how many findings they rejected.
fn warn_rejected(agent: Option<&str>, report: &ValidationReport) -> usize {
    for issue in &report.errors {
        warn!(agent = agent.unwrap_or("-"), subject = %issue.subject, message = %issue.message, "Finding rejected");
    }
    report
        .errors
        .iter()
        .map(|issue| issue.subject.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

#[async_trait]
impl StepExecutor for Orchestrator {
    async fn execute_step(
        &self,
        agent_type: &str,
        ctx: &ExecutionContext,
        config: &serde_json::Value,
    ) -> Outcome<StepOutput> {
        let handle = match self.registry.get(agent_type) {
            Ok(handle) => handle,
            Err(e) => return Outcome::Fatal(e),
        };
        let mut ctx = self.validator.sanitize_context(ctx);
        ctx.merge_config(config);

        let descriptor = handle.descriptor();
        if let Err(e) = descriptor.requirements.check(&descriptor.name, &ctx) {
            return Outcome::Fatal(e);
        }

        match self.monitor.execute(&self.registry, &handle, &ctx).await {
            Ok(findings) => {
                let validated = self.validator.validate_findings(findings);
                let rejected = warn_rejected(Some(&descriptor.name), &validated.report);
                Outcome::Success(StepOutput {
                    agent: descriptor.name.clone(),
                    findings: validated.findings,
                    redactions: validated.report.redactions,
                    duplicates_removed: validated.report.duplicates_removed,
                    rejected,
                })
            }
            Err(e) => Outcome::from_result(Err(e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::legacy::LEGACY_AGENT;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;
    use warden_agents::{Agent, AgentCategory, AgentDescriptor, AgentSettings, HealthConfig};
    use warden_core::{FindingCategory, RiskLevel};
    use warden_security::Strictness;

    struct StaticAgent {
        descriptor: AgentDescriptor,
        findings: Vec<Finding>,
        fail: bool,
        calls: AtomicU32,
    }

    impl StaticAgent {
        fn new(name: &str, priority: u16, findings: Vec<Finding>) -> Self {
            Self {
                descriptor: AgentDescriptor::new(name, AgentCategory::Threat)
                    .with_priority(priority)
                    .needs_document(),
                findings,
                fail: false,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Agent for StaticAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn analyze(
            &self,
            _ctx: &ExecutionContext,
            _settings: &AgentSettings,
        ) -> WardenResult<Vec<Finding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(WardenError::ProviderUnavailable("down".into()))
            } else {
                Ok(self.findings.clone())
            }
        }
    }

    struct StaticLegacy(Vec<Finding>);

    #[async_trait]
    impl LegacyAnalyzer for StaticLegacy {
        async fn analyze(&self, _ctx: &ExecutionContext) -> WardenResult<Vec<Finding>> {
            Ok(self.0.clone())
        }
    }

    fn finding(id: &str, category: FindingCategory, impact: RiskLevel, agent: &str) -> Finding {
        Finding::new(id, format!("Issue {id}"), format!("Description of issue {id} in detail"), category, agent)
            .with_component(format!("component-{id}"))
            .with_risk(impact, RiskLevel::Medium)
            .with_confidence(0.9)
    }

    fn orchestrator(agents: Vec<Arc<dyn Agent>>, config: OrchestratorConfig) -> Orchestrator {
        let registry = Arc::new(AgentRegistry::with_agents(agents).unwrap());
        Orchestrator::new(
            registry,
            Arc::new(HealthMonitor::new(HealthConfig::default())),
            Arc::new(Validator::new(Strictness::Standard)),
            config,
        )
        .with_legacy(Arc::new(StaticLegacy(vec![finding(
            "L1",
            FindingCategory::Threat,
            RiskLevel::High,
            LEGACY_AGENT,
        )])))
    }

    fn doc_ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4()).with_input_text("Payment API behind a gateway")
    }

    #[tokio::test]
    async fn test_direct_aggregates_and_orders() {
        let a = StaticAgent::new("a", 20, vec![finding("V1", FindingCategory::Vulnerability, RiskLevel::Critical, "a")]);
        let b = StaticAgent::new("b", 10, vec![finding("T1", FindingCategory::Threat, RiskLevel::Low, "b")]);
        let orch = orchestrator(vec![Arc::new(a), Arc::new(b)], OrchestratorConfig::default());
        let result = orch.analyze(&doc_ctx()).await.unwrap().into_result().unwrap();
        assert_eq!(result.total_count, 2);
        assert_eq!(result.threats.len(), 1);
        assert_eq!(result.vulnerabilities.len(), 1);
        assert_eq!(result.summary.severity_histogram.critical, 1);
        assert_eq!(result.summary.agents[0].agent, "b");
        assert_eq!(result.summary.mode, ExecutionMode::Direct);
        assert_eq!(orch.stats().successes["direct"], 1);
    }

    #[tokio::test]
    async fn test_direct_tolerates_partial_failure() {
        let ok = StaticAgent::new("ok", 10, vec![finding("T1", FindingCategory::Threat, RiskLevel::High, "ok")]);
        let bad = StaticAgent::new("bad", 20, vec![]).failing();
        let orch = orchestrator(vec![Arc::new(ok), Arc::new(bad)], OrchestratorConfig::default());
        let result = orch.run_direct(&doc_ctx()).await.unwrap();
        assert_eq!(result.total_count, 1);
        assert_eq!(result.summary.agents[1].status, AgentRunStatus::Failed);
        assert!(result.summary.agents[1].error.is_some());
    }

    #[tokio::test]
    async fn test_direct_total_failure_is_error() {
        let bad = StaticAgent::new("bad", 20, vec![]).failing();
        let orch = orchestrator(vec![Arc::new(bad)], OrchestratorConfig::default());
        let err = orch.analyze(&doc_ctx()).await.unwrap_err();
        assert!(err.to_string().contains("all 1 agents failed"));
        assert_eq!(orch.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_unmet_requirements_are_skipped() {
        let a = StaticAgent::new("a", 10, vec![]);
        let orch = orchestrator(vec![Arc::new(a)], OrchestratorConfig::default());
        let ctx = ExecutionContext::new(Uuid::new_v4()).with_structured_input(serde_json::json!({"svc": 1}));
        let result = orch.run_direct(&ctx).await.unwrap();
        assert_eq!(result.total_count, 0);
        assert_eq!(result.summary.agents[0].status, AgentRunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let orch = orchestrator(vec![Arc::new(StaticAgent::new("a", 10, vec![]))], OrchestratorConfig::default());
        let err = orch.analyze(&ExecutionContext::default()).await.unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
    }

    #[tokio::test]
    async fn test_fallback_on_direct_failure() {
        let bad = StaticAgent::new("bad", 20, vec![]).failing();
        let orch = orchestrator(vec![Arc::new(bad)], OrchestratorConfig::default());
        let result = orch
            .analyze_with_mode(&doc_ctx(), ExecutionMode::DirectWithFallback)
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert!(result.is_fallback());
        assert!(result.summary.fallback.unwrap().reason.contains("all 1 agents failed"));
        assert_eq!(result.threats[0].source_agent, LEGACY_AGENT);
        let stats = orch.stats();
        assert_eq!(stats.fallbacks, 1);
        assert!((stats.fallback_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_shadow_returns_legacy_and_records() {
        let a = StaticAgent::new("a", 10, vec![finding("T9", FindingCategory::Threat, RiskLevel::High, "a")]);
        let orch = orchestrator(vec![Arc::new(a)], OrchestratorConfig::default());
        let result = orch
            .analyze_with_mode(&doc_ctx(), ExecutionMode::Shadow)
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(result.summary.mode, ExecutionMode::Shadow);
        assert_eq!(result.threats[0].source_agent, LEGACY_AGENT);
        let record = orch.comparisons().latest().unwrap();
        assert_eq!(record.count_delta, 0);
        assert!((record.severity_similarity - 1.0).abs() < 1e-9);
        assert!(!record.alert);
    }

    #[tokio::test]
    async fn test_legacy_without_analyzer() {
        let registry = Arc::new(AgentRegistry::new());
        let orch = Orchestrator::new(
            registry,
            Arc::new(HealthMonitor::default()),
            Arc::new(Validator::default()),
            OrchestratorConfig::default(),
        );
        let err = orch
            .analyze_with_mode(&doc_ctx(), ExecutionMode::Legacy)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Orchestrator(_)));
    }

    #[tokio::test]
    async fn test_step_executor_outcomes() {
        let untitled = Finding::new("T2", "", "Description without a title", FindingCategory::Threat, "ok");
        let ok = StaticAgent::new(
            "ok",
            10,
            vec![finding("T1", FindingCategory::Threat, RiskLevel::High, "ok"), untitled],
        );
        let bad = StaticAgent::new("bad", 20, vec![]).failing();
        let orch = orchestrator(vec![Arc::new(ok), Arc::new(bad)], OrchestratorConfig::default());
        let cfg = serde_json::json!({"depth": 2});

        match orch.execute_step("ok", &doc_ctx(), &cfg).await {
            Outcome::Success(out) => {
                assert_eq!(out.agent, "ok");
                assert_eq!(out.findings.len(), 1);
                assert_eq!(out.findings[0].id, "T1");
                assert_eq!(out.rejected, 1);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(matches!(
            orch.execute_step("bad", &doc_ctx(), &cfg).await,
            Outcome::Retryable(WardenError::ProviderUnavailable(_))
        ));
        assert!(matches!(
            orch.execute_step("ghost", &doc_ctx(), &cfg).await,
            Outcome::Fatal(WardenError::AgentNotFound(_))
        ));
        assert!(matches!(
            orch.execute_step("ok", &ExecutionContext::default(), &cfg).await,
            Outcome::Fatal(WardenError::ContextRequirement { .. })
        ));
    }
}
