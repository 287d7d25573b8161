//! End-to-end workflow tests.
//!
//! Runs the built-in agents through the orchestrator, health monitor and
//! workflow engine against scripted generation backends.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warden_agents::{builtin_agents, AgentRegistry, BreakerState, HealthConfig, HealthMonitor};
use warden_core::*;
use warden_orchestrator::*;
use warden_security::{Strictness, Validator};

// ---------------------------------------------------------------------------
// Scripted backend: optional latency, optional outage, prompt log
// ---------------------------------------------------------------------------

struct ScriptedBackend {
    delay: Duration,
    down: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(&self, request: GenerationRequest) -> WardenResult<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        if self.down.load(Ordering::SeqCst) {
            return Err(WardenError::ProviderUnavailable("upstream 503".into()));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Generation {
            content: r#"{"findings": [{"id": "F-1", "title": "Token replay on checkout",
                "description": "Payment tokens can be replayed within their lifetime",
                "category": "threat", "component": "checkout", "impact": "high",
                "likelihood": "medium", "confidence": 0.8}]}"#
                .into(),
            tokens_used: 64,
        })
    }
}

struct Stack {
    backend: Arc<ScriptedBackend>,
    orchestrator: Arc<Orchestrator>,
    engine: WorkflowEngine,
}

fn stack_with(backend: Arc<ScriptedBackend>, store: Arc<dyn WorkflowStore>) -> Stack {
    let registry = Arc::new(AgentRegistry::with_agents(builtin_agents(backend.clone())).unwrap());
    let monitor = Arc::new(HealthMonitor::new(HealthConfig::default()));
    let orchestrator = Arc::new(
        Orchestrator::new(
            registry,
            monitor,
            Arc::new(Validator::new(Strictness::Standard)),
            OrchestratorConfig::default(),
        )
        .with_legacy(Arc::new(SinglePromptAnalyzer::new(backend.clone()))),
    );
    let config = WorkflowConfig {
        retry: RetryPolicy {
            max_attempts: 5,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
        },
        ..WorkflowConfig::default()
    };
    let engine = WorkflowEngine::new(store, orchestrator.clone(), config);
    Stack {
        backend,
        orchestrator,
        engine,
    }
}

fn stack(delay: Duration) -> Stack {
    stack_with(
        Arc::new(ScriptedBackend::new(delay)),
        Arc::new(InMemoryWorkflowStore::new()),
    )
}

fn document() -> ExecutionContext {
    ExecutionContext::new(Uuid::new_v4())
        .with_input_text("Checkout service issues payment tokens and calls the card processor.")
}

fn fan_in() -> TemplateSpec {
    TemplateSpec::new("fan-in")
        .step("a", StepSpec::new("stride"))
        .step("b", StepSpec::new("vulnerability_scan"))
        .step("c", StepSpec::new("compliance").depends_on(["a", "b"]))
}

// ---------------------------------------------------------------------------
// 1. Independent steps run concurrently; the dependent step sees their output
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fan_in_workflow_completes() {
    let stack = stack(Duration::from_millis(50));
    let template = stack.engine.create_template(fan_in()).await.unwrap();
    let run_id = stack.engine.start_run(template, document()).await.unwrap();

    let first = stack.engine.execute_next_step(run_id).await.unwrap();
    let ids: Vec<&str> = first.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(stack.backend.max_in_flight.load(Ordering::SeqCst) >= 2);

    let run = stack.engine.run_to_completion(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps, 3);

    let prompts = stack.backend.prompts.lock();
    let last = prompts.last().unwrap();
    assert!(last.contains("## Findings from earlier steps"));
    drop(prompts);

    let history = stack.engine.step_history(run_id).await.unwrap();
    let c = history.iter().find(|e| e.step_id == "c").unwrap();
    assert_eq!(c.input_artifacts.len(), 2);

    let artifacts = stack.engine.list_artifacts(run_id).await.unwrap();
    assert_eq!(artifacts.len(), 3);
    assert!(artifacts.iter().all(|a| a.is_latest && a.verify()));
    assert_eq!(artifacts[0].findings()[0].source_agent, "stride");
}

// ---------------------------------------------------------------------------
// 2. Cycles are rejected before anything is stored or executed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_template_is_rejected() {
    let stack = stack(Duration::ZERO);
    let spec = TemplateSpec::new("loop")
        .step("a", StepSpec::new("stride").depends_on(["b"]))
        .step("b", StepSpec::new("owasp").depends_on(["a"]));
    let err = stack.engine.create_template(spec).await.unwrap_err();
    assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    assert!(stack.engine.list_templates().await.unwrap().is_empty());
    assert_eq!(stack.backend.calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// 3. Shadow mode returns the legacy result and records a comparison
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shadow_and_comparison_modes() {
    let stack = stack(Duration::ZERO);
    let orch = &stack.orchestrator;

    let shadow = orch
        .analyze_with_mode(&document(), ExecutionMode::Shadow)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(shadow.summary.mode, ExecutionMode::Shadow);
    assert_eq!(shadow.summary.agents.len(), 1);
    assert_eq!(shadow.summary.agents[0].agent, LEGACY_AGENT);
    assert_eq!(orch.comparisons().len(), 1);

    let record = orch
        .analyze_with_mode(&document(), ExecutionMode::Comparison)
        .await
        .unwrap()
        .into_comparison()
        .unwrap();
    assert_eq!(record.legacy_count, 1);
    assert!(record.direct_count >= 1);
    assert!((record.severity_similarity - 1.0).abs() < 1e-9);
    assert!(record.agents_only_legacy.contains(&LEGACY_AGENT.to_string()));
    assert_eq!(orch.comparisons().len(), 2);

    let stats = orch.stats();
    assert_eq!(stats.total_runs, 2);
    assert_eq!(stats.successes["shadow"], 1);
    assert_eq!(stats.successes["comparison"], 1);
}

// ---------------------------------------------------------------------------
// 4. An outage trips the breaker; the step then fails fast without more calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn breaker_stops_retries_in_workflow() {
    let stack = stack(Duration::ZERO);
    stack.backend.down.store(true, Ordering::SeqCst);

    let template = stack
        .engine
        .create_template(TemplateSpec::new("single").step("a", StepSpec::new("stride")))
        .await
        .unwrap();
    let run_id = stack.engine.start_run(template, document()).await.unwrap();
    let run = stack.engine.run_to_completion(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    // Three charged failures open the breaker; the circuit-open attempt is free.
    assert_eq!(run.steps["a"].attempts, 3);
    assert!(run.steps["a"].last_error.as_deref().unwrap().contains("Circuit open"));

    let monitor = stack.orchestrator.monitor();
    assert_eq!(monitor.state("stride"), BreakerState::Open);
    assert!(monitor.metrics("stride").unwrap().manual_reset_required);

    // Three analyze calls plus three recovery probes, nothing after.
    assert_eq!(stack.backend.calls.load(Ordering::SeqCst), 6);
    let history = stack.engine.step_history(run_id).await.unwrap();
    assert_eq!(history.len(), 4);
}

// ---------------------------------------------------------------------------
// 5. Artifact versions survive a reopen of the JSON file store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn artifact_versions_on_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileWorkflowStore::new(dir.path().to_path_buf()).await.unwrap());
    let stack = stack_with(Arc::new(ScriptedBackend::new(Duration::ZERO)), store);

    let template = stack
        .engine
        .create_template(
            TemplateSpec::new("versions").step("a", StepSpec::new("stride").with_output("findings")),
        )
        .await
        .unwrap();
    let run_id = stack.engine.start_run(template, document()).await.unwrap();
    stack.engine.run_to_completion(run_id).await.unwrap();

    stack.engine.restore_artifact(run_id, "findings", 1).await.unwrap();
    let third = stack.engine.restore_artifact(run_id, "findings", 2).await.unwrap();
    assert_eq!(third.version, 3);

    let reopened = JsonFileWorkflowStore::new(dir.path().to_path_buf()).await.unwrap();
    let versions = reopened.list_artifacts(run_id).await.unwrap();
    assert_eq!(versions.iter().map(|a| a.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(versions.iter().filter(|a| a.is_latest).count(), 1);
    let latest = reopened.get_artifact(run_id, "findings", None).await.unwrap().unwrap();
    assert_eq!(latest.version, 3);
    assert_eq!(
        reopened.get_run(run_id).await.unwrap().unwrap().status,
        RunStatus::Completed
    );
}

// ---------------------------------------------------------------------------
// 6. Cancelling a run interrupts in-flight steps and keeps them in history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_interrupts_in_flight_step() {
    let stack = stack(Duration::from_secs(30));
    let template = stack
        .engine
        .create_template(TemplateSpec::new("slow").step("a", StepSpec::new("stride")))
        .await
        .unwrap();
    let run_id = stack.engine.start_run(template, document()).await.unwrap();

    let (results, cancelled) = tokio::join!(stack.engine.execute_next_step(run_id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stack.engine.cancel_run(run_id).await
    });
    cancelled.unwrap();
    let results = results.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StepStatus::Cancelled);
    assert!(results[0].after_cancellation);

    let run = stack.engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.steps["a"].status, StepStatus::Cancelled);
    let history = stack.engine.step_history(run_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].after_cancellation);
    assert!(stack.engine.list_artifacts(run_id).await.unwrap().is_empty());
    assert_eq!(stack.engine.tracked_runs(), 0);
}
