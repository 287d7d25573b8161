use crate::artifact::{Artifact, NewArtifact};
use crate::config::WorkflowConfig;
use crate::retry::RetryPolicy;
use crate::run::{RunStatus, StepExecution, StepStatus, WorkflowRun};
use crate::store::WorkflowStore;
use crate::template::{TemplateSpec, WorkflowTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::{ExecutionContext, Finding, Outcome, WardenError, WardenResult};

/// What a successful step hands back to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    /// Resolved agent name.
    pub agent: String,
    /// Validated findings.
    pub findings: Vec<Finding>,
    /// Secrets replaced in the step's findings.
    pub redactions: usize,
    /// Near-duplicates dropped.
    pub duplicates_removed: usize,
    /// Findings dropped for failing validation.
    #[serde(default)]
    pub rejected: usize,
}

/// Runs one workflow step. Implemented by the orchestrator.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run `agent_type` against `ctx` with the step's `config`.
    async fn execute_step(
        &self,
        agent_type: &str,
        ctx: &ExecutionContext,
        config: &serde_json::Value,
    ) -> Outcome<StepOutput>;
}

/// Result of one step within an [`WorkflowEngine::execute_next_step`] batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Status after this attempt.
    pub status: StepStatus,
    /// Attempts charged against the retry policy.
    pub attempts: u32,
    /// Artifact written on success.
    #[serde(default)]
    pub artifact_id: Option<Uuid>,
    /// Failure message.
    #[serde(default)]
    pub error: Option<String>,
    /// The run was already terminal when the result arrived.
    #[serde(default)]
    pub after_cancellation: bool,
}

struct RunControl {
    lock: Mutex<()>,
    cancel: watch::Sender<bool>,
}

impl RunControl {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            lock: Mutex::new(()),
            cancel,
        }
    }

    fn signal_cancel(&self) {
        self.cancel.send_replace(true);
    }
}

struct PlannedStep {
    step_id: String,
    agent: String,
    config: serde_json::Value,
    ctx: ExecutionContext,
    input_artifacts: Vec<Uuid>,
    policy: RetryPolicy,
    charged: u32,
}

enum StepEnd {
    Completed(StepOutput),
    Failed(String),
    Skipped(String),
    Cancelled,
    DeadlineExceeded,
}

impl StepEnd {
    fn history_status(&self) -> StepStatus {
        match self {
            StepEnd::Completed(_) => StepStatus::Completed,
            StepEnd::Failed(_) => StepStatus::Failed,
            StepEnd::Skipped(_) => StepStatus::Skipped,
            StepEnd::Cancelled | StepEnd::DeadlineExceeded => StepStatus::Cancelled,
        }
    }

    fn error(&self) -> Option<String> {
        match self {
            StepEnd::Completed(_) => None,
            StepEnd::Failed(e) | StepEnd::Skipped(e) => Some(e.clone()),
            StepEnd::Cancelled => Some("run cancelled".into()),
            StepEnd::DeadlineExceeded => Some("run deadline exceeded".into()),
        }
    }
}

struct StepAttempts {
    end: StepEnd,
    /// Number of the last attempt made.
    attempt: u32,
    charged: u32,
    retries: u32,
    started_at: DateTime<Utc>,
}

/// Drives workflow runs over a step DAG.
///
/// Run state lives in the [`WorkflowStore`]; every mutation of one run happens
/// under that run's lock. Agent calls happen outside the lock.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<dyn StepExecutor>,
    config: WorkflowConfig,
    controls: parking_lot::Mutex<HashMap<Uuid, Arc<RunControl>>>,
}

impl WorkflowEngine {
    /// Create an engine over a store and a step executor.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: Arc<dyn StepExecutor>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            controls: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn control(&self, run_id: Uuid) -> Arc<RunControl> {
        self.controls
            .lock()
            .entry(run_id)
            .or_insert_with(|| Arc::new(RunControl::new()))
            .clone()
    }

    /// Forget the control of a finished or unknown run once no other call
    /// holds it. Clones are only handed out under the map lock.
    async fn release_control(&self, run_id: Uuid, control: Arc<RunControl>) {
        let finished = match self.store.get_run(run_id).await {
            Ok(Some(run)) => run.status.is_terminal(),
            Ok(None) => true,
            Err(_) => false,
        };
        if !finished {
            return;
        }
        let mut controls = self.controls.lock();
        let idle = controls
            .get(&run_id)
            .is_some_and(|held| Arc::ptr_eq(held, &control) && Arc::strong_count(&control) == 2);
        if idle {
            controls.remove(&run_id);
            debug!(run = %run_id, "Run control released");
        }
    }

    /// Number of runs with live scheduling state.
    pub fn tracked_runs(&self) -> usize {
        self.controls.lock().len()
    }

    async fn load_run(&self, run_id: Uuid) -> WardenResult<WorkflowRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("run {run_id}")))
    }

    /// Validate and store a template. Cycles are rejected before anything runs.
    pub async fn create_template(&self, spec: TemplateSpec) -> WardenResult<Uuid> {
        let template = WorkflowTemplate::from_spec(spec)?;
        self.store.save_template(&template).await?;
        info!(template = %template.id, name = %template.name, steps = template.steps.len(), "Workflow template created");
        Ok(template.id)
    }

    /// Fetch a template, erroring when unknown.
    pub async fn get_template(&self, template_id: Uuid) -> WardenResult<WorkflowTemplate> {
        self.store
            .get_template(template_id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("template {template_id}")))
    }

    /// All templates.
    pub async fn list_templates(&self) -> WardenResult<Vec<WorkflowTemplate>> {
        self.store.list_templates().await
    }

    /// Create a run in CREATED state. It starts on the first
    /// [`execute_next_step`](Self::execute_next_step).
    pub async fn start_run(&self, template_id: Uuid, context: ExecutionContext) -> WardenResult<Uuid> {
        let template = self.get_template(template_id).await?;
        let run = WorkflowRun::new(template, context);
        self.store.save_run(&run).await?;
        info!(run = %run.id, template = %template_id, "Workflow run created");
        Ok(run.id)
    }

    /// Fetch a run, erroring when unknown.
    pub async fn get_run(&self, run_id: Uuid) -> WardenResult<WorkflowRun> {
        self.load_run(run_id).await
    }

    /// Current status of a run.
    pub async fn get_run_status(&self, run_id: Uuid) -> WardenResult<RunStatus> {
        Ok(self.load_run(run_id).await?.status)
    }

    /// Run every currently ready step (up to `max_parallel_steps`) and
    /// commit each result. Returns the batch; empty when nothing was ready.
    pub async fn execute_next_step(&self, run_id: Uuid) -> WardenResult<Vec<StepResult>> {
        let control = self.control(run_id);
        let result = self.execute_batch(run_id, &control).await;
        self.release_control(run_id, control).await;
        result
    }

    async fn execute_batch(
        &self,
        run_id: Uuid,
        control: &Arc<RunControl>,
    ) -> WardenResult<Vec<StepResult>> {
        let (planned, deadline) = {
            let _guard = control.lock.lock().await;
            let mut run = self.load_run(run_id).await?;
            match run.status {
                RunStatus::Paused => {
                    return Err(WardenError::InvalidTransition {
                        from: RunStatus::Paused.to_string(),
                        to: RunStatus::Running.to_string(),
                    })
                }
                status if status.is_terminal() => return Ok(Vec::new()),
                RunStatus::Created => {
                    run.transition(RunStatus::Running)?;
                    let now = Utc::now();
                    run.deadline = chrono::Duration::from_std(self.config.run_timeout())
                        .ok()
                        .and_then(|d| now.checked_add_signed(d));
                    info!(run = %run_id, "Workflow run started");
                }
                _ => {}
            }

            if run.deadline_passed(Utc::now()) {
                warn!(run = %run_id, "Workflow run exceeded its deadline");
                run.failure = Some("run deadline exceeded".into());
                abort_run(&mut run, RunStatus::TimedOut, control)?;
                self.store.save_run(&run).await?;
                return Ok(Vec::new());
            }

            let ready: Vec<String> = run
                .ready_steps()
                .into_iter()
                .take(self.config.max_parallel_steps.max(1))
                .collect();

            if ready.is_empty() {
                if run.all_steps_finished() {
                    run.transition(RunStatus::Completed)?;
                    info!(run = %run_id, completed = run.completed_steps, "Workflow run completed");
                    self.store.save_run(&run).await?;
                } else if run.running_steps() == 0 {
                    warn!(run = %run_id, "No runnable steps left, failing run");
                    run.failure = Some("no runnable steps: unmet dependencies".into());
                    abort_run(&mut run, RunStatus::Failed, control)?;
                    self.store.save_run(&run).await?;
                }
                return Ok(Vec::new());
            }

            let mut planned = Vec::with_capacity(ready.len());
            for step_id in &ready {
                planned.push(self.plan_step(&run, step_id).await?);
                if let Some(state) = run.steps.get_mut(step_id) {
                    state.status = StepStatus::Running;
                }
            }
            run.current_step = ready.first().cloned();
            self.store.save_run(&run).await?;
            debug!(run = %run_id, steps = ?ready, "Dispatching ready steps");
            (planned, run.deadline)
        };

        let executions = planned.into_iter().map(|plan| {
            let control = control.clone();
            async move {
                let attempts = self
                    .run_step(run_id, &plan, deadline, control.cancel.subscribe())
                    .await?;
                self.commit_step(run_id, &control, plan, attempts).await
            }
        });

        let mut results = Vec::new();
        let mut first_error = None;
        for outcome in join_all(executions).await {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            self.fail_run(run_id, control, &e).await;
            return Err(e);
        }
        Ok(results)
    }

    /// Drive the run until it reaches a terminal state.
    pub async fn run_to_completion(&self, run_id: Uuid) -> WardenResult<WorkflowRun> {
        loop {
            let run = self.load_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            self.execute_next_step(run_id).await?;
        }
    }

    /// Stop scheduling and signal in-flight steps. Results arriving later are
    /// kept in history only.
    pub async fn cancel_run(&self, run_id: Uuid) -> WardenResult<()> {
        let control = self.control(run_id);
        let result: WardenResult<()> = async {
            let _guard = control.lock.lock().await;
            let mut run = self.load_run(run_id).await?;
            abort_run(&mut run, RunStatus::Cancelled, &control)?;
            self.store.save_run(&run).await?;
            info!(run = %run_id, "Workflow run cancelled");
            Ok(())
        }
        .await;
        self.release_control(run_id, control).await;
        result
    }

    /// Stop scheduling new steps. Steps already running still commit.
    pub async fn pause_run(&self, run_id: Uuid) -> WardenResult<()> {
        self.set_status(run_id, RunStatus::Paused).await
    }

    /// Move a PAUSED run back to RUNNING.
    pub async fn resume_run(&self, run_id: Uuid) -> WardenResult<()> {
        self.set_status(run_id, RunStatus::Running).await
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus) -> WardenResult<()> {
        let control = self.control(run_id);
        let result: WardenResult<()> = async {
            let _guard = control.lock.lock().await;
            let mut run = self.load_run(run_id).await?;
            run.transition(status)?;
            self.store.save_run(&run).await?;
            info!(run = %run_id, status = %status, "Workflow run status changed");
            Ok(())
        }
        .await;
        self.release_control(run_id, control).await;
        result
    }

    /// Every attempt recorded for a run, in order.
    pub async fn step_history(&self, run_id: Uuid) -> WardenResult<Vec<StepExecution>> {
        self.store.step_executions(run_id).await
    }

    /// Every version of every artifact in a run.
    pub async fn list_artifacts(&self, run_id: Uuid) -> WardenResult<Vec<Artifact>> {
        self.store.list_artifacts(run_id).await
    }

    /// Latest version when `version` is `None`.
    pub async fn get_artifact(
        &self,
        run_id: Uuid,
        name: &str,
        version: Option<u32>,
    ) -> WardenResult<Artifact> {
        self.store
            .get_artifact(run_id, name, version)
            .await?
            .ok_or_else(|| match version {
                Some(v) => WardenError::NotFound(format!("artifact '{name}' v{v} of run {run_id}")),
                None => WardenError::NotFound(format!("artifact '{name}' of run {run_id}")),
            })
    }

    /// Write a new latest version copying `version`. Older versions stay.
    pub async fn restore_artifact(
        &self,
        run_id: Uuid,
        name: &str,
        version: u32,
    ) -> WardenResult<Artifact> {
        let control = self.control(run_id);
        let result: WardenResult<Artifact> = async {
            let _guard = control.lock.lock().await;
            let old = self.get_artifact(run_id, name, Some(version)).await?;
            let mut restored = NewArtifact::new(run_id, name, old.content).with_kind(old.kind);
            if let Some(step_id) = old.step_id {
                restored = restored.from_step(step_id);
            }
            let artifact = self.store.write_artifact(restored).await?;
            info!(run = %run_id, artifact = %name, from = version, to = artifact.version, "Artifact restored");
            Ok(artifact)
        }
        .await;
        self.release_control(run_id, control).await;
        result
    }

    async fn plan_step(&self, run: &WorkflowRun, step_id: &str) -> WardenResult<PlannedStep> {
        let spec = run
            .template
            .step(step_id)
            .ok_or_else(|| WardenError::NotFound(format!("step '{step_id}'")))?;

        let mut prior = run.context.prior_findings.clone();
        let mut input_artifacts = Vec::new();
        for dep in &spec.depends_on {
            let name = run.template.artifact_name(dep);
            if let Some(artifact) = self.store.get_artifact(run.id, &name, None).await? {
                prior.extend(artifact.findings());
                input_artifacts.push(artifact.id);
            }
        }

        Ok(PlannedStep {
            step_id: step_id.to_string(),
            agent: spec.agent.clone(),
            config: spec.config.clone(),
            ctx: run.context.clone().with_prior_findings(prior),
            input_artifacts,
            policy: spec.retry.unwrap_or(self.config.retry),
            charged: run.steps.get(step_id).map_or(0, |s| s.attempts),
        })
    }

    async fn run_step(
        &self,
        run_id: Uuid,
        plan: &PlannedStep,
        deadline: Option<DateTime<Utc>>,
        mut cancel: watch::Receiver<bool>,
    ) -> WardenResult<StepAttempts> {
        let mut attempt = 0u32;
        let mut charged = plan.charged;
        let mut retries = 0u32;
        loop {
            attempt += 1;
            let started_at = Utc::now();
            let finish = move |end: StepEnd, charged: u32| StepAttempts {
                end,
                attempt,
                charged,
                retries,
                started_at,
            };

            let outcome = tokio::select! {
                outcome = self.executor.execute_step(&plan.agent, &plan.ctx, &plan.config) => outcome,
                _ = cancelled(&mut cancel) => return Ok(finish(StepEnd::Cancelled, charged)),
                _ = until(deadline) => return Ok(finish(StepEnd::DeadlineExceeded, charged)),
            };

            match outcome {
                Outcome::Success(output) => {
                    return Ok(finish(StepEnd::Completed(output), charged + 1));
                }
                Outcome::Fatal(e @ WardenError::CircuitOpen { .. }) => {
                    warn!(run = %run_id, step = %plan.step_id, error = %e, "Step failed fast on open circuit");
                    return Ok(finish(StepEnd::Failed(e.to_string()), charged));
                }
                Outcome::Fatal(e @ WardenError::ContextRequirement { .. }) => {
                    info!(run = %run_id, step = %plan.step_id, reason = %e, "Step skipped");
                    return Ok(finish(StepEnd::Skipped(e.to_string()), charged));
                }
                Outcome::Fatal(e) => {
                    warn!(run = %run_id, step = %plan.step_id, error = %e, "Step failed");
                    return Ok(finish(StepEnd::Failed(e.to_string()), charged + 1));
                }
                Outcome::Retryable(e) => {
                    charged += 1;
                    if !plan.policy.has_attempts_left(charged) {
                        warn!(run = %run_id, step = %plan.step_id, attempts = charged, error = %e, "Step exhausted its retries");
                        return Ok(finish(StepEnd::Failed(e.to_string()), charged));
                    }
                    let finished_at = Utc::now();
                    self.store
                        .append_step_execution(&StepExecution {
                            id: Uuid::new_v4(),
                            run_id,
                            step_id: plan.step_id.clone(),
                            attempt,
                            status: StepStatus::Failed,
                            started_at,
                            finished_at,
                            duration_ms: elapsed_ms(started_at, finished_at),
                            error: Some(e.to_string()),
                            input_artifacts: plan.input_artifacts.clone(),
                            output_artifact: None,
                            after_cancellation: false,
                        })
                        .await?;
                    let delay = plan.policy.backoff(charged);
                    warn!(run = %run_id, step = %plan.step_id, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying step");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut cancel) => return Ok(finish(StepEnd::Cancelled, charged)),
                        _ = until(deadline) => return Ok(finish(StepEnd::DeadlineExceeded, charged)),
                    }
                    retries += 1;
                }
            }
        }
    }

    async fn commit_step(
        &self,
        run_id: Uuid,
        control: &RunControl,
        plan: PlannedStep,
        attempts: StepAttempts,
    ) -> WardenResult<StepResult> {
        let _guard = control.lock.lock().await;
        let mut run = self.load_run(run_id).await?;
        let finished_at = Utc::now();
        let mut execution = StepExecution {
            id: Uuid::new_v4(),
            run_id,
            step_id: plan.step_id.clone(),
            attempt: attempts.attempt,
            status: attempts.end.history_status(),
            started_at: attempts.started_at,
            finished_at,
            duration_ms: elapsed_ms(attempts.started_at, finished_at),
            error: attempts.end.error(),
            input_artifacts: plan.input_artifacts,
            output_artifact: None,
            after_cancellation: false,
        };

        if run.status.is_terminal() {
            execution.after_cancellation = true;
            self.store.append_step_execution(&execution).await?;
            info!(run = %run_id, step = %plan.step_id, status = ?execution.status, "Late step result recorded");
            return Ok(StepResult {
                step_id: plan.step_id,
                status: execution.status,
                attempts: attempts.charged,
                artifact_id: None,
                error: execution.error,
                after_cancellation: true,
            });
        }

        let optional = run.template.step(&plan.step_id).is_some_and(|s| s.optional);
        let mut abort = None;
        let state_status = match attempts.end {
            StepEnd::Completed(output) => {
                let content = serde_json::json!({
                    "agent": output.agent,
                    "findings": serde_json::to_value(&output.findings)?,
                    "redactions": output.redactions,
                    "duplicates_removed": output.duplicates_removed,
                    "rejected": output.rejected,
                });
                let name = run.template.artifact_name(&plan.step_id);
                let artifact = self
                    .store
                    .write_artifact(NewArtifact::new(run_id, name, content).from_step(&plan.step_id))
                    .await?;
                execution.output_artifact = Some(artifact.id);
                run.completed_steps += 1;
                info!(run = %run_id, step = %plan.step_id, artifact = %artifact.name, version = artifact.version, findings = output.findings.len(), "Step completed");
                StepStatus::Completed
            }
            StepEnd::Failed(ref error) if optional => {
                warn!(run = %run_id, step = %plan.step_id, error = %error, "Optional step failed, skipping");
                StepStatus::Skipped
            }
            StepEnd::Failed(ref error) => {
                let blocked = run.template.dependents(&plan.step_id);
                warn!(run = %run_id, step = %plan.step_id, blocked = ?blocked, error = %error, "Required step failed");
                let mut failure = format!("step '{}' failed: {error}", plan.step_id);
                if !blocked.is_empty() {
                    failure.push_str(&format!(" (blocks {})", blocked.join(", ")));
                }
                run.failure = Some(failure);
                abort = Some(RunStatus::Failed);
                StepStatus::Failed
            }
            StepEnd::Skipped(_) => StepStatus::Skipped,
            StepEnd::Cancelled => {
                execution.after_cancellation = true;
                abort = Some(RunStatus::Cancelled);
                StepStatus::Cancelled
            }
            StepEnd::DeadlineExceeded => {
                execution.after_cancellation = true;
                run.failure = Some("run deadline exceeded".into());
                abort = Some(RunStatus::TimedOut);
                StepStatus::Cancelled
            }
        };

        run.retry_count += attempts.retries;
        if let Some(state) = run.steps.get_mut(&plan.step_id) {
            state.status = state_status;
            state.attempts = attempts.charged;
            state.last_error = execution.error.clone();
            state.artifact_id = execution.output_artifact;
        }

        if let Some(status) = abort {
            warn!(run = %run_id, status = %status, failure = ?run.failure, "Workflow run aborted");
            abort_run(&mut run, status, control)?;
        } else if run.all_steps_finished() && run.status == RunStatus::Running {
            run.transition(RunStatus::Completed)?;
            info!(run = %run_id, completed = run.completed_steps, "Workflow run completed");
        } else {
            run.current_step = run
                .template
                .order
                .iter()
                .find(|s| run.step_status(s) == Some(StepStatus::Running))
                .cloned();
        }

        self.store.append_step_execution(&execution).await?;
        self.store.save_run(&run).await?;

        Ok(StepResult {
            step_id: plan.step_id,
            status: state_status,
            attempts: attempts.charged,
            artifact_id: execution.output_artifact,
            error: execution.error,
            after_cancellation: execution.after_cancellation,
        })
    }

    /// Best effort: record an infrastructure error on the run.
    async fn fail_run(&self, run_id: Uuid, control: &RunControl, error: &WardenError) {
        let _guard = control.lock.lock().await;
        let Ok(mut run) = self.load_run(run_id).await else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        run.failure = Some(error.to_string());
        if abort_run(&mut run, RunStatus::Failed, control).is_ok() {
            if let Err(e) = self.store.save_run(&run).await {
                warn!(run = %run_id, error = %e, "Could not record run failure");
            }
        }
    }
}

fn abort_run(run: &mut WorkflowRun, status: RunStatus, control: &RunControl) -> WardenResult<()> {
    run.transition(status)?;
    for state in run.steps.values_mut() {
        if !state.status.is_finished() {
            state.status = StepStatus::Cancelled;
        }
    }
    control.signal_cancel();
    Ok(())
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn until(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(d) => {
            let remaining = (d - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryWorkflowStore;
    use crate::template::StepSpec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use warden_core::FindingCategory;

    /// Executor driven by a per-agent script of error kinds; anything
    /// unscripted succeeds with one finding.
    #[derive(Default)]
    struct ScriptedExecutor {
        script: parking_lot::Mutex<HashMap<String, Vec<&'static str>>>,
        calls: AtomicU32,
    }

    impl ScriptedExecutor {
        fn fail(self, agent: &str, script: Vec<&'static str>) -> Self {
            self.script.lock().insert(agent.to_string(), script);
            self
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute_step(
            &self,
            agent_type: &str,
            ctx: &ExecutionContext,
            _config: &serde_json::Value,
        ) -> Outcome<StepOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock();
                script.get_mut(agent_type).and_then(|s| (!s.is_empty()).then(|| s.remove(0)))
            };
            match next {
                Some("transient") => Outcome::Retryable(WardenError::ProviderUnavailable("down".into())),
                Some("fatal") => Outcome::Fatal(WardenError::Validation("bad output".into())),
                Some("circuit") => Outcome::Fatal(WardenError::CircuitOpen {
                    agent: agent_type.into(),
                    retry_after_secs: 300,
                }),
                Some("requirement") => Outcome::Fatal(WardenError::ContextRequirement {
                    agent: agent_type.into(),
                    reason: "no document".into(),
                }),
                _ => Outcome::Success(StepOutput {
                    agent: agent_type.into(),
                    findings: vec![Finding::new(
                        format!("{agent_type}-{}", ctx.prior_findings.len()),
                        format!("{agent_type} finding"),
                        "desc",
                        FindingCategory::Threat,
                        agent_type,
                    )],
                    ..StepOutput::default()
                }),
            }
        }
    }

    fn fast_config() -> WorkflowConfig {
        WorkflowConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base_ms: 1,
                backoff_max_ms: 2,
            },
            ..WorkflowConfig::default()
        }
    }

    fn engine(executor: ScriptedExecutor) -> (WorkflowEngine, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let engine = WorkflowEngine::new(
            Arc::new(InMemoryWorkflowStore::new()),
            executor.clone(),
            fast_config(),
        );
        (engine, executor)
    }

    fn chain() -> TemplateSpec {
        TemplateSpec::new("chain")
            .step("a", StepSpec::new("stride"))
            .step("b", StepSpec::new("owasp").depends_on(["a"]))
    }

    #[tokio::test]
    async fn test_chain_passes_prior_findings() {
        let (engine, _) = engine(ScriptedExecutor::default());
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        assert_eq!(engine.get_run_status(run_id).await.unwrap(), RunStatus::Created);

        let first = engine.execute_next_step(run_id).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].step_id, "a");
        assert_eq!(engine.get_run_status(run_id).await.unwrap(), RunStatus::Running);

        let second = engine.execute_next_step(run_id).await.unwrap();
        assert_eq!(second[0].step_id, "b");

        let run = engine.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.completed_steps, 2);
        assert!(run.current_step.is_none());

        // b saw a's single finding
        let b = engine.get_artifact(run_id, "b", None).await.unwrap();
        assert_eq!(b.findings()[0].id, "owasp-1");
        let history = engine.step_history(run_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].input_artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry() {
        let (engine, executor) =
            engine(ScriptedExecutor::default().fail("stride", vec!["transient", "transient"]));
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        let run = engine.run_to_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.retry_count, 2);
        assert_eq!(run.steps["a"].attempts, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);

        let history = engine.step_history(run_id).await.unwrap();
        let a: Vec<_> = history.iter().filter(|e| e.step_id == "a").collect();
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].status, StepStatus::Failed);
        assert_eq!(a[2].status, StepStatus::Completed);
        assert_eq!(a[2].attempt, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_run() {
        let (engine, _) = engine(
            ScriptedExecutor::default().fail("stride", vec!["transient", "transient", "transient"]),
        );
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        let run = engine.run_to_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps["a"].status, StepStatus::Failed);
        assert_eq!(run.steps["b"].status, StepStatus::Cancelled);
        let failure = run.failure.unwrap();
        assert!(failure.contains("step 'a' failed"));
        assert!(failure.ends_with("(blocks b)"));
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped() {
        let (engine, _) = engine(ScriptedExecutor::default().fail("stride", vec!["fatal"]));
        let spec = TemplateSpec::new("optional")
            .step("a", StepSpec::new("stride").optional())
            .step("b", StepSpec::new("owasp").depends_on(["a"]));
        let template = engine.create_template(spec).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        let run = engine.run_to_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.steps["a"].status, StepStatus::Skipped);
        assert_eq!(run.steps["b"].status, StepStatus::Completed);
        let history = engine.step_history(run_id).await.unwrap();
        assert_eq!(history[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_circuit_open_fails_without_charging() {
        let (engine, executor) = engine(ScriptedExecutor::default().fail("stride", vec!["circuit"]));
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        let run = engine.run_to_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps["a"].attempts, 0);
        assert_eq!(run.retry_count, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmet_requirement_skips_step() {
        let (engine, _) = engine(ScriptedExecutor::default().fail("stride", vec!["requirement"]));
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        let run = engine.run_to_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.steps["a"].status, StepStatus::Skipped);
        assert_eq!(run.completed_steps, 1);
        assert!(engine.get_artifact(run_id, "a", None).await.is_err());
    }

    #[tokio::test]
    async fn test_pause_blocks_scheduling() {
        let (engine, _) = engine(ScriptedExecutor::default());
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        engine.execute_next_step(run_id).await.unwrap();
        engine.pause_run(run_id).await.unwrap();
        assert!(matches!(
            engine.execute_next_step(run_id).await,
            Err(WardenError::InvalidTransition { .. })
        ));
        engine.resume_run(run_id).await.unwrap();
        let run = engine.run_to_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_final() {
        let (engine, executor) = engine(ScriptedExecutor::default());
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        engine.cancel_run(run_id).await.unwrap();
        assert_eq!(engine.get_run_status(run_id).await.unwrap(), RunStatus::Cancelled);
        assert!(engine.execute_next_step(run_id).await.unwrap().is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(engine.cancel_run(run_id).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out() {
        let executor = Arc::new(ScriptedExecutor::default());
        let engine = WorkflowEngine::new(
            Arc::new(InMemoryWorkflowStore::new()),
            executor,
            WorkflowConfig {
                run_timeout_secs: 0,
                ..fast_config()
            },
        );
        let template = engine.create_template(chain()).await.unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        let run = engine.run_to_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_finished_runs_release_control() {
        let (engine, _) = engine(ScriptedExecutor::default());
        let template = engine.create_template(chain()).await.unwrap();

        let done = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        engine.run_to_completion(done).await.unwrap();
        assert_eq!(engine.tracked_runs(), 0);

        let paused = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        engine.execute_next_step(paused).await.unwrap();
        engine.pause_run(paused).await.unwrap();
        assert_eq!(engine.tracked_runs(), 1);
        engine.cancel_run(paused).await.unwrap();
        assert_eq!(engine.tracked_runs(), 0);

        assert!(engine.execute_next_step(Uuid::new_v4()).await.is_err());
        assert!(engine.cancel_run(Uuid::new_v4()).await.is_err());
        assert_eq!(engine.tracked_runs(), 0);
    }

    #[tokio::test]
    async fn test_restore_artifact() {
        let (engine, _) = engine(ScriptedExecutor::default());
        let template = engine
            .create_template(TemplateSpec::new("one").step("a", StepSpec::new("stride")))
            .await
            .unwrap();
        let run_id = engine.start_run(template, ExecutionContext::default()).await.unwrap();
        engine.run_to_completion(run_id).await.unwrap();

        let restored = engine.restore_artifact(run_id, "a", 1).await.unwrap();
        assert_eq!(restored.version, 2);
        assert_eq!(restored.step_id.as_deref(), Some("a"));
        let v1 = engine.get_artifact(run_id, "a", Some(1)).await.unwrap();
        assert_eq!(v1.hash, restored.hash);
        assert!(!v1.is_latest);
        assert!(engine.restore_artifact(run_id, "a", 7).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_run_and_template() {
        let (engine, _) = engine(ScriptedExecutor::default());
        assert!(matches!(
            engine.start_run(Uuid::new_v4(), ExecutionContext::default()).await,
            Err(WardenError::NotFound(_))
        ));
        assert!(matches!(
            engine.get_run_status(Uuid::new_v4()).await,
            Err(WardenError::NotFound(_))
        ));
    }
}
