use crate::template::WorkflowTemplate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use warden_core::{ExecutionContext, WardenError, WardenResult};

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Persisted, not started.
    Created,
    /// Steps are being executed.
    Running,
    /// Suspended until resumed.
    Paused,
    /// Every step finished.
    Completed,
    /// A required step failed.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Run deadline exceeded.
    TimedOut,
}

impl RunStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }

    /// Whether the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Paused, TimedOut)
        )
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one step within a run, also used for execution history entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Attempt in flight.
    Running,
    /// Produced an artifact.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Optional step that failed, or a step that will never run.
    Skipped,
    /// Abandoned when the run ended.
    Cancelled,
}

impl StepStatus {
    /// Dependents may start once a dependency is in one of these.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    /// Whether the step will not run again.
    pub fn is_finished(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Per-step progress inside a [`WorkflowRun`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Current status.
    pub status: StepStatus,
    /// Attempts charged against the retry policy.
    pub attempts: u32,
    /// Error of the latest failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Output artifact once completed.
    #[serde(default)]
    pub artifact_id: Option<Uuid>,
}

/// One execution of a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id.
    pub id: Uuid,
    /// Template the run was started from.
    pub template_id: Uuid,
    /// Snapshot taken at start so later template changes never affect the run.
    pub template: WorkflowTemplate,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Input handed to every step.
    pub context: ExecutionContext,
    /// Progress per step id.
    pub steps: BTreeMap<String, StepState>,
    /// Step most recently dispatched.
    #[serde(default)]
    pub current_step: Option<String>,
    /// Steps that reached COMPLETED.
    pub completed_steps: usize,
    /// Retries across all steps.
    pub retry_count: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First transition to RUNNING.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time a terminal state was reached.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Time after which the run times out.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Reason for a failed or timed-out run.
    #[serde(default)]
    pub failure: Option<String>,
}

impl WorkflowRun {
    /// A CREATED run with every step pending.
    pub fn new(template: WorkflowTemplate, context: ExecutionContext) -> Self {
        let id = Uuid::new_v4();
        let steps = template
            .order
            .iter()
            .map(|s| (s.clone(), StepState::default()))
            .collect();
        let mut context = context;
        context.run_id = id;
        Self {
            id,
            template_id: template.id,
            template,
            status: RunStatus::Created,
            context,
            steps,
            current_step: None,
            completed_steps: 0,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            deadline: None,
            failure: None,
        }
    }

    /// Move to `next`, rejecting moves the lifecycle does not allow.
    pub fn transition(&mut self, next: RunStatus) -> WardenResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(WardenError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.current_step = None;
        }
        self.status = next;
        Ok(())
    }

    /// Status of step `id`.
    pub fn step_status(&self, id: &str) -> Option<StepStatus> {
        self.steps.get(id).map(|s| s.status)
    }

    /// Pending steps whose dependencies are all COMPLETED or SKIPPED, in
    /// topological order.
    pub fn ready_steps(&self) -> Vec<String> {
        self.template
            .order
            .iter()
            .filter(|id| self.step_status(id) == Some(StepStatus::Pending))
            .filter(|id| {
                self.template.step(id).is_some_and(|spec| {
                    spec.depends_on
                        .iter()
                        .all(|d| self.step_status(d).is_some_and(StepStatus::satisfies_dependents))
                })
            })
            .cloned()
            .collect()
    }

    /// Steps currently RUNNING.
    pub fn running_steps(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    /// Whether every step is finished.
    pub fn all_steps_finished(&self) -> bool {
        self.steps.values().all(|s| s.status.is_finished())
    }

    /// Whether the deadline is at or before `now`.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// One attempt at running a step. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Execution id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Step that ran.
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outcome of the attempt.
    pub status: StepStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Failure message.
    #[serde(default)]
    pub error: Option<String>,
    /// Latest artifacts of the step's dependencies.
    #[serde(default)]
    pub input_artifacts: Vec<Uuid>,
    /// Artifact written on success.
    #[serde(default)]
    pub output_artifact: Option<Uuid>,
    /// The result arrived after the run had already reached a terminal state.
    #[serde(default)]
    pub after_cancellation: bool,
}
