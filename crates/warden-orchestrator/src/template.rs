use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;
use warden_core::{WardenError, WardenResult};

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Registered agent name (or legacy alias) that runs this step.
    pub agent: String,
    /// Merged into the step's execution context configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Step ids that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failed optional step is skipped instead of failing the run.
    #[serde(default)]
    pub optional: bool,
    /// Overrides the engine's retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Artifact name the step writes; defaults to the step id.
    #[serde(default)]
    pub output: Option<String>,
}

impl StepSpec {
    /// A required step run by `agent`.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            config: serde_json::Value::Null,
            depends_on: Vec::new(),
            optional: false,
            retry: None,
            output: None,
        }
    }

    /// Set the dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the step optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the step configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Set the output artifact name.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Caller-supplied template definition, validated into a [`WorkflowTemplate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Template name.
    pub name: String,
    /// Caller-assigned version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Steps keyed by id.
    pub steps: BTreeMap<String, StepSpec>,
}

fn default_version() -> u32 {
    1
}

impl TemplateSpec {
    /// Empty template spec at version 1.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            steps: BTreeMap::new(),
        }
    }

    /// Add a step.
    pub fn step(mut self, id: impl Into<String>, step: StepSpec) -> Self {
        self.steps.insert(id.into(), step);
        self
    }
}

/// A validated, immutable step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template id.
    pub id: Uuid,
    /// Template name.
    pub name: String,
    /// Caller-assigned version.
    pub version: u32,
    /// Steps keyed by id.
    pub steps: BTreeMap<String, StepSpec>,
    /// Deterministic topological order of the step ids.
    pub order: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    /// Validate the graph and cache its topological order.
    pub fn from_spec(spec: TemplateSpec) -> WardenResult<Self> {
        if spec.name.trim().is_empty() {
            return Err(WardenError::Validation("template name must not be empty".into()));
        }
        validate_steps(&spec.steps)?;
        if let Some(path) = find_cycle(&spec.steps) {
            return Err(WardenError::DagCycle { path });
        }
        let order = topological_order(&spec.steps);
        Ok(Self {
            id: Uuid::new_v4(),
            name: spec.name,
            version: spec.version,
            steps: spec.steps,
            order,
            created_at: Utc::now(),
        })
    }

    /// Spec of step `id`.
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.get(id)
    }

    /// Artifact name a step writes.
    pub fn artifact_name(&self, id: &str) -> String {
        self.steps
            .get(id)
            .and_then(|s| s.output.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Steps that list `id` as a dependency.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|s| {
                self.steps
                    .get(s.as_str())
                    .is_some_and(|step| step.depends_on.iter().any(|d| d == id))
            })
            .cloned()
            .collect()
    }
}

fn validate_steps(steps: &BTreeMap<String, StepSpec>) -> WardenResult<()> {
    if steps.is_empty() {
        return Err(WardenError::Validation("workflow has no steps".into()));
    }
    let mut outputs: HashMap<String, &str> = HashMap::new();
    for (id, step) in steps {
        if id.trim().is_empty() {
            return Err(WardenError::Validation("step id must not be empty".into()));
        }
        if step.agent.trim().is_empty() {
            return Err(WardenError::Validation(format!("step '{id}' has no agent type")));
        }
        for dep in &step.depends_on {
            if !steps.contains_key(dep) {
                return Err(WardenError::Validation(format!(
                    "step '{id}' depends on unknown step '{dep}'"
                )));
            }
        }
        let output = step.output.clone().unwrap_or_else(|| id.clone());
        if let Some(other) = outputs.insert(output.clone(), id) {
            return Err(WardenError::Validation(format!(
                "steps '{other}' and '{id}' both write artifact '{output}'"
            )));
        }
    }
    Ok(())
}

/// Three-colour DFS. Returns the offending path, first node repeated at the
/// end (`a -> b -> a`), or `None` for an acyclic graph.
pub fn find_cycle(steps: &BTreeMap<String, StepSpec>) -> Option<Vec<String>> {
    // 1 = on the current path, 2 = fully explored.
    let mut visited: HashMap<&str, u8> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();
    for id in steps.keys() {
        if let Some(cycle) = dfs_cycle(steps, id, &mut visited, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn dfs_cycle<'a>(
    steps: &'a BTreeMap<String, StepSpec>,
    id: &'a str,
    visited: &mut HashMap<&'a str, u8>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match visited.get(id) {
        Some(1) => {
            let start = path.iter().position(|s| *s == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        Some(2) => return None,
        _ => {}
    }
    visited.insert(id, 1);
    path.push(id);
    if let Some(step) = steps.get(id) {
        for dep in &step.depends_on {
            if let Some(cycle) = dfs_cycle(steps, dep, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    visited.insert(id, 2);
    None
}

/// Kahn's algorithm; among ready steps the smallest id goes first.
/// Assumes an acyclic graph with resolvable dependencies.
pub fn topological_order(steps: &BTreeMap<String, StepSpec>) -> Vec<String> {
    let mut indegree: HashMap<&str, usize> = steps
        .iter()
        .map(|(id, s)| (id.as_str(), s.depends_on.len()))
        .collect();
    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for (other, step) in steps {
            let count = step.depends_on.iter().filter(|d| *d == id).count();
            if count == 0 {
                continue;
            }
            if let Some(d) = indegree.get_mut(other.as_str()) {
                *d = d.saturating_sub(count);
                if *d == 0 {
                    ready.insert(other.as_str());
                }
            }
        }
    }
    order
}
