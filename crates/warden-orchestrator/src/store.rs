use crate::artifact::{Artifact, NewArtifact};
use crate::run::{StepExecution, WorkflowRun};
use crate::template::WorkflowTemplate;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use warden_core::{WardenError, WardenResult};

/// Persistence for templates, runs, execution history and artifacts.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a template.
    async fn save_template(&self, template: &WorkflowTemplate) -> WardenResult<()>;
    /// Fetch a template.
    async fn get_template(&self, id: Uuid) -> WardenResult<Option<WorkflowTemplate>>;
    /// All templates.
    async fn list_templates(&self) -> WardenResult<Vec<WorkflowTemplate>>;

    /// Insert or replace.
    async fn save_run(&self, run: &WorkflowRun) -> WardenResult<()>;
    /// Fetch a run.
    async fn get_run(&self, id: Uuid) -> WardenResult<Option<WorkflowRun>>;
    /// Ids of every stored run.
    async fn list_runs(&self) -> WardenResult<Vec<Uuid>>;

    /// Append to a run's execution history.
    async fn append_step_execution(&self, execution: &StepExecution) -> WardenResult<()>;
    /// In append order.
    async fn step_executions(&self, run_id: Uuid) -> WardenResult<Vec<StepExecution>>;

    /// Store the next version of `(run, name)` and make it the only latest one,
    /// as a single transaction.
    async fn write_artifact(&self, artifact: NewArtifact) -> WardenResult<Artifact>;
    /// `None` version reads the latest.
    async fn get_artifact(
        &self,
        run_id: Uuid,
        name: &str,
        version: Option<u32>,
    ) -> WardenResult<Option<Artifact>>;
    /// Every version of every artifact of a run, ordered by name then version.
    async fn list_artifacts(&self, run_id: Uuid) -> WardenResult<Vec<Artifact>>;
}

fn next_version(versions: &mut [Artifact], artifact: NewArtifact) -> WardenResult<Artifact> {
    let version = versions.iter().map(|a| a.version).max().unwrap_or(0) + 1;
    let created = artifact.into_artifact(version)?;
    for existing in versions.iter_mut() {
        existing.is_latest = false;
    }
    Ok(created)
}

fn pick_version(versions: &[Artifact], version: Option<u32>) -> Option<Artifact> {
    match version {
        Some(v) => versions.iter().find(|a| a.version == v).cloned(),
        None => versions.iter().find(|a| a.is_latest).cloned(),
    }
}

/// Volatile store for tests and short-lived processes.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    templates: RwLock<HashMap<Uuid, WorkflowTemplate>>,
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
    executions: RwLock<HashMap<Uuid, Vec<StepExecution>>>,
    artifacts: RwLock<HashMap<(Uuid, String), Vec<Artifact>>>,
}

impl InMemoryWorkflowStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_template(&self, template: &WorkflowTemplate) -> WardenResult<()> {
        self.templates
            .write()
            .await
            .insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> WardenResult<Option<WorkflowTemplate>> {
        Ok(self.templates.read().await.get(&id).cloned())
    }

    async fn list_templates(&self) -> WardenResult<Vec<WorkflowTemplate>> {
        let mut templates: Vec<_> = self.templates.read().await.values().cloned().collect();
        templates.sort_by_key(|t| t.created_at);
        Ok(templates)
    }

    async fn save_run(&self, run: &WorkflowRun) -> WardenResult<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> WardenResult<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_runs(&self) -> WardenResult<Vec<Uuid>> {
        Ok(self.runs.read().await.keys().copied().collect())
    }

    async fn append_step_execution(&self, execution: &StepExecution) -> WardenResult<()> {
        self.executions
            .write()
            .await
            .entry(execution.run_id)
            .or_default()
            .push(execution.clone());
        Ok(())
    }

    async fn step_executions(&self, run_id: Uuid) -> WardenResult<Vec<StepExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_artifact(&self, artifact: NewArtifact) -> WardenResult<Artifact> {
        let mut artifacts = self.artifacts.write().await;
        let versions = artifacts
            .entry((artifact.run_id, artifact.name.clone()))
            .or_default();
        let created = next_version(versions, artifact)?;
        versions.push(created.clone());
        Ok(created)
    }

    async fn get_artifact(
        &self,
        run_id: Uuid,
        name: &str,
        version: Option<u32>,
    ) -> WardenResult<Option<Artifact>> {
        let artifacts = self.artifacts.read().await;
        Ok(artifacts
            .get(&(run_id, name.to_string()))
            .and_then(|versions| pick_version(versions, version)))
    }

    async fn list_artifacts(&self, run_id: Uuid) -> WardenResult<Vec<Artifact>> {
        let artifacts = self.artifacts.read().await;
        let mut all: Vec<Artifact> = artifacts
            .iter()
            .filter(|((rid, _), _)| *rid == run_id)
            .flat_map(|(_, versions)| versions.iter().cloned())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(all)
    }
}

/// JSON-file store. Every write goes to a temporary file renamed into place.
///
/// Layout under the root directory:
/// `templates/{id}.json`, `runs/{id}.json`, `executions/{run}.json`,
/// `artifacts/{run}/{hex(name)}.json` (all versions of one artifact).
pub struct JsonFileWorkflowStore {
    root: PathBuf,
    // Serializes read-modify-write of execution and artifact files.
    write_lock: Mutex<()>,
}

impl JsonFileWorkflowStore {
    /// Open a store at `root`, creating its directories.
    pub async fn new(root: PathBuf) -> WardenResult<Self> {
        for sub in ["templates", "runs", "executions", "artifacts"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn template_path(&self, id: Uuid) -> PathBuf {
        self.root.join("templates").join(format!("{id}.json"))
    }

    fn run_path(&self, id: Uuid) -> PathBuf {
        self.root.join("runs").join(format!("{id}.json"))
    }

    fn executions_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join("executions").join(format!("{run_id}.json"))
    }

    fn artifact_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("artifacts").join(run_id.to_string())
    }

    fn artifact_path(&self, run_id: Uuid, name: &str) -> PathBuf {
        self.artifact_dir(run_id)
            .join(format!("{}.json", hex::encode(name.as_bytes())))
    }
}

async fn write_json_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> WardenResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    tokio::fs::write(&tmp, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> WardenResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            WardenError::Persistence(format!("Failed to parse {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> WardenResult<Vec<T>> {
    let mut items = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(item) = read_json(&path).await? {
            items.push(item);
        }
    }
    Ok(items)
}

#[async_trait]
impl WorkflowStore for JsonFileWorkflowStore {
    async fn save_template(&self, template: &WorkflowTemplate) -> WardenResult<()> {
        write_json_atomic(&self.template_path(template.id), template).await
    }

    async fn get_template(&self, id: Uuid) -> WardenResult<Option<WorkflowTemplate>> {
        read_json(&self.template_path(id)).await
    }

    async fn list_templates(&self) -> WardenResult<Vec<WorkflowTemplate>> {
        let mut templates: Vec<WorkflowTemplate> =
            read_json_dir(&self.root.join("templates")).await?;
        templates.sort_by_key(|t| t.created_at);
        Ok(templates)
    }

    async fn save_run(&self, run: &WorkflowRun) -> WardenResult<()> {
        write_json_atomic(&self.run_path(run.id), run).await
    }

    async fn get_run(&self, id: Uuid) -> WardenResult<Option<WorkflowRun>> {
        read_json(&self.run_path(id)).await
    }

    async fn list_runs(&self) -> WardenResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(self.root.join("runs")).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn append_step_execution(&self, execution: &StepExecution) -> WardenResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.executions_path(execution.run_id);
        let mut all: Vec<StepExecution> = read_json(&path).await?.unwrap_or_default();
        all.push(execution.clone());
        write_json_atomic(&path, &all).await
    }

    async fn step_executions(&self, run_id: Uuid) -> WardenResult<Vec<StepExecution>> {
        Ok(read_json(&self.executions_path(run_id))
            .await?
            .unwrap_or_default())
    }

    async fn write_artifact(&self, artifact: NewArtifact) -> WardenResult<Artifact> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(self.artifact_dir(artifact.run_id)).await?;
        let path = self.artifact_path(artifact.run_id, &artifact.name);
        let mut versions: Vec<Artifact> = read_json(&path).await?.unwrap_or_default();
        let created = next_version(&mut versions, artifact)?;
        versions.push(created.clone());
        write_json_atomic(&path, &versions).await?;
        Ok(created)
    }

    async fn get_artifact(
        &self,
        run_id: Uuid,
        name: &str,
        version: Option<u32>,
    ) -> WardenResult<Option<Artifact>> {
        let versions: Vec<Artifact> = read_json(&self.artifact_path(run_id, name))
            .await?
            .unwrap_or_default();
        Ok(pick_version(&versions, version))
    }

    async fn list_artifacts(&self, run_id: Uuid) -> WardenResult<Vec<Artifact>> {
        let groups: Vec<Vec<Artifact>> = read_json_dir(&self.artifact_dir(run_id)).await?;
        let mut all: Vec<Artifact> = groups.into_iter().flatten().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(all)
    }
}
