use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use warden_core::{Finding, WardenResult};

/// Kind recorded for artifacts holding step findings.
pub const FINDINGS_KIND: &str = "findings";

/// A versioned, immutable step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Logical name shared by every version.
    pub name: String,
    /// Content kind, `findings` for step outputs.
    pub kind: String,
    /// Monotonic per (run, name), starting at 1.
    pub version: u32,
    /// Whether this is the newest version of its name.
    pub is_latest: bool,
    /// Stored JSON payload.
    pub content: serde_json::Value,
    /// SHA-256 hex digest of the serialized content.
    pub hash: String,
    /// Length of the serialized content.
    pub size_bytes: usize,
    /// Step that produced the artifact, if any.
    #[serde(default)]
    pub step_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Findings stored under a `findings` array, if any.
    pub fn findings(&self) -> Vec<Finding> {
        self.content
            .get("findings")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Whether the stored hash still matches the content.
    pub fn verify(&self) -> bool {
        content_digest(&self.content)
            .map(|(hash, _)| hash == self.hash)
            .unwrap_or(false)
    }
}

/// Artifact contents before the store assigns id, version and hash.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Owning run.
    pub run_id: Uuid,
    /// Logical artifact name.
    pub name: String,
    /// Content kind.
    pub kind: String,
    /// JSON payload.
    pub content: serde_json::Value,
    /// Producing step.
    pub step_id: Option<String>,
}

impl NewArtifact {
    /// A `findings` artifact with no producing step.
    pub fn new(run_id: Uuid, name: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            run_id,
            name: name.into(),
            kind: FINDINGS_KIND.to_string(),
            content,
            step_id: None,
        }
    }

    /// Override the content kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Record the producing step.
    pub fn from_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Materialize as `version`, marked latest.
    pub fn into_artifact(self, version: u32) -> WardenResult<Artifact> {
        let (hash, size_bytes) = content_digest(&self.content)?;
        Ok(Artifact {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            name: self.name,
            kind: self.kind,
            version,
            is_latest: true,
            content: self.content,
            hash,
            size_bytes,
            step_id: self.step_id,
            created_at: Utc::now(),
        })
    }
}

/// SHA-256 hex digest and byte length of the canonical JSON serialization.
pub fn content_digest(content: &serde_json::Value) -> WardenResult<(String, usize)> {
    let bytes = serde_json::to_vec(content)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((hex::encode(hasher.finalize()), bytes.len()))
}
