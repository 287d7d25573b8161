use crate::mode::ExecutionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::{Finding, FindingCategory, RiskLevel};

/// Version of the aggregated result document shape.
pub const RESULT_SCHEMA_VERSION: &str = "2.0";

/// Count of findings per severity. Always carries all four buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityHistogram {
    /// Critical findings.
    pub critical: u64,
    /// High findings.
    pub high: u64,
    /// Medium findings.
    pub medium: u64,
    /// Low findings.
    pub low: u64,
}

impl SeverityHistogram {
    /// Count the severities of `findings`.
    pub fn from_findings<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut histogram = Self::default();
        for finding in findings {
            histogram.add(finding.severity());
        }
        histogram
    }

    /// Count one finding of `level`.
    pub fn add(&mut self, level: RiskLevel) {
        match level {
            RiskLevel::Critical => self.critical += 1,
            RiskLevel::High => self.high += 1,
            RiskLevel::Medium => self.medium += 1,
            RiskLevel::Low => self.low += 1,
        }
    }

    /// Sum of all buckets.
    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low
    }

    /// Buckets as `[critical, high, medium, low]`.
    pub fn as_array(&self) -> [u64; 4] {
        [self.critical, self.high, self.medium, self.low]
    }
}

/// How one agent fared in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    /// Ran and returned findings.
    Succeeded,
    /// Errored or timed out.
    Failed,
    /// Requirements not met by the context.
    Skipped,
}

/// Per-agent provenance entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProvenance {
    /// Agent name.
    pub agent: String,
    /// Agent version.
    pub version: String,
    /// How the agent fared.
    pub status: AgentRunStatus,
    /// Findings kept after validation.
    pub findings: usize,
    /// Wall-clock time of the call.
    pub duration_ms: u64,
    /// Failure or skip reason.
    #[serde(default)]
    pub error: Option<String>,
}

/// Why a direct run was replaced by the legacy result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackInfo {
    /// Error that triggered the fallback.
    pub reason: String,
    /// When the fallback happened.
    pub at: DateTime<Utc>,
}

/// Aggregate metadata for an [`AnalysisResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Findings per severity.
    pub severity_histogram: SeverityHistogram,
    /// One entry per agent considered.
    pub agents: Vec<AgentProvenance>,
    /// Mode that produced the result.
    pub mode: ExecutionMode,
    /// Set when the legacy result replaced a failed direct run.
    #[serde(default)]
    pub fallback: Option<FallbackInfo>,
    /// Secrets redacted across all findings.
    #[serde(default)]
    pub redactions: usize,
    /// Near-duplicates removed.
    #[serde(default)]
    pub duplicates_removed: usize,
    /// Assembly time.
    pub generated_at: DateTime<Utc>,
}

/// Fixed-shape aggregate returned by every execution mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Document schema version.
    pub schema_version: String,
    /// Threat findings.
    pub threats: Vec<Finding>,
    /// Vulnerability findings.
    pub vulnerabilities: Vec<Finding>,
    /// Compliance findings.
    pub compliance: Vec<Finding>,
    /// Findings across all categories.
    pub total_count: usize,
    /// Aggregate metadata.
    pub summary: ResultSummary,
}

impl AnalysisResult {
    /// Bucket findings by category, keeping their relative order.
    pub fn from_findings(
        findings: Vec<Finding>,
        agents: Vec<AgentProvenance>,
        mode: ExecutionMode,
    ) -> Self {
        let severity_histogram = SeverityHistogram::from_findings(&findings);
        let total_count = findings.len();
        let mut threats = Vec::new();
        let mut vulnerabilities = Vec::new();
        let mut compliance = Vec::new();
        for finding in findings {
            match finding.category {
                FindingCategory::Threat => threats.push(finding),
                FindingCategory::Vulnerability => vulnerabilities.push(finding),
                FindingCategory::Compliance => compliance.push(finding),
            }
        }
        Self {
            schema_version: RESULT_SCHEMA_VERSION.to_string(),
            threats,
            vulnerabilities,
            compliance,
            total_count,
            summary: ResultSummary {
                severity_histogram,
                agents,
                mode,
                fallback: None,
                redactions: 0,
                duplicates_removed: 0,
                generated_at: Utc::now(),
            },
        }
    }

    /// Mark as a fallback result.
    pub fn with_fallback(mut self, reason: impl Into<String>) -> Self {
        self.summary.fallback = Some(FallbackInfo {
            reason: reason.into(),
            at: Utc::now(),
        });
        self
    }

    /// Set the reported mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.summary.mode = mode;
        self
    }

    /// Whether the legacy result replaced a failed direct run.
    pub fn is_fallback(&self) -> bool {
        self.summary.fallback.is_some()
    }

    /// All findings, threats first.
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.threats
            .iter()
            .chain(&self.vulnerabilities)
            .chain(&self.compliance)
    }

    /// Names of agents that produced output.
    pub fn succeeded_agents(&self) -> Vec<String> {
        self.summary
            .agents
            .iter()
            .filter(|a| a.status == AgentRunStatus::Succeeded)
            .map(|a| a.agent.clone())
            .collect()
    }

    /// Serialize as the external JSON document.
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn finding(id: &str, category: FindingCategory, impact: RiskLevel) -> Finding {
        Finding::new(id, id, "description text", category, "test").with_risk(impact, RiskLevel::Low)
    }

    #[test]
    fn test_buckets_and_histogram() {
        let result = AnalysisResult::from_findings(
            vec![
                finding("a", FindingCategory::Threat, RiskLevel::High),
                finding("b", FindingCategory::Compliance, RiskLevel::Low),
                finding("c", FindingCategory::Threat, RiskLevel::Critical),
                finding("d", FindingCategory::Vulnerability, RiskLevel::High),
            ],
            vec![],
            ExecutionMode::Direct,
        );
        assert_eq!(result.threats.len(), 2);
        assert_eq!(result.vulnerabilities.len(), 1);
        assert_eq!(result.compliance.len(), 1);
        assert_eq!(result.total_count, 4);
        assert_eq!(result.summary.severity_histogram.as_array(), [1, 2, 0, 1]);
        let ids: Vec<&str> = result.findings().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "d", "b"]);
    }

    #[test]
    fn test_empty_result_has_full_shape() {
        let doc = AnalysisResult::from_findings(vec![], vec![], ExecutionMode::Legacy).to_document();
        assert_eq!(doc["schema_version"], RESULT_SCHEMA_VERSION);
        assert_eq!(doc["threats"], serde_json::json!([]));
        assert_eq!(doc["total_count"], 0);
        assert_eq!(doc["summary"]["severity_histogram"]["critical"], 0);
        assert_eq!(doc["summary"]["mode"], "legacy");
        assert!(doc["summary"]["fallback"].is_null());
    }

    #[test]
    fn test_fallback_marker() {
        let result = AnalysisResult::from_findings(vec![], vec![], ExecutionMode::Legacy)
            .with_mode(ExecutionMode::DirectWithFallback)
            .with_fallback("all agents failed");
        assert!(result.is_fallback());
        assert_eq!(result.summary.mode, ExecutionMode::DirectWithFallback);
    }
}
