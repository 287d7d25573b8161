use crate::error::{WardenError, WardenResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Impact or likelihood rating of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Unlikely or minor.
    Low,
    /// Plausible with moderate effect.
    Medium,
    /// Likely or serious.
    High,
    /// Needs immediate attention.
    Critical,
}

impl RiskLevel {
    /// Lenient parse used on model output; unknown values map to `Medium`.
    pub fn parse_level(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" | "minor" | "info" | "informational" => RiskLevel::Low,
            "medium" | "moderate" => RiskLevel::Medium,
            "high" | "major" => RiskLevel::High,
            "critical" | "severe" => RiskLevel::Critical,
            _ => RiskLevel::Medium,
        }
    }

    /// Numeric weight (1–4) used for ranking.
    pub fn weight(self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
            RiskLevel::Critical => 4,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Result bucket a finding is aggregated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingCategory {
    /// A threat against the system.
    Threat,
    /// A weakness in the implementation.
    Vulnerability,
    /// A gap against a standard or regulation.
    Compliance,
}

impl FindingCategory {
    /// Lenient parse used on model output; unknown values map to `Threat`.
    pub fn parse_category(s: &str) -> Self {
        let lower = s.trim().to_lowercase();
        if lower.starts_with("vuln") || lower == "weakness" {
            FindingCategory::Vulnerability
        } else if lower.starts_with("compliance") || lower == "regulatory" || lower == "policy" {
            FindingCategory::Compliance
        } else {
            FindingCategory::Threat
        }
    }
}

impl std::fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingCategory::Threat => write!(f, "threat"),
            FindingCategory::Vulnerability => write!(f, "vulnerability"),
            FindingCategory::Compliance => write!(f, "compliance"),
        }
    }
}

/// A structured analysis result produced by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Identifier, unique within one agent's output.
    pub id: String,
    /// Short title.
    pub title: String,
    /// Full description.
    pub description: String,
    /// Result bucket the finding is aggregated into.
    pub category: FindingCategory,
    /// Free-form classification, e.g. a STRIDE label.
    #[serde(default)]
    pub classification: Option<String>,
    /// Affected component, used for duplicate detection.
    #[serde(default)]
    pub component: Option<String>,
    /// Impact rating; also the histogram severity.
    pub impact: RiskLevel,
    /// Likelihood rating.
    pub likelihood: RiskLevel,
    /// Suggested mitigation, possibly empty.
    #[serde(default)]
    pub mitigation: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    /// Agent that produced the finding.
    pub source_agent: String,
    /// When the finding was created.
    pub generated_at: DateTime<Utc>,
}

impl Finding {
    /// Create a finding with medium risk and confidence 0.5.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        category: FindingCategory,
        source_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            category,
            classification: None,
            component: None,
            impact: RiskLevel::Medium,
            likelihood: RiskLevel::Medium,
            mitigation: String::new(),
            confidence: 0.5,
            source_agent: source_agent.into(),
            generated_at: Utc::now(),
        }
    }

    /// Set the free-form classification.
    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    /// Set the affected component.
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Set impact and likelihood.
    pub fn with_risk(mut self, impact: RiskLevel, likelihood: RiskLevel) -> Self {
        self.impact = impact;
        self.likelihood = likelihood;
        self
    }

    /// Set the mitigation.
    pub fn with_mitigation(mut self, mitigation: impl Into<String>) -> Self {
        self.mitigation = mitigation.into();
        self
    }

    /// Set the confidence, clamped to `[0, 1]`. NaN becomes 0.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    /// Severity used for histograms.
    pub fn severity(&self) -> RiskLevel {
        self.impact
    }

    /// Combined impact × likelihood score (1–16).
    pub fn risk_score(&self) -> u8 {
        self.impact.weight() * self.likelihood.weight()
    }
}

/// Shape of a single finding as emitted by a language model.
#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "type")]
    category: Option<String>,
    #[serde(default, alias = "stride")]
    classification: Option<String>,
    #[serde(default, alias = "affected_component")]
    component: Option<String>,
    #[serde(default, alias = "severity")]
    impact: Option<String>,
    #[serde(default)]
    likelihood: Option<String>,
    #[serde(default, alias = "recommendation")]
    mitigation: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Extract findings from raw model output.
///
/// Accepts a bare JSON array, an object carrying the array under `findings`,
/// `threats` or `results`, and either form wrapped in a fenced code block or
/// surrounded by prose.
pub fn parse_findings(text: &str, source_agent: &str) -> WardenResult<Vec<Finding>> {
    let value = extract_json(text).ok_or_else(|| {
        WardenError::Validation(format!("No JSON findings in output of agent '{source_agent}'"))
    })?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => {
            let key = ["findings", "threats", "results"]
                .into_iter()
                .find(|k| map.get(*k).is_some_and(serde_json::Value::is_array));
            match key.and_then(|k| map.remove(k)) {
                Some(serde_json::Value::Array(items)) => items,
                _ => {
                    return Err(WardenError::Validation(format!(
                        "Output of agent '{source_agent}' has no findings array"
                    )))
                }
            }
        }
        _ => {
            return Err(WardenError::Validation(format!(
                "Output of agent '{source_agent}' is not a findings document"
            )))
        }
    };

    let mut findings = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let raw: RawFinding = serde_json::from_value(item)?;
        if raw.title.trim().is_empty() && raw.description.trim().is_empty() {
            debug!(agent = source_agent, index = idx, "Dropping empty finding");
            continue;
        }
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{source_agent}-{}", idx + 1));
        let title = if raw.title.trim().is_empty() {
            raw.description.chars().take(80).collect()
        } else {
            raw.title
        };
        let category = raw
            .category
            .as_deref()
            .map_or(FindingCategory::Threat, FindingCategory::parse_category);

        let mut finding = Finding::new(id, title, raw.description, category, source_agent)
            .with_risk(
                raw.impact.as_deref().map_or(RiskLevel::Medium, RiskLevel::parse_level),
                raw.likelihood.as_deref().map_or(RiskLevel::Medium, RiskLevel::parse_level),
            )
            .with_mitigation(raw.mitigation.unwrap_or_default())
            .with_confidence(raw.confidence.unwrap_or(0.5));
        finding.classification = raw.classification;
        finding.component = raw.component;
        findings.push(finding);
    }
    debug!(agent = source_agent, count = findings.len(), "Parsed findings");
    Ok(findings)
}

fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    // ```json ... ``` fences
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map_or(0, |i| i + 1);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(v) = serde_json::from_str(body[..end].trim()) {
                return Some(v);
            }
        }
    }

    // Outermost bracket pair embedded in prose
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(s), Some(e)) = (trimmed.find(open), trimmed.rfind(close)) {
            if s < e {
                if let Ok(v) = serde_json::from_str(&trimmed[s..=e]) {
                    return Some(v);
                }
            }
        }
    }
    None
}
