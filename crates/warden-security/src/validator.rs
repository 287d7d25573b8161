use crate::sanitizer::Sanitizer;
use crate::similarity::similarity_ratio;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, warn};
use warden_core::{ExecutionContext, Finding};

/// Result buckets every analysis result document must carry.
pub const RESULT_BUCKETS: [&str; 3] = ["threats", "vulnerabilities", "compliance"];

/// Severity histogram keys every analysis result document must carry.
pub const HISTOGRAM_KEYS: [&str; 4] = ["critical", "high", "medium", "low"];

/// How aggressively inputs and outputs are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Structural checks only.
    Minimal,
    /// Structural, quality, duplicate and safety checks.
    #[default]
    Standard,
    /// Standard checks with tighter bounds and a confidence floor.
    Strict,
    /// Tightest bounds; prompt-injection markers rejected, warnings escalate to errors.
    Paranoid,
}

impl Strictness {
    /// Thresholds and enabled checks for this level.
    pub fn rules(self) -> ValidationRules {
        match self {
            Strictness::Minimal => ValidationRules {
                max_input_chars: 1_000_000,
                max_structured_bytes: 5 * 1024 * 1024,
                max_title_chars: 1_000,
                description_chars: (1, 100_000),
                mitigation_chars: (0, 100_000),
                min_confidence: 0.0,
                duplicate_threshold: 0.7,
                max_findings: 10_000,
                quality_checks: false,
                safety_checks: false,
                duplicate_checks: false,
                injection_checks: false,
                warnings_are_errors: false,
            },
            Strictness::Standard => ValidationRules {
                max_input_chars: 500_000,
                max_structured_bytes: 2 * 1024 * 1024,
                max_title_chars: 300,
                description_chars: (10, 5_000),
                mitigation_chars: (0, 5_000),
                min_confidence: 0.0,
                duplicate_threshold: 0.7,
                max_findings: 1_000,
                quality_checks: true,
                safety_checks: true,
                duplicate_checks: true,
                injection_checks: false,
                warnings_are_errors: false,
            },
            Strictness::Strict => ValidationRules {
                max_input_chars: 200_000,
                max_structured_bytes: 1024 * 1024,
                max_title_chars: 200,
                description_chars: (20, 3_000),
                mitigation_chars: (10, 3_000),
                min_confidence: 0.3,
                duplicate_threshold: 0.7,
                max_findings: 500,
                quality_checks: true,
                safety_checks: true,
                duplicate_checks: true,
                injection_checks: false,
                warnings_are_errors: false,
            },
            Strictness::Paranoid => ValidationRules {
                max_input_chars: 100_000,
                max_structured_bytes: 512 * 1024,
                max_title_chars: 150,
                description_chars: (30, 2_000),
                mitigation_chars: (20, 2_000),
                min_confidence: 0.5,
                duplicate_threshold: 0.7,
                max_findings: 200,
                quality_checks: true,
                safety_checks: true,
                duplicate_checks: true,
                injection_checks: true,
                warnings_are_errors: true,
            },
        }
    }
}

impl std::str::FromStr for Strictness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Ok(Strictness::Minimal),
            "standard" => Ok(Strictness::Standard),
            "strict" => Ok(Strictness::Strict),
            "paranoid" => Ok(Strictness::Paranoid),
            other => Err(format!("unknown strictness '{other}'")),
        }
    }
}

/// Thresholds derived from a [`Strictness`] level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRules {
    /// Longest accepted input text, in characters.
    pub max_input_chars: usize,
    /// Largest accepted structured input, in serialized bytes.
    pub max_structured_bytes: usize,
    /// Longest accepted finding title.
    pub max_title_chars: usize,
    /// Inclusive `(min, max)` character bounds.
    pub description_chars: (usize, usize),
    /// Inclusive `(min, max)` character bounds.
    pub mitigation_chars: (usize, usize),
    /// Findings below this confidence are rejected.
    pub min_confidence: f64,
    /// Similarity at or above which two findings are duplicates.
    pub duplicate_threshold: f64,
    /// Findings kept per validation pass.
    pub max_findings: usize,
    /// Check description and mitigation lengths.
    pub quality_checks: bool,
    /// Redact credential-like strings.
    pub safety_checks: bool,
    /// Remove near-duplicate findings.
    pub duplicate_checks: bool,
    /// Reject prompt-injection markers in input.
    pub injection_checks: bool,
    /// Escalate every warning to an error.
    pub warnings_are_errors: bool,
}

/// Which family of checks raised an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// Required fields and bounds.
    Structural,
    /// Text length and confidence.
    Quality,
    /// Near-duplicate findings.
    Duplicate,
    /// Secrets and prompt injection.
    Safety,
}

/// A single validation problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Check family that raised the issue.
    pub check: CheckKind,
    /// Finding id or field name the issue is about.
    pub subject: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationIssue {
    fn new(check: CheckKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Issues that fail validation.
    pub errors: Vec<ValidationIssue>,
    /// Issues that are only reported.
    pub warnings: Vec<ValidationIssue>,
    /// Secrets replaced during the pass.
    pub redactions: usize,
    /// Near-duplicates removed during the pass.
    pub duplicates_removed: usize,
}

impl ValidationReport {
    /// Whether no errors were raised.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// One-line summary of the errors, for error messages.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|i| format!("{}: {}", i.subject, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.redactions += other.redactions;
        self.duplicates_removed += other.duplicates_removed;
    }
}

/// Findings that survived validation, plus the report.
#[derive(Debug, Clone)]
pub struct FindingValidation {
    /// Findings that passed, redacted and deduplicated.
    pub findings: Vec<Finding>,
    /// What was rejected, redacted or removed.
    pub report: ValidationReport,
}

fn injection_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)ignore\s+(all\s+)?(the\s+)?(previous|prior|above)\s+instructions",
            r"(?i)disregard\s+(all\s+)?(the\s+)?(previous|prior|above)",
            r"(?i)you\s+are\s+now\s+(a|an|in)\b",
            r"(?i)reveal\s+(your|the)\s+system\s+prompt",
            r"(?i)</?\s*system\s*>",
        ]
        .into_iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Structural, quality, and safety checks on agent inputs and outputs.
pub struct Validator {
    strictness: Strictness,
    rules: ValidationRules,
    sanitizer: Sanitizer,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Strictness::default())
    }
}

impl Validator {
    /// Create a validator with the rules of `strictness`.
    pub fn new(strictness: Strictness) -> Self {
        let rules = strictness.rules();
        Self {
            strictness,
            sanitizer: Sanitizer::new(rules.max_input_chars.saturating_mul(4)),
            rules,
        }
    }

    /// Override individual thresholds while keeping the level's name.
    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = rules;
        self
    }

    /// Configured level.
    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    /// Active thresholds.
    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Sanitizer used for redaction.
    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Check an execution context before any agent sees it.
    pub fn validate_input(&self, ctx: &ExecutionContext) -> ValidationReport {
        let mut report = ValidationReport::default();

        if !ctx.has_document() && !ctx.has_structured_input() {
            report.errors.push(ValidationIssue::new(
                CheckKind::Structural,
                "input",
                "context has neither input text nor structured input",
            ));
        }

        if let Some(text) = &ctx.input_text {
            let chars = text.chars().count();
            if chars > self.rules.max_input_chars {
                report.errors.push(ValidationIssue::new(
                    CheckKind::Structural,
                    "input_text",
                    format!("{chars} characters exceeds limit of {}", self.rules.max_input_chars),
                ));
            }
            if self.sanitizer.sanitize(text).is_rejected() {
                report.errors.push(ValidationIssue::new(
                    CheckKind::Structural,
                    "input_text",
                    "input text rejected by sanitizer",
                ));
            }
            if self.rules.injection_checks {
                for pattern in injection_patterns() {
                    if let Some(m) = pattern.find(text) {
                        report.errors.push(ValidationIssue::new(
                            CheckKind::Safety,
                            "input_text",
                            format!("prompt-injection marker: '{}'", m.as_str()),
                        ));
                    }
                }
            }
            if self.rules.safety_checks && self.sanitizer.contains_secret(text) {
                self.push_warning(
                    &mut report,
                    ValidationIssue::new(
                        CheckKind::Safety,
                        "input_text",
                        format!(
                            "credential-like content ({})",
                            self.sanitizer.matching_rules(text).join(", ")
                        ),
                    ),
                );
            }
        }

        if let Some(structured) = &ctx.structured_input {
            let size = serde_json::to_vec(structured).map(|v| v.len()).unwrap_or(0);
            if size > self.rules.max_structured_bytes {
                report.errors.push(ValidationIssue::new(
                    CheckKind::Structural,
                    "structured_input",
                    format!("{size} bytes exceeds limit of {}", self.rules.max_structured_bytes),
                ));
            }
        }

        report
    }

    /// Copy of the context with secrets redacted from every free-text field.
    /// Returns the context unchanged when safety checks are off.
    pub fn sanitize_context(&self, ctx: &ExecutionContext) -> ExecutionContext {
        if !self.rules.safety_checks {
            return ctx.clone();
        }
        let mut out = ctx.clone();
        out.input_text = ctx.input_text.as_deref().map(|t| self.sanitizer.redact(t));
        out.structured_input = ctx
            .structured_input
            .as_ref()
            .map(|v| self.sanitizer.redact_value(v));
        out.prior_findings = ctx
            .prior_findings
            .iter()
            .map(|f| self.redact_finding(f).0)
            .collect();
        out
    }

    /// Validate, redact and de-duplicate agent findings.
    ///
    /// Findings failing structural checks are dropped and reported as errors;
    /// the remaining findings are always returned so one bad finding never
    /// discards an agent's whole output.
    pub fn validate_findings(&self, findings: Vec<Finding>) -> FindingValidation {
        let mut report = ValidationReport::default();
        let mut kept = Vec::with_capacity(findings.len());

        for finding in findings {
            let mut issues = ValidationReport::default();
            self.check_structure(&finding, &mut issues);
            if !issues.is_valid() {
                report.merge(issues);
                continue;
            }
            if self.rules.quality_checks {
                self.check_quality(&finding, &mut issues);
            }
            let rejected = !issues.is_valid();
            report.merge(issues);
            if rejected {
                continue;
            }

            if self.rules.safety_checks {
                let (redacted, hits) = self.redact_finding(&finding);
                if hits > 0 {
                    report.redactions += hits;
                    report.warnings.push(ValidationIssue::new(
                        CheckKind::Safety,
                        &finding.id,
                        format!("{hits} credential-like value(s) redacted"),
                    ));
                }
                kept.push(redacted);
            } else {
                kept.push(finding);
            }
        }

        if self.rules.duplicate_checks {
            let before = kept.len();
            kept = self.deduplicate(kept, &mut report);
            report.duplicates_removed = before - kept.len();
        }

        if kept.len() > self.rules.max_findings {
            report.warnings.push(ValidationIssue::new(
                CheckKind::Structural,
                "findings",
                format!(
                    "{} findings truncated to limit of {}",
                    kept.len(),
                    self.rules.max_findings
                ),
            ));
            kept.truncate(self.rules.max_findings);
        }

        debug!(
            kept = kept.len(),
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            redactions = report.redactions,
            "Findings validated"
        );

        FindingValidation {
            findings: kept,
            report,
        }
    }

    /// Check that a serialized analysis result has the stable result shape.
    pub fn validate_result_document(&self, doc: &serde_json::Value) -> ValidationReport {
        let mut report = ValidationReport::default();
        let Some(obj) = doc.as_object() else {
            report.errors.push(ValidationIssue::new(
                CheckKind::Structural,
                "document",
                "result document is not an object",
            ));
            return report;
        };

        if !obj.get("schema_version").is_some_and(serde_json::Value::is_string) {
            report.errors.push(ValidationIssue::new(
                CheckKind::Structural,
                "schema_version",
                "missing or not a string",
            ));
        }

        let mut bucket_total = 0usize;
        for bucket in RESULT_BUCKETS {
            match obj.get(bucket).and_then(serde_json::Value::as_array) {
                Some(items) => bucket_total += items.len(),
                None => report.errors.push(ValidationIssue::new(
                    CheckKind::Structural,
                    bucket,
                    "missing or not an array",
                )),
            }
        }

        match obj.get("total_count").and_then(serde_json::Value::as_u64) {
            Some(total) if total as usize == bucket_total => {}
            Some(total) => report.errors.push(ValidationIssue::new(
                CheckKind::Structural,
                "total_count",
                format!("{total} does not match {bucket_total} findings in buckets"),
            )),
            None => report.errors.push(ValidationIssue::new(
                CheckKind::Structural,
                "total_count",
                "missing or not a non-negative integer",
            )),
        }

        match obj
            .get("summary")
            .and_then(|s| s.get("severity_histogram"))
            .and_then(serde_json::Value::as_object)
        {
            Some(histogram) => {
                for key in HISTOGRAM_KEYS {
                    if !histogram.get(key).is_some_and(serde_json::Value::is_u64) {
                        report.errors.push(ValidationIssue::new(
                            CheckKind::Structural,
                            format!("summary.severity_histogram.{key}"),
                            "missing or not a count",
                        ));
                    }
                }
            }
            None => report.errors.push(ValidationIssue::new(
                CheckKind::Structural,
                "summary.severity_histogram",
                "missing or not an object",
            )),
        }

        report
    }

    fn check_structure(&self, finding: &Finding, report: &mut ValidationReport) {
        let subject = if finding.id.trim().is_empty() {
            "<unnamed>".to_string()
        } else {
            finding.id.clone()
        };
        let mut fail = |msg: &str| {
            report
                .errors
                .push(ValidationIssue::new(CheckKind::Structural, &subject, msg));
        };
        if finding.id.trim().is_empty() {
            fail("missing id");
        }
        if finding.title.trim().is_empty() {
            fail("missing title");
        }
        if finding.description.trim().is_empty() {
            fail("missing description");
        }
        if finding.source_agent.trim().is_empty() {
            fail("missing source agent");
        }
        if !(0.0..=1.0).contains(&finding.confidence) {
            fail("confidence outside [0, 1]");
        }
    }

    fn check_quality(&self, finding: &Finding, report: &mut ValidationReport) {
        let title_len = finding.title.chars().count();
        if title_len > self.rules.max_title_chars {
            self.push_warning(
                report,
                ValidationIssue::new(
                    CheckKind::Quality,
                    &finding.id,
                    format!("title has {title_len} characters (max {})", self.rules.max_title_chars),
                ),
            );
        }

        let (min, max) = self.rules.description_chars;
        let len = finding.description.trim().chars().count();
        if len < min || len > max {
            self.push_warning(
                report,
                ValidationIssue::new(
                    CheckKind::Quality,
                    &finding.id,
                    format!("description has {len} characters (expected {min}..={max})"),
                ),
            );
        }

        let (min, max) = self.rules.mitigation_chars;
        let len = finding.mitigation.trim().chars().count();
        if len < min || len > max {
            self.push_warning(
                report,
                ValidationIssue::new(
                    CheckKind::Quality,
                    &finding.id,
                    format!("mitigation has {len} characters (expected {min}..={max})"),
                ),
            );
        }

        if finding.confidence < self.rules.min_confidence {
            report.errors.push(ValidationIssue::new(
                CheckKind::Quality,
                &finding.id,
                format!(
                    "confidence {:.2} below floor {:.2}",
                    finding.confidence, self.rules.min_confidence
                ),
            ));
        }
    }

    fn push_warning(&self, report: &mut ValidationReport, issue: ValidationIssue) {
        if self.rules.warnings_are_errors {
            report.errors.push(issue);
        } else {
            report.warnings.push(issue);
        }
    }

    fn redact_finding(&self, finding: &Finding) -> (Finding, usize) {
        let mut hits = 0;
        let mut redact = |text: &str| {
            let (out, n) = self.sanitizer.redact_counting(text);
            hits += n;
            out
        };
        let mut out = finding.clone();
        out.title = redact(&finding.title);
        out.description = redact(&finding.description);
        out.mitigation = redact(&finding.mitigation);
        out.component = finding.component.as_deref().map(&mut redact);
        out.classification = finding.classification.as_deref().map(&mut redact);
        (out, hits)
    }

    /// Remove near-duplicates among findings sharing component and category,
    /// keeping the higher-impact one (then higher confidence, then earlier).
    fn deduplicate(&self, findings: Vec<Finding>, report: &mut ValidationReport) -> Vec<Finding> {
        let mut kept: Vec<Finding> = Vec::with_capacity(findings.len());
        for candidate in findings {
            let duplicate_of = kept.iter().position(|existing| {
                existing.category == candidate.category
                    && normalized_component(existing) == normalized_component(&candidate)
                    && similarity_ratio(
                        &format!("{} {}", existing.title, existing.description),
                        &format!("{} {}", candidate.title, candidate.description),
                    ) >= self.rules.duplicate_threshold
            });
            match duplicate_of {
                Some(idx) => {
                    let existing = &kept[idx];
                    let replace = (candidate.impact, confidence_key(&candidate))
                        > (existing.impact, confidence_key(existing));
                    let (winner, loser) = if replace {
                        (candidate.id.clone(), existing.id.clone())
                    } else {
                        (existing.id.clone(), candidate.id.clone())
                    };
                    report.warnings.push(ValidationIssue::new(
                        CheckKind::Duplicate,
                        &loser,
                        format!("near-duplicate of {winner}, removed"),
                    ));
                    if replace {
                        kept[idx] = candidate;
                    }
                }
                None => kept.push(candidate),
            }
        }
        if report.warnings.iter().any(|w| w.check == CheckKind::Duplicate) {
            warn!(
                removed = report
                    .warnings
                    .iter()
                    .filter(|w| w.check == CheckKind::Duplicate)
                    .count(),
                "Near-duplicate findings removed"
            );
        }
        kept
    }
}

fn normalized_component(finding: &Finding) -> String {
    finding
        .component
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .unwrap_or_default()
}

/// Confidence as an orderable integer (per-mille).
fn confidence_key(finding: &Finding) -> u32 {
    (finding.confidence * 1000.0).round() as u32
}
