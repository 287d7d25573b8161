use crate::result::{AnalysisResult, SeverityHistogram};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

/// Limits beyond which a comparison is flagged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComparisonThresholds {
    /// Alert when severity similarity falls below this.
    pub min_similarity: f64,
    /// Alert when the absolute finding-count delta exceeds this.
    pub max_count_delta: u64,
}

impl Default for ComparisonThresholds {
    fn default() -> Self {
        Self {
            min_similarity: 0.8,
            max_count_delta: 5,
        }
    }
}

/// Difference between a legacy and a direct result for the same input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonRecord {
    /// Record id.
    pub id: Uuid,
    /// Run the comparison belongs to.
    pub run_id: Uuid,
    /// Findings in the legacy result.
    pub legacy_count: usize,
    /// Findings in the direct result.
    pub direct_count: usize,
    /// `direct_count - legacy_count`.
    pub count_delta: i64,
    /// Legacy severities.
    pub legacy_histogram: SeverityHistogram,
    /// Direct severities.
    pub direct_histogram: SeverityHistogram,
    /// 1.0 for identical severity distributions, 0.0 for disjoint ones.
    pub severity_similarity: f64,
    /// Source agents seen only in the direct result.
    pub agents_only_direct: Vec<String>,
    /// Source agents seen only in the legacy result.
    pub agents_only_legacy: Vec<String>,
    /// A threshold was crossed.
    pub alert: bool,
    /// When the comparison was made.
    pub created_at: DateTime<Utc>,
}

impl ComparisonRecord {
    /// Compare two results and flag an alert past `thresholds`.
    pub fn compare(
        run_id: Uuid,
        legacy: &AnalysisResult,
        direct: &AnalysisResult,
        thresholds: ComparisonThresholds,
    ) -> Self {
        let legacy_histogram = SeverityHistogram::from_findings(legacy.findings());
        let direct_histogram = SeverityHistogram::from_findings(direct.findings());
        let severity_similarity = histogram_similarity(&legacy_histogram, &direct_histogram);
        let count_delta = direct.total_count as i64 - legacy.total_count as i64;

        let legacy_agents: BTreeSet<String> =
            legacy.findings().map(|f| f.source_agent.clone()).collect();
        let direct_agents: BTreeSet<String> =
            direct.findings().map(|f| f.source_agent.clone()).collect();

        let alert = severity_similarity < thresholds.min_similarity
            || count_delta.unsigned_abs() > thresholds.max_count_delta;

        Self {
            id: Uuid::new_v4(),
            run_id,
            legacy_count: legacy.total_count,
            direct_count: direct.total_count,
            count_delta,
            legacy_histogram,
            direct_histogram,
            severity_similarity,
            agents_only_direct: direct_agents.difference(&legacy_agents).cloned().collect(),
            agents_only_legacy: legacy_agents.difference(&direct_agents).cloned().collect(),
            alert,
            created_at: Utc::now(),
        }
    }
}

/// One minus the total variation distance between the two normalized
/// distributions. Two empty histograms are identical; one empty is disjoint.
pub fn histogram_similarity(a: &SeverityHistogram, b: &SeverityHistogram) -> f64 {
    let (ta, tb) = (a.total(), b.total());
    match (ta, tb) {
        (0, 0) => 1.0,
        (0, _) | (_, 0) => 0.0,
        _ => {
            let distance: f64 = a
                .as_array()
                .iter()
                .zip(b.as_array())
                .map(|(x, y)| (*x as f64 / ta as f64 - y as f64 / tb as f64).abs())
                .sum::<f64>()
                / 2.0;
            (1.0 - distance).clamp(0.0, 1.0)
        }
    }
}

/// Bounded in-memory ring of recent comparison records.
pub struct ComparisonHistory {
    capacity: usize,
    records: Mutex<VecDeque<ComparisonRecord>>,
}

impl ComparisonHistory {
    /// Keep at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Append, evicting the oldest record when full.
    pub fn push(&self, record: ComparisonRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<ComparisonRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Most recent record.
    pub fn latest(&self) -> Option<ComparisonRecord> {
        self.records.lock().back().cloned()
    }

    /// Records that raised an alert.
    pub fn alerts(&self) -> usize {
        self.records.lock().iter().filter(|r| r.alert).count()
    }

    /// Records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no record is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ComparisonHistory {
    fn default() -> Self {
        Self::new(100)
    }
}
