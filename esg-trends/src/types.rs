//! Core data model for the trend engine
//!
//! Observations flow in from the normalizer collaborator, become
//! `ReconciledValue`s with an attached `QualityVerdict`, and end up as
//! `TrendRecord`s published by the fallback orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use esg_common::{HealthStatus, TrendSource};

/// Index of a fixed-width time bucket (`floor(unix_seconds / bucket_seconds)`)
pub type BucketIndex = i64;

/// Trust / confidence value in [0, 1]
pub type Confidence = f64;

/// Bucket index containing `at` for a given bucket width
pub fn bucket_of(at: DateTime<Utc>, bucket_seconds: i64) -> BucketIndex {
    at.timestamp().div_euclid(bucket_seconds.max(1))
}

// ============================================================================
// Observations
// ============================================================================

/// One fact from one source, as delivered by the normalizer
///
/// Immutable once created; the engine never mutates observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub subject_id: String,
    pub metric_name: String,
    pub value: f64,
    pub source_id: String,
    pub observed_at: DateTime<Utc>,
    /// Source-reported confidence (0.0-1.0), if the source provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_confidence: Option<Confidence>,
}

impl Observation {
    pub fn new(
        subject_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        source_id: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            metric_name: metric_name.into(),
            value,
            source_id: source_id.into(),
            observed_at,
            source_confidence: None,
        }
    }

    /// Attach a source-reported confidence
    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.source_confidence = Some(confidence);
        self
    }

    /// Idempotency key: `(source_id, subject_id, metric_name, observed_at)`
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            source_id: self.source_id.clone(),
            subject_id: self.subject_id.clone(),
            metric_name: self.metric_name.clone(),
            observed_at: self.observed_at,
        }
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.subject_id, &self.metric_name)
    }
}

/// Deduplication key for submitted observations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservationKey {
    pub source_id: String,
    pub subject_id: String,
    pub metric_name: String,
    pub observed_at: DateTime<Utc>,
}

/// One reconciled series: a metric about a subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub subject_id: String,
    pub metric_name: String,
}

impl SeriesKey {
    pub fn new(subject_id: &str, metric_name: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            metric_name: metric_name.to_string(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.metric_name)
    }
}

/// One published trend: a metric across a subject group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrendKey {
    pub subject_group: String,
    pub metric_name: String,
}

impl TrendKey {
    pub fn new(subject_group: &str, metric_name: &str) -> Self {
        Self {
            subject_group: subject_group.to_string(),
            metric_name: metric_name.to_string(),
        }
    }
}

impl fmt::Display for TrendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_group, self.metric_name)
    }
}

// ============================================================================
// Reconciliation and quality
// ============================================================================

/// Authoritative value for one `(subject_id, metric_name, bucket)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledValue {
    pub subject_id: String,
    pub metric_name: String,
    pub bucket: BucketIndex,
    pub value: f64,
    pub confidence: Confidence,
    /// Sources whose observations survived into the final value
    pub contributing_sources: BTreeSet<String>,
    /// Sources dropped during conflict resolution
    pub dropped_sources: BTreeSet<String>,
    pub conflicts_resolved: u32,
    /// Highest-weight contributor
    pub dominant_source: Option<String>,
}

impl ReconciledValue {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.subject_id, &self.metric_name)
    }
}

/// What the quality controller did to a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairAction {
    None,
    /// Clamped to the nearest envelope boundary
    Clipped,
    /// Excluded from trend computation for this bucket
    Dropped,
    /// Recorded for audit without entering the series (suppressed-source rechecks)
    Flagged,
}

/// Quality assessment attached to a reconciled value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub passed: bool,
    /// Normalised deviation from the trailing envelope (1.0 = on the boundary)
    pub anomaly_score: f64,
    pub applied_rule_ids: Vec<String>,
    pub repair_action: RepairAction,
}

impl QualityVerdict {
    /// Verdict for a value with no envelope to check against
    pub fn unchecked() -> Self {
        Self {
            passed: true,
            anomaly_score: 0.0,
            applied_rule_ids: Vec::new(),
            repair_action: RepairAction::None,
        }
    }
}

/// A reconciled value after quality control
///
/// `value.value` already reflects any clipping; `raw_value` keeps the
/// reconciled value as it left the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessedValue {
    pub value: ReconciledValue,
    pub raw_value: f64,
    pub verdict: QualityVerdict,
}

// ============================================================================
// Trends
// ============================================================================

/// Actionable classification of a trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Watch,
    Prepare,
    Act,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Watch => write!(f, "Watch"),
            Stage::Prepare => write!(f, "Prepare"),
            Stage::Act => write!(f, "Act"),
        }
    }
}

/// Externally visible trend unit
///
/// `stage` is always derived from `(growth_rate, strength, data_quality_score)`
/// by `trend::classify_stage`; nothing sets it independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub subject_group: String,
    pub metric_name: String,
    /// Percentage change per bucket
    pub growth_rate: f64,
    /// 0-100
    pub strength: f64,
    pub stage: Stage,
    /// Mean confidence of the contributing reconciled values (0.0-1.0)
    pub data_quality_score: f64,
    pub computed_at: DateTime<Utc>,
    pub source: TrendSource,
    /// Mean value over the window
    pub score: f64,
    /// Fixed-length series for radar/sparkline rendering
    pub trend_values: Vec<f64>,
    /// Buckets with data in the window
    pub data_points: usize,
    pub contributing_sources: BTreeSet<String>,
}

impl TrendRecord {
    pub fn key(&self) -> TrendKey {
        TrendKey::new(&self.subject_group, &self.metric_name)
    }

    /// Same record relabelled with a different provenance
    pub fn relabel(&self, source: TrendSource) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_of_daily() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap();
        let next = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(bucket_of(next, 86_400) - bucket_of(at, 86_400), 1);
    }

    #[test]
    fn test_bucket_of_before_epoch_rounds_down() {
        let at = Utc.with_ymd_and_hms(1969, 12, 31, 12, 0, 0).unwrap();
        assert_eq!(bucket_of(at, 86_400), -1);
    }

    #[test]
    fn test_observation_key_ignores_value() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = Observation::new("AAPL", "environmental_score", 71.0, "msci", at);
        let b = Observation::new("AAPL", "environmental_score", 99.0, "msci", at);
        assert_eq!(a.key(), b.key());
    }
}
