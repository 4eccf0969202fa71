//! Data health monitor
//!
//! Read-only assessment of the published trend set. Status breakpoints on
//! the share of records backed by statistical computation (computed or
//! cached): > 80% excellent, > 50% good, > 20% fair, otherwise poor. A
//! placeholder or exhausted set is always poor.

use crate::fallback::LiveSet;
use crate::types::{HealthStatus, TrendSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Quality average below which validation should be reviewed
const LOW_AVERAGE_QUALITY: f64 = 0.7;
/// Fewer distinct sources than this means no redundancy
const MIN_REDUNDANT_SOURCES: usize = 2;

/// Pipeline counters that feed the health report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineCounters {
    /// Values dropped by quality control (cumulative)
    pub quality_rejections: u64,
    /// Observations dropped during conflict resolution (cumulative)
    pub conflicts_resolved: u64,
    /// Failed archive/reliability writes (cumulative)
    pub store_failures: u64,
    /// Sources currently suppressed
    pub suppressed_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub total_trend_count: usize,
    pub fraction_with_source_computed: f64,
    /// Computed or cached
    pub fraction_statistical: f64,
    pub distinct_contributing_sources: usize,
    pub oldest_computed_at: Option<DateTime<Utc>>,
    pub average_data_quality: f64,
    pub trend_categories: BTreeSet<String>,
    pub live_source: Option<TrendSource>,
    pub quality_rejections: u64,
    pub conflicts_resolved: u64,
    pub suppressed_sources: Vec<String>,
    pub store_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub metrics: HealthMetrics,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Stateless health assessment
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthMonitor;

impl HealthMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Assess the live set; `None` means nothing has been published yet
    pub fn assess(
        &self,
        live: Option<&LiveSet>,
        counters: &PipelineCounters,
        now: DateTime<Utc>,
    ) -> HealthReport {
        let metrics = metrics(live, counters);
        let status = match live {
            None => HealthStatus::Poor,
            Some(set) if set.exhausted || set.source == TrendSource::Fallback => HealthStatus::Poor,
            Some(_) => status_for(metrics.fraction_statistical),
        };
        let recommendations = recommendations(status, &metrics, live);

        HealthReport {
            status,
            metrics,
            recommendations,
            checked_at: now,
        }
    }
}

/// Fixed breakpoints on the statistical fraction
pub fn status_for(fraction: f64) -> HealthStatus {
    if fraction > 0.8 {
        HealthStatus::Excellent
    } else if fraction > 0.5 {
        HealthStatus::Good
    } else if fraction > 0.2 {
        HealthStatus::Fair
    } else {
        HealthStatus::Poor
    }
}

fn metrics(live: Option<&LiveSet>, counters: &PipelineCounters) -> HealthMetrics {
    let trends = live.map(|set| set.trends.as_slice()).unwrap_or(&[]);
    let total = trends.len();
    let fraction = |keep: fn(TrendSource) -> bool| {
        if total == 0 {
            0.0
        } else {
            trends.iter().filter(|r| keep(r.source)).count() as f64 / total as f64
        }
    };

    let sources: BTreeSet<&String> = trends
        .iter()
        .flat_map(|r| r.contributing_sources.iter())
        .collect();
    let average_data_quality = if total == 0 {
        0.0
    } else {
        trends.iter().map(|r| r.data_quality_score).sum::<f64>() / total as f64
    };

    HealthMetrics {
        total_trend_count: total,
        fraction_with_source_computed: fraction(|s| s == TrendSource::Computed),
        fraction_statistical: fraction(|s| matches!(s, TrendSource::Computed | TrendSource::Cached)),
        distinct_contributing_sources: sources.len(),
        oldest_computed_at: trends.iter().map(|r| r.computed_at).min(),
        average_data_quality,
        trend_categories: trends.iter().map(|r| r.subject_group.clone()).collect(),
        live_source: live.map(|set| set.source),
        quality_rejections: counters.quality_rejections,
        conflicts_resolved: counters.conflicts_resolved,
        suppressed_sources: counters.suppressed_sources.clone(),
        store_failures: counters.store_failures,
    }
}

fn recommendations(
    status: HealthStatus,
    metrics: &HealthMetrics,
    live: Option<&LiveSet>,
) -> Vec<String> {
    let mut out: Vec<String> = match status {
        HealthStatus::Poor => vec![
            "Run a refresh cycle to rebuild trends from current observations".to_string(),
            "Check ESG data provider connections".to_string(),
            "Verify that the observation normalizer is delivering data".to_string(),
            "Consider adding fallback data sources".to_string(),
        ],
        HealthStatus::Fair => vec![
            "Increase data refresh frequency".to_string(),
            "Add more ESG data sources for better coverage".to_string(),
            "Review data quality validation rules".to_string(),
        ],
        HealthStatus::Good => vec![
            "Monitor data freshness regularly".to_string(),
            "Consider adding real-time data streams".to_string(),
        ],
        HealthStatus::Excellent => {
            vec!["Data health is excellent - maintain current processes".to_string()]
        }
    };

    if metrics.total_trend_count > 0 && metrics.average_data_quality < LOW_AVERAGE_QUALITY {
        out.push("Improve data quality validation and cleansing processes".to_string());
    }
    if metrics.distinct_contributing_sources < MIN_REDUNDANT_SOURCES {
        out.push("Add additional data sources for better redundancy".to_string());
    }

    // Per-metric coverage, placeholders excluded
    let mut per_metric: BTreeMap<&str, BTreeSet<&String>> = BTreeMap::new();
    if let Some(set) = live {
        for record in set.trends.iter().filter(|r| r.source != TrendSource::Fallback) {
            per_metric
                .entry(record.metric_name.as_str())
                .or_default()
                .extend(record.contributing_sources.iter());
        }
    }
    for (metric, sources) in per_metric {
        if sources.len() < MIN_REDUNDANT_SOURCES {
            out.push(format!("Add more sources for metric {}", metric));
        }
    }

    for source in &metrics.suppressed_sources {
        out.push(format!(
            "Investigate source {}: suppressed after repeated quality rejections",
            source
        ));
    }
    if metrics.store_failures > 0 {
        out.push("Check trend archive connectivity: writes have failed".to_string());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Stage, TrendRecord};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(group: &str, source: TrendSource, sources: &[&str], quality: f64) -> TrendRecord {
        TrendRecord {
            subject_group: group.to_string(),
            metric_name: "environmental_score".to_string(),
            growth_rate: 1.0,
            strength: 75.0,
            stage: Stage::Act,
            data_quality_score: quality,
            computed_at: now(),
            source,
            score: 60.0,
            trend_values: Vec::new(),
            data_points: 30,
            contributing_sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn live(trends: Vec<TrendRecord>, source: TrendSource) -> LiveSet {
        LiveSet {
            trends,
            source,
            computed_at: now(),
            exhausted: false,
        }
    }

    #[test]
    fn test_breakpoints() {
        assert_eq!(status_for(0.81), HealthStatus::Excellent);
        assert_eq!(status_for(0.8), HealthStatus::Good);
        assert_eq!(status_for(0.51), HealthStatus::Good);
        assert_eq!(status_for(0.5), HealthStatus::Fair);
        assert_eq!(status_for(0.21), HealthStatus::Fair);
        assert_eq!(status_for(0.2), HealthStatus::Poor);
    }

    #[test]
    fn test_all_computed_is_excellent() {
        let set = live(
            vec![
                record("Climate Tech", TrendSource::Computed, &["msci", "refinitiv"], 0.9),
                record("Renewable Energy", TrendSource::Computed, &["msci"], 0.8),
            ],
            TrendSource::Computed,
        );
        let report = HealthMonitor::new().assess(Some(&set), &PipelineCounters::default(), now());

        assert_eq!(report.status, HealthStatus::Excellent);
        assert_eq!(report.metrics.total_trend_count, 2);
        assert_eq!(report.metrics.fraction_with_source_computed, 1.0);
        assert_eq!(report.metrics.distinct_contributing_sources, 2);
        assert_eq!(report.metrics.trend_categories.len(), 2);
        assert_eq!(
            report.recommendations,
            vec!["Data health is excellent - maintain current processes".to_string()]
        );
    }

    #[test]
    fn test_fallback_set_is_poor() {
        let set = live(
            vec![record("Climate Tech", TrendSource::Fallback, &[], 0.0)],
            TrendSource::Fallback,
        );
        let report = HealthMonitor::new().assess(Some(&set), &PipelineCounters::default(), now());
        assert_eq!(report.status, HealthStatus::Poor);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("redundancy")));
    }

    #[test]
    fn test_exhausted_set_is_poor() {
        let mut set = live(
            vec![record("Climate Tech", TrendSource::Computed, &["a", "b"], 0.9)],
            TrendSource::Computed,
        );
        set.exhausted = true;
        let report = HealthMonitor::new().assess(Some(&set), &PipelineCounters::default(), now());
        assert_eq!(report.status, HealthStatus::Poor);
    }

    #[test]
    fn test_nothing_published_is_poor() {
        let report = HealthMonitor::new().assess(None, &PipelineCounters::default(), now());
        assert_eq!(report.status, HealthStatus::Poor);
        assert_eq!(report.metrics.total_trend_count, 0);
        assert!(report.metrics.oldest_computed_at.is_none());
    }

    #[test]
    fn test_generated_share_lowers_status() {
        let set = live(
            vec![
                record("A", TrendSource::Cached, &["a", "b"], 0.9),
                record("B", TrendSource::Generated, &["a", "b"], 0.4),
                record("C", TrendSource::Generated, &["a", "b"], 0.4),
            ],
            TrendSource::Computed,
        );
        let report = HealthMonitor::new().assess(Some(&set), &PipelineCounters::default(), now());
        assert_eq!(report.status, HealthStatus::Fair);
        assert_eq!(report.metrics.fraction_with_source_computed, 0.0);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("quality validation and cleansing")));
    }

    #[test]
    fn test_specific_recommendations() {
        let mut older = record("Climate Tech", TrendSource::Computed, &["msci"], 0.9);
        older.computed_at = now() - Duration::hours(3);
        let set = live(vec![older], TrendSource::Computed);
        let counters = PipelineCounters {
            suppressed_sources: vec!["scraper".to_string()],
            store_failures: 2,
            ..PipelineCounters::default()
        };

        let report = HealthMonitor::new().assess(Some(&set), &counters, now());
        assert_eq!(report.metrics.oldest_computed_at, Some(now() - Duration::hours(3)));
        assert!(report
            .recommendations
            .contains(&"Add more sources for metric environmental_score".to_string()));
        assert!(report.recommendations.iter().any(|r| r.contains("scraper")));
        assert!(report.recommendations.iter().any(|r| r.contains("archive")));
    }
}
