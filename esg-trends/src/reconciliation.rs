//! Multi-source reconciliation
//!
//! Merges same-subject observations from several sources into one
//! authoritative value per bucket.
//!
//! # Algorithm
//! 1. Group observations by bucket; within a bucket keep the latest
//!    observation per source and skip suppressed sources
//! 2. Single source: its value, confidence = its reliability
//! 3. Several sources in agreement: reliability-weighted mean,
//!    confidence = weighted mean reliability
//! 4. Disagreement: drop outlier sources, re-average the remainder,
//!    penalise confidence by the dropped fraction and by any disagreement
//!    that remains
//! 5. Nudge every participating source's reliability toward its agreement
//!    with the final value
//!
//! A bucket without observations produces nothing: absence is not zero.

use crate::config::ReconciliationConfig;
use crate::reliability::ReliabilityStore;
use crate::types::{bucket_of, BucketIndex, Confidence, Observation, ReconciledValue, SeriesKey};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// One source's participation in a bucket
#[derive(Debug, Clone)]
struct Candidate {
    source_id: String,
    value: f64,
    reliability: Confidence,
    weight: f64,
}

/// Result of resolving one bucket, before reliability feedback
#[derive(Debug, Clone)]
pub struct Resolution {
    pub value: ReconciledValue,
    /// `(source_id, observed value)` of every participating source, dropped ones included
    pub participants: Vec<(String, f64)>,
}

/// Reconciliation engine (owns the reliability feedback loop)
pub struct ReconciliationEngine {
    config: ReconciliationConfig,
    reliability: Arc<dyn ReliabilityStore>,
}

impl ReconciliationEngine {
    pub fn new(config: ReconciliationConfig, reliability: Arc<dyn ReliabilityStore>) -> Self {
        Self {
            config,
            reliability,
        }
    }

    pub fn reliability(&self) -> &Arc<dyn ReliabilityStore> {
        &self.reliability
    }

    /// Group observations by bucket
    pub fn group_by_bucket<'a>(
        &self,
        observations: &'a [Observation],
    ) -> BTreeMap<BucketIndex, Vec<&'a Observation>> {
        let mut grouped: BTreeMap<BucketIndex, Vec<&Observation>> = BTreeMap::new();
        for observation in observations {
            grouped
                .entry(bucket_of(observation.observed_at, self.config.bucket_seconds))
                .or_default()
                .push(observation);
        }
        grouped
    }

    /// Reconcile one bucket and feed agreement back into source reliability
    ///
    /// # Arguments
    /// * `series` - Subject and metric being reconciled
    /// * `bucket` - Bucket index
    /// * `observations` - All observations of the bucket
    /// * `suppressed` - Sources currently routed around
    ///
    /// # Returns
    /// `None` when no usable observation exists for the bucket
    pub fn reconcile_bucket(
        &self,
        series: &SeriesKey,
        bucket: BucketIndex,
        observations: &[Observation],
        suppressed: &HashSet<String>,
    ) -> Option<ReconciledValue> {
        let resolution = self.resolve(series, bucket, observations, suppressed)?;
        self.record_agreement(&resolution);
        Some(resolution.value)
    }

    /// Reconcile every bucket of a batch of observations, oldest bucket first
    pub fn reconcile_series(
        &self,
        series: &SeriesKey,
        observations: &[Observation],
        suppressed: &HashSet<String>,
    ) -> Vec<ReconciledValue> {
        self.group_by_bucket(observations)
            .into_iter()
            .filter_map(|(bucket, group)| {
                let owned: Vec<Observation> = group.into_iter().cloned().collect();
                self.reconcile_bucket(series, bucket, &owned, suppressed)
            })
            .collect()
    }

    /// Resolve a bucket without touching reliability scores
    pub fn resolve(
        &self,
        series: &SeriesKey,
        bucket: BucketIndex,
        observations: &[Observation],
        suppressed: &HashSet<String>,
    ) -> Option<Resolution> {
        let candidates = self.candidates(series, observations, suppressed);
        if candidates.is_empty() {
            return None;
        }

        let participants: Vec<(String, f64)> = candidates
            .iter()
            .map(|c| (c.source_id.clone(), c.value))
            .collect();

        let mut reconciled = ReconciledValue {
            subject_id: series.subject_id.clone(),
            metric_name: series.metric_name.clone(),
            bucket,
            value: 0.0,
            confidence: 0.0,
            contributing_sources: BTreeSet::new(),
            dropped_sources: BTreeSet::new(),
            conflicts_resolved: 0,
            dominant_source: None,
        };

        // Step 2: single source
        if candidates.len() == 1 {
            let only = &candidates[0];
            reconciled.value = only.value;
            reconciled.confidence = only.reliability;
            reconciled.contributing_sources.insert(only.source_id.clone());
            reconciled.dominant_source = Some(only.source_id.clone());
            return Some(Resolution {
                value: reconciled,
                participants,
            });
        }

        // Step 3: agreement within tolerance
        let mean = weighted_mean(&candidates);
        let tolerance = self.config.agreement_tolerance;
        if candidates
            .iter()
            .all(|c| within_tolerance(c.value, mean, tolerance))
        {
            reconciled.value = mean;
            reconciled.confidence = weighted_reliability(&candidates);
            reconciled.contributing_sources =
                candidates.iter().map(|c| c.source_id.clone()).collect();
            reconciled.dominant_source = dominant(&candidates);
            return Some(Resolution {
                value: reconciled,
                participants,
            });
        }

        // Step 4: conflict
        let total = candidates.len();
        let (kept, dropped) = self.split_outliers(candidates);
        let final_value = weighted_mean(&kept);

        let dropped_fraction = dropped.len() as f64 / total as f64;
        let unresolved = kept
            .iter()
            .filter(|c| !within_tolerance(c.value, final_value, tolerance))
            .count();
        let unresolved_fraction = unresolved as f64 / kept.len() as f64;

        let confidence = weighted_reliability(&kept)
            * (1.0 - self.config.conflict_penalty * dropped_fraction)
            * (1.0 - self.config.unresolved_penalty * unresolved_fraction);

        if unresolved > 0 {
            warn!(
                subject = %series.subject_id,
                metric = %series.metric_name,
                bucket,
                unresolved,
                "Disagreement remains after outlier suppression"
            );
        }
        debug!(
            subject = %series.subject_id,
            metric = %series.metric_name,
            bucket,
            dropped = dropped.len(),
            value = final_value,
            confidence,
            "Conflict resolved"
        );

        reconciled.value = final_value;
        reconciled.confidence = confidence.clamp(0.0, 1.0);
        reconciled.contributing_sources = kept.iter().map(|c| c.source_id.clone()).collect();
        reconciled.dropped_sources = dropped.iter().map(|c| c.source_id.clone()).collect();
        reconciled.conflicts_resolved = dropped.len() as u32;
        reconciled.dominant_source = dominant(&kept);

        Some(Resolution {
            value: reconciled,
            participants,
        })
    }

    /// Step 5: agreement feedback for every participant
    pub fn record_agreement(&self, resolution: &Resolution) {
        let final_value = resolution.value.value;
        for (source_id, value) in &resolution.participants {
            self.reliability
                .update(source_id, agreement_delta(*value, final_value));
        }
    }

    /// Latest observation per non-suppressed source, with weights
    fn candidates(
        &self,
        series: &SeriesKey,
        observations: &[Observation],
        suppressed: &HashSet<String>,
    ) -> Vec<Candidate> {
        let mut latest: BTreeMap<&str, &Observation> = BTreeMap::new();
        for observation in observations {
            if observation.subject_id != series.subject_id
                || observation.metric_name != series.metric_name
                || suppressed.contains(&observation.source_id)
            {
                continue;
            }
            latest
                .entry(observation.source_id.as_str())
                .and_modify(|current| {
                    if observation.observed_at >= current.observed_at {
                        *current = observation;
                    }
                })
                .or_insert(observation);
        }

        latest
            .into_values()
            .map(|observation| {
                let reliability = self.reliability.get(&observation.source_id);
                let weight = reliability * observation.source_confidence.unwrap_or(1.0);
                Candidate {
                    source_id: observation.source_id.clone(),
                    value: observation.value,
                    reliability,
                    weight,
                }
            })
            .collect()
    }

    /// Split conflicting candidates into (kept, dropped)
    ///
    /// Dropped: reliability more than `outlier_sigma` standard deviations
    /// below the mean, or out of tolerance of the weighted median while
    /// below mean reliability. The most reliable candidate always survives.
    fn split_outliers(&self, candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<Candidate>) {
        let n = candidates.len() as f64;
        let mean_r = candidates.iter().map(|c| c.reliability).sum::<f64>() / n;
        let std_r = (candidates
            .iter()
            .map(|c| (c.reliability - mean_r).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();
        let floor = mean_r - self.config.outlier_sigma * std_r;
        let median = weighted_median(&candidates);
        let tolerance = self.config.agreement_tolerance;

        let anchor = candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.reliability.total_cmp(&b.reliability))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let (mut kept, mut dropped) = (Vec::new(), Vec::new());
        for (i, candidate) in candidates.into_iter().enumerate() {
            let low_reliability = std_r > 0.0 && candidate.reliability < floor;
            let disagreeing = !within_tolerance(candidate.value, median, tolerance)
                && candidate.reliability < mean_r;
            if i != anchor && (low_reliability || disagreeing) {
                dropped.push(candidate);
            } else {
                kept.push(candidate);
            }
        }
        (kept, dropped)
    }
}

/// Agreement of one observed value with the final value, in [0, 1]
pub fn agreement_delta(value: f64, final_value: f64) -> f64 {
    if final_value == 0.0 {
        return if value == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - (value - final_value).abs() / final_value.abs()).clamp(0.0, 1.0)
}

/// `value` lies within `tolerance * |reference|` of `reference`
pub fn within_tolerance(value: f64, reference: f64, tolerance: f64) -> bool {
    let slack = tolerance * reference.abs();
    (value - reference).abs() <= slack + slack * 1e-12
}

/// Reliability-weighted mean; plain mean when all weights are zero
fn weighted_mean(candidates: &[Candidate]) -> f64 {
    let total: f64 = candidates.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return candidates.iter().map(|c| c.value).sum::<f64>() / candidates.len() as f64;
    }
    let mean = candidates.iter().map(|c| c.value * c.weight).sum::<f64>() / total;
    // Guard against rounding outside the input range
    let (lo, hi) = value_range(candidates);
    mean.clamp(lo, hi)
}

/// Weighted mean of reliabilities, using the same weights as the value
fn weighted_reliability(candidates: &[Candidate]) -> Confidence {
    let total: f64 = candidates.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return candidates.iter().map(|c| c.reliability).sum::<f64>() / candidates.len() as f64;
    }
    candidates.iter().map(|c| c.reliability * c.weight).sum::<f64>() / total
}

fn weighted_median(candidates: &[Candidate]) -> f64 {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.value.total_cmp(&b.value));

    let total: f64 = sorted.iter().map(|c| c.weight).sum();
    let uniform = total <= 0.0;
    let total = if uniform { sorted.len() as f64 } else { total };

    let mut cumulative = 0.0;
    for candidate in &sorted {
        cumulative += if uniform { 1.0 } else { candidate.weight };
        if cumulative >= total / 2.0 {
            return candidate.value;
        }
    }
    sorted.last().map(|c| c.value).unwrap_or(0.0)
}

fn value_range(candidates: &[Candidate]) -> (f64, f64) {
    candidates.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| {
        (lo.min(c.value), hi.max(c.value))
    })
}

fn dominant(candidates: &[Candidate]) -> Option<String> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then_with(|| b.source_id.cmp(&a.source_id))
        })
        .map(|c| c.source_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReliabilityConfig;
    use crate::reliability::InMemoryReliabilityStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn obs(source: &str, value: f64) -> Observation {
        Observation::new("AAPL", "environmental_score", value, source, at(1))
    }

    fn series() -> SeriesKey {
        SeriesKey::new("AAPL", "environmental_score")
    }

    fn engine(scores: &[(&str, f64)]) -> ReconciliationEngine {
        let store = InMemoryReliabilityStore::with_scores(&ReliabilityConfig::default(), scores);
        ReconciliationEngine::new(ReconciliationConfig::default(), Arc::new(store))
    }

    #[test]
    fn test_empty_bucket_emits_nothing() {
        let engine = engine(&[]);
        assert!(engine
            .reconcile_bucket(&series(), 0, &[], &HashSet::new())
            .is_none());
    }

    #[test]
    fn test_single_source_confidence_is_reliability() {
        let engine = engine(&[("msci", 0.73)]);
        let value = engine
            .reconcile_bucket(&series(), 0, &[obs("msci", 64.0)], &HashSet::new())
            .unwrap();

        assert_eq!(value.value, 64.0);
        assert_eq!(value.confidence, 0.73);
        assert_eq!(value.conflicts_resolved, 0);
        assert_eq!(value.dominant_source.as_deref(), Some("msci"));
    }

    #[test]
    fn test_agreeing_sources_use_weighted_mean() {
        let engine = engine(&[("a", 0.9), ("b", 0.6)]);
        let value = engine
            .resolve(&series(), 0, &[obs("a", 100.0), obs("b", 105.0)], &HashSet::new())
            .unwrap()
            .value;

        let expected = (100.0 * 0.9 + 105.0 * 0.6) / 1.5;
        assert!((value.value - expected).abs() < 1e-9);
        let expected_conf = (0.9 * 0.9 + 0.6 * 0.6) / 1.5;
        assert!((value.confidence - expected_conf).abs() < 1e-9);
        assert_eq!(value.conflicts_resolved, 0);
        assert_eq!(value.contributing_sources.len(), 2);
    }

    #[test]
    fn test_source_confidence_scales_weight() {
        let engine = engine(&[("a", 0.8), ("b", 0.8)]);
        let observations = vec![obs("a", 100.0), obs("b", 104.0).with_confidence(0.25)];
        let value = engine
            .resolve(&series(), 0, &observations, &HashSet::new())
            .unwrap()
            .value;

        let expected = (100.0 * 0.8 + 104.0 * 0.2) / 1.0;
        assert!((value.value - expected).abs() < 1e-9);
        assert_eq!(value.dominant_source.as_deref(), Some("a"));
    }

    #[test]
    fn test_three_source_outlier_scenario() {
        let engine = engine(&[("refinitiv", 0.9), ("bloomberg", 0.8), ("scraper", 0.3)]);
        let observations = vec![
            obs("refinitiv", 100.0),
            obs("bloomberg", 102.0),
            obs("scraper", 250.0),
        ];

        let value = engine
            .reconcile_bucket(&series(), 0, &observations, &HashSet::new())
            .unwrap();

        assert_eq!(value.conflicts_resolved, 1);
        assert!(value.dropped_sources.contains("scraper"));
        assert!((value.value - 101.0).abs() < 0.5, "got {}", value.value);
        // Confidence is penalised relative to the kept sources' reliability
        assert!(value.confidence < (0.9 * 0.9 + 0.8 * 0.8) / 1.7);

        // Feedback: the outlier loses trust, the agreeing sources gain
        let store = engine.reliability();
        assert!(store.get("scraper") < 0.3);
        assert!(store.get("refinitiv") > 0.9 * 0.95);
    }

    #[test]
    fn test_latest_observation_per_source_wins() {
        let engine = engine(&[("a", 0.9)]);
        let mut early = obs("a", 50.0);
        early.observed_at = at(1);
        let mut late = obs("a", 55.0);
        late.observed_at = at(5);

        let value = engine
            .resolve(&series(), 0, &[late, early], &HashSet::new())
            .unwrap()
            .value;
        assert_eq!(value.value, 55.0);
    }

    #[test]
    fn test_suppressed_sources_are_ignored() {
        let engine = engine(&[("a", 0.9), ("b", 0.9)]);
        let suppressed: HashSet<String> = ["b".to_string()].into_iter().collect();
        let value = engine
            .resolve(&series(), 0, &[obs("a", 10.0), obs("b", 99.0)], &suppressed)
            .unwrap()
            .value;
        assert_eq!(value.value, 10.0);
        assert!(!value.contributing_sources.contains("b"));

        let only_suppressed: HashSet<String> =
            ["a".to_string(), "b".to_string()].into_iter().collect();
        assert!(engine
            .resolve(&series(), 0, &[obs("a", 10.0)], &only_suppressed)
            .is_none());
    }

    #[test]
    fn test_equal_reliability_disagreement_is_unresolved() {
        let engine = engine(&[("a", 0.8), ("b", 0.8)]);
        let value = engine
            .resolve(&series(), 0, &[obs("a", 100.0), obs("b", 200.0)], &HashSet::new())
            .unwrap()
            .value;

        // Nobody is below mean reliability, so nothing is dropped
        assert_eq!(value.conflicts_resolved, 0);
        assert!(value.value >= 100.0 && value.value <= 200.0);
        assert!(value.confidence < 0.8);
    }

    #[test]
    fn test_conflicts_grow_with_outliers() {
        let mut previous = 0;
        for outliers in 0..=5 {
            let mut scores = vec![("a", 0.9), ("b", 0.9), ("c", 0.9)];
            let names: Vec<String> = (0..outliers).map(|i| format!("bad{}", i)).collect();
            for name in &names {
                scores.push((name.as_str(), 0.2));
            }
            let engine = engine(&scores);

            let mut observations = vec![obs("a", 100.0), obs("b", 101.0), obs("c", 99.0)];
            for (i, name) in names.iter().enumerate() {
                observations.push(obs(name, 300.0 + 50.0 * i as f64));
            }

            let value = engine
                .resolve(&series(), 0, &observations, &HashSet::new())
                .unwrap()
                .value;
            assert!(value.conflicts_resolved >= previous);
            assert_eq!(value.conflicts_resolved as usize, outliers);
            previous = value.conflicts_resolved;
        }
    }

    #[test]
    fn test_reconcile_series_groups_by_bucket() {
        let engine = engine(&[("a", 0.9)]);
        let mut day_two = obs("a", 60.0);
        day_two.observed_at = at(30);
        let values = engine.reconcile_series(&series(), &[obs("a", 50.0), day_two], &HashSet::new());

        assert_eq!(values.len(), 2);
        assert_eq!(values[1].bucket - values[0].bucket, 1);
    }

    #[test]
    fn test_agreement_delta_bounds() {
        assert_eq!(agreement_delta(101.0, 101.0), 1.0);
        assert_eq!(agreement_delta(250.0, 101.0), 0.0);
        assert_eq!(agreement_delta(0.0, 0.0), 1.0);
        assert_eq!(agreement_delta(1.0, 0.0), 0.0);
        assert!((agreement_delta(99.0, 100.0) - 0.99).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn property_single_source_confidence_equals_reliability(
            reliability in 0.0f64..=1.0,
            value in -1_000.0f64..1_000.0,
        ) {
            let engine = engine(&[("only", reliability)]);
            let resolved = engine
                .resolve(&series(), 0, &[obs("only", value)], &HashSet::new())
                .unwrap()
                .value;
            prop_assert_eq!(resolved.confidence, reliability);
            prop_assert_eq!(resolved.value, value);
        }

        #[test]
        fn property_value_never_extrapolates(
            entries in proptest::collection::vec((1.0f64..500.0, 0.0f64..=1.0), 2..8),
        ) {
            let names: Vec<String> = (0..entries.len()).map(|i| format!("s{}", i)).collect();
            let scores: Vec<(&str, f64)> = names
                .iter()
                .zip(&entries)
                .map(|(n, (_, r))| (n.as_str(), *r))
                .collect();
            let engine = engine(&scores);
            let observations: Vec<Observation> = names
                .iter()
                .zip(&entries)
                .map(|(n, (v, _))| obs(n, *v))
                .collect();

            let resolved = engine
                .resolve(&series(), 0, &observations, &HashSet::new())
                .unwrap()
                .value;
            let lo = entries.iter().map(|(v, _)| *v).fold(f64::INFINITY, f64::min);
            let hi = entries.iter().map(|(v, _)| *v).fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(resolved.value >= lo && resolved.value <= hi);
            prop_assert!((0.0..=1.0).contains(&resolved.confidence));
        }
    }
}
