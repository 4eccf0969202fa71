//! Trend computation
//!
//! Turns a time-ordered group series into a `TrendRecord`:
//! - `growth_rate`: OLS slope over `(bucket offset, value)` divided by the
//!   series mean, in percent per bucket
//! - `strength`: weighted average of consistency (inverse relative residual
//!   spread around the fitted line) and completeness (present / expected
//!   buckets), scaled to 0-100
//! - `data_quality_score`: mean confidence of the contributing values
//! - `stage`: `classify_stage(growth_rate, strength, data_quality_score)`
//!
//! Every function here is pure; the only state is the window the caller passes in.

use crate::config::TrendConfig;
use crate::types::{BucketIndex, Confidence, Stage, TrendKey, TrendRecord, TrendSource};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Below this |mean| growth and relative spread are undefined
const MEAN_EPSILON: f64 = 1e-9;

/// One bucket of a group series
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPoint {
    pub value: f64,
    pub confidence: Confidence,
    /// Number of subjects averaged into this bucket
    pub subjects: usize,
    pub sources: BTreeSet<String>,
}

/// Average subject values per bucket
///
/// Input items are `(bucket, value, confidence, contributing sources)`.
pub fn aggregate<'a, I>(points: I) -> BTreeMap<BucketIndex, GroupPoint>
where
    I: IntoIterator<Item = (BucketIndex, f64, Confidence, &'a BTreeSet<String>)>,
{
    let mut sums: BTreeMap<BucketIndex, GroupPoint> = BTreeMap::new();
    for (bucket, value, confidence, sources) in points {
        let point = sums.entry(bucket).or_insert_with(|| GroupPoint {
            value: 0.0,
            confidence: 0.0,
            subjects: 0,
            sources: BTreeSet::new(),
        });
        point.value += value;
        point.confidence += confidence;
        point.subjects += 1;
        point.sources.extend(sources.iter().cloned());
    }
    for point in sums.values_mut() {
        let n = point.subjects as f64;
        point.value /= n;
        point.confidence /= n;
    }
    sums
}

/// Ordinary least-squares line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Population standard deviation of the residuals
    pub residual_std: f64,
}

/// Fit `y = slope * x + intercept`
///
/// # Returns
/// `None` with fewer than two points or when every `x` is identical
pub fn fit_ols(points: &[(f64, f64)]) -> Option<LinearFit> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if sxx <= 0.0 {
        return None;
    }
    let sxy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let residual_var = points
        .iter()
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum::<f64>()
        / n;

    Some(LinearFit {
        slope,
        intercept,
        residual_std: residual_var.sqrt(),
    })
}

/// Stage from `(growth_rate, strength, data_quality_score)` and thresholds only
pub fn classify_stage(
    growth_rate: f64,
    strength: f64,
    data_quality_score: f64,
    config: &TrendConfig,
) -> Stage {
    if strength >= config.act_strength && growth_rate.abs() >= config.significant_growth {
        if data_quality_score < config.min_quality_for_act {
            Stage::Prepare
        } else {
            Stage::Act
        }
    } else if strength < config.watch_strength {
        Stage::Watch
    } else {
        Stage::Prepare
    }
}

/// Resample to exactly `points` values for visualization
///
/// Takes the last `points` values when enough exist, otherwise linearly
/// interpolates across the available ones.
pub fn sample_values(values: &[f64], points: usize) -> Vec<f64> {
    match values.len() {
        0 => Vec::new(),
        1 => vec![values[0]; points],
        n if n >= points => values[n - points..].to_vec(),
        n => (0..points)
            .map(|i| {
                let position = i as f64 * (n - 1) as f64 / (points - 1).max(1) as f64;
                let lo = position.floor() as usize;
                let hi = (lo + 1).min(n - 1);
                let frac = position - lo as f64;
                values[lo] + (values[hi] - values[lo]) * frac
            })
            .collect(),
    }
}

/// Buckets of `series` inside the window that ends at its newest bucket
fn window(
    series: &BTreeMap<BucketIndex, GroupPoint>,
    window_buckets: usize,
) -> Vec<(BucketIndex, &GroupPoint)> {
    let Some(newest) = series.keys().next_back().copied() else {
        return Vec::new();
    };
    let oldest = newest - window_buckets as i64 + 1;
    series.range(oldest..=newest).map(|(b, p)| (*b, p)).collect()
}

/// Trend computation engine (stateless)
#[derive(Debug, Clone)]
pub struct TrendEngine {
    config: TrendConfig,
}

impl TrendEngine {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrendConfig {
        &self.config
    }

    /// Full statistical trend for one group series
    ///
    /// # Returns
    /// `None` when the window holds fewer than `min_buckets` buckets
    pub fn compute(
        &self,
        key: &TrendKey,
        series: &BTreeMap<BucketIndex, GroupPoint>,
        computed_at: DateTime<Utc>,
    ) -> Option<TrendRecord> {
        let points = window(series, self.config.window_buckets);
        if points.len() < self.config.min_buckets {
            return None;
        }

        let first = points[0].0;
        let xy: Vec<(f64, f64)> = points
            .iter()
            .map(|(bucket, p)| ((bucket - first) as f64, p.value))
            .collect();
        let fit = fit_ols(&xy)?;

        let values: Vec<f64> = points.iter().map(|(_, p)| p.value).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;

        let (growth_rate, consistency) = if mean.abs() < MEAN_EPSILON {
            let consistency = if fit.residual_std < MEAN_EPSILON { 1.0 } else { 0.0 };
            (0.0, consistency)
        } else {
            let growth = fit.slope / mean.abs() * 100.0;
            let relative_spread = fit.residual_std / mean.abs();
            (
                growth,
                1.0 / (1.0 + self.config.consistency_sensitivity * relative_spread),
            )
        };
        let completeness = self.completeness(points.len());
        let strength = (100.0
            * (self.config.consistency_weight * consistency
                + self.config.completeness_weight * completeness))
            .clamp(0.0, 100.0);

        Some(self.record(
            key,
            &points,
            growth_rate,
            strength,
            mean_confidence(&points),
            TrendSource::Computed,
            computed_at,
        ))
    }

    /// Lower-confidence trend without regression, for partial data
    ///
    /// Growth comes from the first and last buckets; strength is
    /// completeness-only and data quality is discounted.
    pub fn synthesize(
        &self,
        key: &TrendKey,
        series: &BTreeMap<BucketIndex, GroupPoint>,
        quality_discount: f64,
        computed_at: DateTime<Utc>,
    ) -> Option<TrendRecord> {
        let points = window(series, self.config.window_buckets);
        let (first_bucket, first) = points.first()?;
        let (last_bucket, last) = points.last()?;

        let span = (last_bucket - first_bucket) as f64;
        let growth_rate = if span > 0.0 && first.value.abs() >= MEAN_EPSILON {
            (last.value - first.value) / first.value.abs() / span * 100.0
        } else {
            0.0
        };
        let strength = 100.0 * self.config.completeness_weight * self.completeness(points.len());
        let quality = (mean_confidence(&points) * quality_discount).clamp(0.0, 1.0);

        Some(self.record(
            key,
            &points,
            growth_rate,
            strength,
            quality,
            TrendSource::Generated,
            computed_at,
        ))
    }

    fn completeness(&self, present: usize) -> f64 {
        (present as f64 / self.config.window_buckets as f64).min(1.0)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        key: &TrendKey,
        points: &[(BucketIndex, &GroupPoint)],
        growth_rate: f64,
        strength: f64,
        data_quality_score: f64,
        source: TrendSource,
        computed_at: DateTime<Utc>,
    ) -> TrendRecord {
        let values: Vec<f64> = points.iter().map(|(_, p)| p.value).collect();
        let score = values.iter().sum::<f64>() / values.len().max(1) as f64;
        let contributing_sources = points
            .iter()
            .flat_map(|(_, p)| p.sources.iter().cloned())
            .collect();

        TrendRecord {
            subject_group: key.subject_group.clone(),
            metric_name: key.metric_name.clone(),
            growth_rate,
            strength,
            stage: classify_stage(growth_rate, strength, data_quality_score, &self.config),
            data_quality_score,
            computed_at,
            source,
            score,
            trend_values: sample_values(&values, self.config.visualization_points),
            data_points: points.len(),
            contributing_sources,
        }
    }
}

fn mean_confidence(points: &[(BucketIndex, &GroupPoint)]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    points.iter().map(|(_, p)| p.confidence).sum::<f64>() / points.len() as f64
}

/// Strongest first, truncated to `max_trends`
pub fn rank(mut records: Vec<TrendRecord>, max_trends: usize) -> Vec<TrendRecord> {
    records.sort_by(|a, b| {
        b.strength
            .total_cmp(&a.strength)
            .then_with(|| a.key().cmp(&b.key()))
    });
    records.truncate(max_trends);
    records
}
