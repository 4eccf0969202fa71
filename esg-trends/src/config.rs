//! Engine configuration
//!
//! Every numeric threshold used by the engine is a tunable default here.
//! Resolution priority: environment overrides → TOML `[engine]` table →
//! compiled defaults.

use esg_common::config::TomlConfig;
use esg_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Refresh timer interval override (seconds)
pub const ENV_REFRESH_INTERVAL: &str = "ESG_TRENDS_REFRESH_INTERVAL_SECS";
/// Cache staleness ceiling override (seconds)
pub const ENV_STALENESS_CEILING: &str = "ESG_TRENDS_STALENESS_CEILING_SECS";
/// Reliability decay override
pub const ENV_RELIABILITY_DECAY: &str = "ESG_TRENDS_RELIABILITY_DECAY";
/// Agreement tolerance override
pub const ENV_AGREEMENT_TOLERANCE: &str = "ESG_TRENDS_AGREEMENT_TOLERANCE";

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reliability: ReliabilityConfig,
    pub reconciliation: ReconciliationConfig,
    pub quality: QualityConfig,
    pub trend: TrendConfig,
    pub fallback: FallbackConfig,
    pub scheduler: SchedulerConfig,
    pub groups: GroupsConfig,
}

/// Source reliability bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Per-cycle decay; `score' = score * decay + (1 - decay) * agreement`
    pub decay: f64,
    /// Score reported for sources never seen before
    pub neutral_score: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            decay: 0.95,
            neutral_score: 0.5,
        }
    }
}

/// Multi-source reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Bucket width in seconds (one day by default)
    pub bucket_seconds: i64,
    /// Relative tolerance within which values agree
    pub agreement_tolerance: f64,
    /// Standard deviations below mean reliability that mark an outlier source
    pub outlier_sigma: f64,
    /// Confidence penalty scaled by the dropped fraction
    pub conflict_penalty: f64,
    /// Confidence penalty scaled by the fraction of kept values still in disagreement
    pub unresolved_penalty: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 86_400,
            agreement_tolerance: 0.10,
            outlier_sigma: 2.0,
            conflict_penalty: 0.5,
            unresolved_penalty: 0.25,
        }
    }
}

/// Adaptive quality control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Envelope half-width in standard deviations
    pub envelope_k: f64,
    /// Anomaly score above which values are clipped
    pub warn_threshold: f64,
    /// Anomaly score above which values are dropped
    pub reject_threshold: f64,
    /// Trailing values required before an envelope exists
    pub min_history: usize,
    /// Trailing values used to build the envelope
    pub history_len: usize,
    /// Rejection strikes that suppress a source
    pub suppress_after: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            envelope_k: 3.0,
            warn_threshold: 1.0,
            reject_threshold: 2.0,
            min_history: 5,
            history_len: 30,
            suppress_after: 3,
        }
    }
}

/// Trend statistics and stage classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Rolling window length in buckets
    pub window_buckets: usize,
    /// Buckets required before a trend is emitted
    pub min_buckets: usize,
    pub consistency_weight: f64,
    pub completeness_weight: f64,
    /// Scales relative residual spread into the consistency score
    pub consistency_sensitivity: f64,
    /// Strength at or above which a significant trend is `Act`
    pub act_strength: f64,
    /// Strength below which a trend is `Watch`
    pub watch_strength: f64,
    /// Absolute growth (% per bucket) that counts as significant
    pub significant_growth: f64,
    /// Data quality below which `Act` is demoted to `Prepare`
    pub min_quality_for_act: f64,
    /// Length of `TrendRecord::trend_values`
    pub visualization_points: usize,
    /// Published records are truncated to this many, strongest first
    pub max_trends: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window_buckets: 90,
            min_buckets: 5,
            consistency_weight: 0.6,
            completeness_weight: 0.4,
            consistency_sensitivity: 10.0,
            act_strength: 70.0,
            watch_strength: 40.0,
            significant_growth: 0.25,
            min_quality_for_act: 0.3,
            visualization_points: 12,
            max_trends: 8,
        }
    }
}

/// Fallback tier selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Maximum age of a cached computed generation
    pub staleness_ceiling_secs: i64,
    /// Multiplier applied to data quality of generated records
    pub generated_quality_discount: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            staleness_ceiling_secs: 24 * 3600,
            generated_quality_discount: 0.5,
        }
    }
}

impl FallbackConfig {
    pub fn staleness_ceiling(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_ceiling_secs)
    }
}

/// Periodic refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub refresh_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Subject → sector → trend category mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    /// Subject identifier → sector
    pub subject_sectors: BTreeMap<String, String>,
    /// Sector → trend category (the published `subject_group`)
    pub sector_categories: BTreeMap<String, String>,
    /// Category for subjects whose sector is unknown
    pub default_category: String,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        let subject_sectors = [
            ("AAPL", "Technology"),
            ("MSFT", "Technology"),
            ("GOOGL", "Technology"),
            ("NVDA", "Technology"),
            ("META", "Technology"),
            ("AMZN", "Consumer Discretionary"),
            ("TSLA", "Consumer Discretionary"),
            ("HD", "Consumer Discretionary"),
            ("JPM", "Financials"),
            ("BAC", "Financials"),
            ("JNJ", "Healthcare"),
            ("UNH", "Healthcare"),
            ("PG", "Consumer Staples"),
            ("XOM", "Energy"),
            ("CVX", "Energy"),
        ];
        let sector_categories = [
            ("Technology", "Climate Tech"),
            ("Energy", "Renewable Energy"),
            ("Financials", "Sustainable Finance"),
            ("Healthcare", "Sustainable Healthcare"),
            ("Consumer Discretionary", "Circular Economy"),
            ("Consumer Staples", "Sustainable Agriculture"),
            ("Industrials", "Green Manufacturing"),
            ("Materials", "Green Materials"),
            ("Utilities", "Clean Energy"),
            ("Real Estate", "Green Buildings"),
        ];

        Self {
            subject_sectors: subject_sectors
                .iter()
                .map(|(s, sector)| (s.to_string(), sector.to_string()))
                .collect(),
            sector_categories: sector_categories
                .iter()
                .map(|(sector, c)| (sector.to_string(), c.to_string()))
                .collect(),
            default_category: "Emerging Sustainability".to_string(),
        }
    }
}

impl EngineConfig {
    /// Build from the `[engine]` table of a loaded TOML file, then apply
    /// environment overrides and validate.
    pub fn from_toml(toml_config: &TomlConfig) -> Result<Self> {
        let mut config: EngineConfig = toml::Value::Table(toml_config.engine.clone())
            .try_into()
            .map_err(|e| Error::Config(format!("Invalid [engine] table: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ESG_TRENDS_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(secs) = env_parse::<u64>(ENV_REFRESH_INTERVAL)? {
            info!("Refresh interval overridden from environment: {}s", secs);
            self.scheduler.refresh_interval_secs = secs;
        }
        if let Some(secs) = env_parse::<i64>(ENV_STALENESS_CEILING)? {
            info!("Staleness ceiling overridden from environment: {}s", secs);
            self.fallback.staleness_ceiling_secs = secs;
        }
        if let Some(decay) = env_parse::<f64>(ENV_RELIABILITY_DECAY)? {
            info!("Reliability decay overridden from environment: {}", decay);
            self.reliability.decay = decay;
        }
        if let Some(tolerance) = env_parse::<f64>(ENV_AGREEMENT_TOLERANCE)? {
            info!("Agreement tolerance overridden from environment: {}", tolerance);
            self.reconciliation.agreement_tolerance = tolerance;
        }
        Ok(())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let r = &self.reliability;
        if !(r.decay > 0.0 && r.decay < 1.0) {
            return Err(Error::Config(format!(
                "reliability.decay must be in (0, 1), got {}",
                r.decay
            )));
        }
        if !(0.0..=1.0).contains(&r.neutral_score) {
            return Err(Error::Config(format!(
                "reliability.neutral_score must be in [0, 1], got {}",
                r.neutral_score
            )));
        }

        let rc = &self.reconciliation;
        if rc.bucket_seconds <= 0 {
            return Err(Error::Config("reconciliation.bucket_seconds must be positive".to_string()));
        }
        if rc.agreement_tolerance < 0.0 {
            return Err(Error::Config(
                "reconciliation.agreement_tolerance must not be negative".to_string(),
            ));
        }
        for (name, penalty) in [
            ("conflict_penalty", rc.conflict_penalty),
            ("unresolved_penalty", rc.unresolved_penalty),
        ] {
            if !(0.0..=1.0).contains(&penalty) {
                return Err(Error::Config(format!(
                    "reconciliation.{} must be in [0, 1], got {}",
                    name, penalty
                )));
            }
        }

        let q = &self.quality;
        if q.envelope_k <= 0.0 {
            return Err(Error::Config("quality.envelope_k must be positive".to_string()));
        }
        if q.warn_threshold > q.reject_threshold {
            return Err(Error::Config(format!(
                "quality.warn_threshold ({}) exceeds reject_threshold ({})",
                q.warn_threshold, q.reject_threshold
            )));
        }
        if q.min_history < 2 || q.history_len < q.min_history {
            return Err(Error::Config(
                "quality.min_history must be >= 2 and <= history_len".to_string(),
            ));
        }
        if q.suppress_after == 0 {
            return Err(Error::Config("quality.suppress_after must be positive".to_string()));
        }

        let t = &self.trend;
        if t.window_buckets == 0 || t.min_buckets < 2 || t.min_buckets > t.window_buckets {
            return Err(Error::Config(format!(
                "trend.min_buckets ({}) must be in [2, window_buckets ({})]",
                t.min_buckets, t.window_buckets
            )));
        }
        if ((t.consistency_weight + t.completeness_weight) - 1.0).abs() > 1e-9 {
            return Err(Error::Config(
                "trend.consistency_weight + completeness_weight must equal 1".to_string(),
            ));
        }
        if t.watch_strength > t.act_strength {
            return Err(Error::Config(format!(
                "trend.watch_strength ({}) exceeds act_strength ({})",
                t.watch_strength, t.act_strength
            )));
        }
        if t.visualization_points < 2 || t.max_trends == 0 {
            return Err(Error::Config(
                "trend.visualization_points must be >= 2 and max_trends positive".to_string(),
            ));
        }

        if self.fallback.staleness_ceiling_secs <= 0 {
            return Err(Error::Config(
                "fallback.staleness_ceiling_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.refresh_interval_secs == 0 {
            return Err(Error::Config(
                "scheduler.refresh_interval_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse an optional environment variable; blank values are ignored
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => {
            warn!("{} is set but empty, ignoring", name);
            Ok(None)
        }
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={} is invalid: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}
