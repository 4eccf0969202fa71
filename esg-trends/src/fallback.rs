//! Fallback orchestration
//!
//! Decides which generation of trend records is live. Tier selection is
//! an ordered list of predicate → tier rules evaluated top-down; the last
//! rule always applies, so selection is total and deterministic.
//!
//! | Tier      | Applies when                                          |
//! |-----------|-------------------------------------------------------|
//! | Computed  | the cycle produced at least one fresh record          |
//! | Cached    | a computed generation younger than the ceiling exists |
//! | Generated | reconciled values exist without full statistics       |
//! | Fallback  | always                                                |

use crate::config::{FallbackConfig, TrendConfig};
use crate::trend::{classify_stage, rank};
use crate::types::{TrendKey, TrendRecord, TrendSource};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

/// Metric name carried by the placeholder records
pub const PLACEHOLDER_METRIC: &str = "esg_score";

// ============================================================================
// Tier selection
// ============================================================================

/// Facts the tier rules look at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierInputs {
    pub fresh_records: usize,
    /// Age of the last computed generation, if one exists
    pub cache_age: Option<Duration>,
    pub raw_data_present: bool,
}

/// One predicate → tier rule
pub struct TierRule {
    pub tier: TrendSource,
    pub applies: fn(&TierInputs, &FallbackConfig) -> bool,
}

/// Ordered tier rules; the first applicable one wins
pub const TIER_RULES: [TierRule; 4] = [
    TierRule {
        tier: TrendSource::Computed,
        applies: |inputs, _| inputs.fresh_records > 0,
    },
    TierRule {
        tier: TrendSource::Cached,
        applies: |inputs, config| {
            inputs
                .cache_age
                .is_some_and(|age| age <= config.staleness_ceiling())
        },
    },
    TierRule {
        tier: TrendSource::Generated,
        applies: |inputs, _| inputs.raw_data_present,
    },
    TierRule {
        tier: TrendSource::Fallback,
        applies: |_, _| true,
    },
];

/// Choose the tier for a cycle
pub fn select_tier(inputs: &TierInputs, config: &FallbackConfig) -> TrendSource {
    TIER_RULES
        .iter()
        .find(|rule| (rule.applies)(inputs, config))
        .map(|rule| rule.tier)
        .unwrap_or(TrendSource::Fallback)
}

// ============================================================================
// Generations
// ============================================================================

/// A set of records produced together
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub computed_at: DateTime<Utc>,
    /// When the data behind this generation last changed; a recompute
    /// without new observations keeps the previous value
    pub data_as_of: DateTime<Utc>,
    pub records: Vec<TrendRecord>,
}

/// The set currently handed to the visualization boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveSet {
    pub trends: Vec<TrendRecord>,
    pub source: TrendSource,
    pub computed_at: DateTime<Utc>,
    /// The selected tier produced nothing and an older set was republished
    pub exhausted: bool,
}

/// What a cycle offers the orchestrator
pub struct CycleInput<G>
where
    G: FnOnce() -> Vec<TrendRecord>,
{
    /// Records computed fresh this cycle
    pub fresh: Vec<TrendRecord>,
    /// Some bucket was reconciled this cycle
    pub new_data: bool,
    pub raw_data_present: bool,
    /// Builds generated records; only called when that tier is selected
    pub generate: G,
}

/// Owner of the live trend set
#[derive(Debug)]
pub struct FallbackOrchestrator {
    config: FallbackConfig,
    trend_config: TrendConfig,
    last_computed: Option<Generation>,
    live: Option<LiveSet>,
}

impl FallbackOrchestrator {
    pub fn new(config: FallbackConfig, trend_config: TrendConfig) -> Self {
        Self {
            config,
            trend_config,
            last_computed: None,
            live: None,
        }
    }

    /// Seed the cache with a persisted computed generation
    pub fn restore(&mut self, generation: Generation) {
        info!(
            "Restored computed generation from {} ({} records)",
            generation.computed_at,
            generation.records.len()
        );
        self.last_computed = Some(generation);
    }

    pub fn live(&self) -> Option<&LiveSet> {
        self.live.as_ref()
    }

    pub fn last_computed(&self) -> Option<&Generation> {
        self.last_computed.as_ref()
    }

    /// Age of the data behind the last computed generation
    pub fn cache_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_computed.as_ref().map(|g| now - g.data_as_of)
    }

    /// Run the tier rules for one cycle and publish the result
    pub fn evaluate<G>(&mut self, input: CycleInput<G>, now: DateTime<Utc>) -> LiveSet
    where
        G: FnOnce() -> Vec<TrendRecord>,
    {
        let inputs = TierInputs {
            fresh_records: input.fresh.len(),
            cache_age: self.cache_age(now),
            raw_data_present: input.raw_data_present,
        };
        let tier = select_tier(&inputs, &self.config);

        let candidate = match tier {
            TrendSource::Computed => {
                let generation = self.merge_generation(input.fresh, input.new_data, now);
                self.last_computed = Some(generation.clone());
                Some(self.live_set(generation.records, TrendSource::Computed, now))
            }
            TrendSource::Cached => self.cached(now),
            TrendSource::Generated => {
                let records = (input.generate)();
                Some(self.live_set(records, TrendSource::Generated, now))
            }
            TrendSource::Fallback => {
                warn!("No usable trend data, publishing placeholder set");
                Some(self.live_set(self.placeholders(now), TrendSource::Fallback, now))
            }
        };

        let live = match candidate {
            Some(set) if !set.trends.is_empty() => set,
            _ => self.exhausted(now),
        };
        self.live = Some(live.clone());
        live
    }

    /// Fresh records plus still-valid records of the previous generation
    fn merge_generation(&self, fresh: Vec<TrendRecord>, new_data: bool, now: DateTime<Utc>) -> Generation {
        let fresh_keys: HashSet<TrendKey> = fresh.iter().map(TrendRecord::key).collect();
        let ceiling = self.config.staleness_ceiling();

        let mut records = fresh;
        if let Some(previous) = &self.last_computed {
            records.extend(
                previous
                    .records
                    .iter()
                    .filter(|r| !fresh_keys.contains(&r.key()))
                    .filter(|r| now - r.computed_at <= ceiling)
                    .map(|r| r.relabel(TrendSource::Cached)),
            );
        }

        let data_as_of = match &self.last_computed {
            Some(previous) if !new_data => previous.data_as_of,
            _ => now,
        };

        Generation {
            computed_at: now,
            data_as_of,
            records,
        }
    }

    fn cached(&self, now: DateTime<Utc>) -> Option<LiveSet> {
        let generation = self.last_computed.as_ref()?;
        let ceiling = self.config.staleness_ceiling();
        let records: Vec<TrendRecord> = generation
            .records
            .iter()
            .filter(|r| now - r.computed_at <= ceiling)
            .map(|r| r.relabel(TrendSource::Cached))
            .collect();
        Some(self.live_set(records, TrendSource::Cached, generation.computed_at))
    }

    fn exhausted(&self, now: DateTime<Utc>) -> LiveSet {
        warn!("Selected tier produced no records, republishing last known-good set");
        match &self.live {
            Some(previous) => LiveSet {
                exhausted: true,
                ..previous.clone()
            },
            None => LiveSet {
                trends: self.placeholders(now),
                source: TrendSource::Fallback,
                computed_at: now,
                exhausted: true,
            },
        }
    }

    fn live_set(&self, records: Vec<TrendRecord>, source: TrendSource, computed_at: DateTime<Utc>) -> LiveSet {
        LiveSet {
            trends: rank(records, self.trend_config.max_trends),
            source,
            computed_at,
            exhausted: false,
        }
    }

    /// Minimal, explicitly labelled placeholder set
    pub fn placeholders(&self, now: DateTime<Utc>) -> Vec<TrendRecord> {
        [
            ("Climate Tech", 25.0, 75.0, 65.0),
            ("Renewable Energy", 20.0, 70.0, 60.0),
            ("Sustainable Finance", 15.0, 65.0, 55.0),
        ]
        .into_iter()
        .map(|(group, growth_rate, strength, start)| {
            // Ramp from `start` to `strength` over the first half, then flat
            let points = self.trend_config.visualization_points;
            let ramp = (points / 2).max(1);
            let trend_values = (0..points)
                .map(|i| start + (strength - start) * (i.min(ramp) as f64 / ramp as f64))
                .collect();

            TrendRecord {
                subject_group: group.to_string(),
                metric_name: PLACEHOLDER_METRIC.to_string(),
                growth_rate,
                strength,
                stage: classify_stage(growth_rate, strength, 0.0, &self.trend_config),
                data_quality_score: 0.0,
                computed_at: now,
                source: TrendSource::Fallback,
                score: strength,
                trend_values,
                data_points: 0,
                contributing_sources: BTreeSet::new(),
            }
        })
        .collect()
    }
}
