//! Adaptive quality control
//!
//! Rules are regenerated from each series' trailing history on every
//! evaluation (`generate_rules` is a pure function of the history), so the
//! thresholds follow each metric's natural variance instead of fixed cutoffs.
//!
//! Per-source suppression is an explicit state machine:
//!
//! ```text
//!   Active{strikes} --(strikes reach suppress_after)--> Suppressed
//!   Suppressed      --(accepted recheck)--------------> Active{0}
//! ```
//!
//! A cycle in which a source is the dominant contributor to a rejected
//! value adds a strike; a clean cycle removes one.

use crate::config::QualityConfig;
use crate::types::{AssessedValue, QualityVerdict, ReconciledValue, RepairAction};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Envelope clip rule id
pub const RULE_ENVELOPE: &str = "envelope";
/// Hard rejection rule id
pub const RULE_HARD_REJECT: &str = "hard-reject";

/// σ floor as a fraction of |mean|, so flat histories keep a finite envelope
const MIN_RELATIVE_SIGMA: f64 = 0.01;
const MIN_ABSOLUTE_SIGMA: f64 = 1e-6;

// ============================================================================
// Rules
// ============================================================================

/// Statistical envelope `mean ± k·σ` over a trailing history
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Envelope {
    pub mean: f64,
    pub std_dev: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Rules for one series, valid for a single evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    pub envelope: Envelope,
    pub warn_threshold: f64,
    pub reject_threshold: f64,
}

/// Build the rule set from trailing history
///
/// # Returns
/// `None` when the history is shorter than `min_history`
pub fn generate_rules(history: &[f64], config: &QualityConfig) -> Option<RuleSet> {
    if history.len() < config.min_history {
        return None;
    }
    let start = history.len().saturating_sub(config.history_len);
    let trailing = &history[start..];

    let n = trailing.len() as f64;
    let mean = trailing.iter().sum::<f64>() / n;
    let variance = trailing.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let floor = (mean.abs() * MIN_RELATIVE_SIGMA).max(MIN_ABSOLUTE_SIGMA);
    let std_dev = variance.sqrt().max(floor);
    let half_width = config.envelope_k * std_dev;

    Some(RuleSet {
        envelope: Envelope {
            mean,
            std_dev,
            lower: mean - half_width,
            upper: mean + half_width,
        },
        warn_threshold: config.warn_threshold,
        reject_threshold: config.reject_threshold,
    })
}

impl RuleSet {
    /// Normalised deviation; 1.0 means exactly on the envelope boundary
    pub fn anomaly_score(&self, value: f64) -> f64 {
        let half_width = self.envelope.upper - self.envelope.mean;
        (value - self.envelope.mean).abs() / half_width
    }

    /// Nearest envelope boundary
    pub fn clip(&self, value: f64) -> f64 {
        if value >= self.envelope.mean {
            self.envelope.upper
        } else {
            self.envelope.lower
        }
    }

    /// Evaluate one value; returns the (possibly repaired) value and verdict
    pub fn evaluate(&self, value: f64) -> (f64, QualityVerdict) {
        let anomaly_score = self.anomaly_score(value);
        let applied_rule_ids = vec![RULE_ENVELOPE.to_string(), RULE_HARD_REJECT.to_string()];

        if anomaly_score <= self.warn_threshold {
            let verdict = QualityVerdict {
                passed: true,
                anomaly_score,
                applied_rule_ids,
                repair_action: RepairAction::None,
            };
            (value, verdict)
        } else if anomaly_score <= self.reject_threshold {
            let verdict = QualityVerdict {
                passed: true,
                anomaly_score,
                applied_rule_ids,
                repair_action: RepairAction::Clipped,
            };
            (self.clip(value), verdict)
        } else {
            let verdict = QualityVerdict {
                passed: false,
                anomaly_score,
                applied_rule_ids,
                repair_action: RepairAction::Dropped,
            };
            (value, verdict)
        }
    }
}

// ============================================================================
// Source suppression
// ============================================================================

/// Suppression state of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SourceState {
    Active { strikes: u32 },
    Suppressed { strikes: u32, since: DateTime<Utc> },
}

impl Default for SourceState {
    fn default() -> Self {
        SourceState::Active { strikes: 0 }
    }
}

impl SourceState {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, SourceState::Suppressed { .. })
    }

    pub fn strikes(&self) -> u32 {
        match self {
            SourceState::Active { strikes } | SourceState::Suppressed { strikes, .. } => *strikes,
        }
    }
}

/// State change produced by `end_cycle`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTransition {
    Suppressed { source_id: String, strikes: u32 },
    Restored { source_id: String },
}

/// What one cycle observed about sources, gathered across series
#[derive(Debug, Clone, Default)]
pub struct CycleQuality {
    /// Sources that took part in reconciliation this cycle
    pub participating: HashSet<String>,
    /// Sources that were the dominant contributor to a rejected value
    pub rejected_dominant: HashSet<String>,
    /// Suppressed sources whose recheck value was accepted
    pub rechecks_accepted: HashSet<String>,
    /// Number of dropped values
    pub rejections: usize,
}

impl CycleQuality {
    pub fn merge(&mut self, other: CycleQuality) {
        self.participating.extend(other.participating);
        self.rejected_dominant.extend(other.rejected_dominant);
        self.rechecks_accepted.extend(other.rechecks_accepted);
        self.rejections += other.rejections;
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Quality controller: rule evaluation plus per-source suppression state
#[derive(Debug)]
pub struct QualityController {
    config: QualityConfig,
    sources: BTreeMap<String, SourceState>,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            sources: BTreeMap::new(),
        }
    }

    /// Sources currently routed around
    pub fn suppressed_sources(&self) -> HashSet<String> {
        self.sources
            .iter()
            .filter(|(_, state)| state.is_suppressed())
            .map(|(source, _)| source.clone())
            .collect()
    }

    pub fn source_state(&self, source_id: &str) -> SourceState {
        self.sources.get(source_id).copied().unwrap_or_default()
    }

    pub fn source_states(&self) -> BTreeMap<String, SourceState> {
        self.sources.clone()
    }

    /// Apply one cycle's findings to the suppression state machine
    pub fn end_cycle(&mut self, cycle: &CycleQuality, now: DateTime<Utc>) -> Vec<SourceTransition> {
        let suppress_after = self.config.suppress_after;
        let mut transitions = Vec::new();

        let touched: HashSet<&String> = cycle
            .participating
            .iter()
            .chain(cycle.rejected_dominant.iter())
            .chain(cycle.rechecks_accepted.iter())
            .collect();

        for source_id in touched {
            let state = self.sources.entry(source_id.clone()).or_default();
            let next = match *state {
                SourceState::Suppressed { .. } if cycle.rechecks_accepted.contains(source_id) => {
                    info!(source = %source_id, "Source restored after accepted recheck");
                    transitions.push(SourceTransition::Restored {
                        source_id: source_id.clone(),
                    });
                    SourceState::Active { strikes: 0 }
                }
                SourceState::Suppressed { .. } => *state,
                SourceState::Active { strikes } if cycle.rejected_dominant.contains(source_id) => {
                    let strikes = strikes + 1;
                    if strikes >= suppress_after {
                        warn!(
                            source = %source_id,
                            strikes,
                            "Source suppressed after repeated rejections"
                        );
                        transitions.push(SourceTransition::Suppressed {
                            source_id: source_id.clone(),
                            strikes,
                        });
                        SourceState::Suppressed {
                            strikes,
                            since: now,
                        }
                    } else {
                        debug!(source = %source_id, strikes, "Rejection strike");
                        SourceState::Active { strikes }
                    }
                }
                SourceState::Active { strikes } => SourceState::Active {
                    strikes: strikes.saturating_sub(1),
                },
            };
            *state = next;
        }

        transitions
    }
}

/// Assess a reconciled value against its series history
///
/// `history` holds quality-passed values of the same series, oldest first,
/// strictly before `value.bucket`. Runs on the parallel series workers.
pub fn assess_value(config: &QualityConfig, mut value: ReconciledValue, history: &[f64]) -> AssessedValue {
    let raw_value = value.value;
    let verdict = match generate_rules(history, config) {
        Some(rules) => {
            let (repaired, verdict) = rules.evaluate(raw_value);
            value.value = repaired;
            verdict
        }
        None => QualityVerdict::unchecked(),
    };

    match verdict.repair_action {
        RepairAction::Clipped => debug!(
            subject = %value.subject_id,
            metric = %value.metric_name,
            bucket = value.bucket,
            raw = raw_value,
            clipped = value.value,
            anomaly_score = verdict.anomaly_score,
            "Value clipped to envelope"
        ),
        RepairAction::Dropped => warn!(
            subject = %value.subject_id,
            metric = %value.metric_name,
            bucket = value.bucket,
            value = raw_value,
            anomaly_score = verdict.anomaly_score,
            source = value.dominant_source.as_deref().unwrap_or("-"),
            "Value rejected"
        ),
        _ => {}
    }

    AssessedValue {
        value,
        raw_value,
        verdict,
    }
}

/// Evaluate a suppressed source's raw value; a rejected value is `Flagged`
pub fn recheck_value(config: &QualityConfig, raw_value: f64, history: &[f64]) -> QualityVerdict {
    match generate_rules(history, config) {
        Some(rules) => {
            let (_, mut verdict) = rules.evaluate(raw_value);
            if !verdict.passed {
                verdict.repair_action = RepairAction::Flagged;
            }
            verdict
        }
        None => QualityVerdict::unchecked(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn history() -> Vec<f64> {
        vec![98.0, 100.0, 102.0, 100.0, 99.0, 101.0, 100.0, 100.0]
    }

    fn reconciled(value: f64) -> ReconciledValue {
        ReconciledValue {
            subject_id: "AAPL".to_string(),
            metric_name: "environmental_score".to_string(),
            bucket: 10,
            value,
            confidence: 0.9,
            contributing_sources: BTreeSet::from(["msci".to_string()]),
            dropped_sources: BTreeSet::new(),
            conflicts_resolved: 0,
            dominant_source: Some("msci".to_string()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_short_history_passes_unchecked() {
        let config = QualityConfig::default();
        let assessed = assess_value(&config, reconciled(1_000.0), &[100.0, 101.0]);
        assert_eq!(assessed.verdict, QualityVerdict::unchecked());
        assert_eq!(assessed.value.value, 1_000.0);
    }

    #[test]
    fn test_in_envelope_value_untouched() {
        let config = QualityConfig::default();
        let assessed = assess_value(&config, reconciled(101.5), &history());
        assert!(assessed.verdict.passed);
        assert_eq!(assessed.verdict.repair_action, RepairAction::None);
        assert_eq!(assessed.value.value, 101.5);
        assert_eq!(
            assessed.verdict.applied_rule_ids,
            vec![RULE_ENVELOPE.to_string(), RULE_HARD_REJECT.to_string()]
        );
    }

    #[test]
    fn test_moderate_anomaly_is_clipped() {
        let config = QualityConfig::default();
        let rules = generate_rules(&history(), &config).unwrap();
        let candidate = rules.envelope.upper + 0.5 * (rules.envelope.upper - rules.envelope.mean);

        let assessed = assess_value(&config, reconciled(candidate), &history());
        assert!(assessed.verdict.passed);
        assert_eq!(assessed.verdict.repair_action, RepairAction::Clipped);
        assert_eq!(assessed.value.value, rules.envelope.upper);
        assert_eq!(assessed.raw_value, candidate);
        assert!((assessed.verdict.anomaly_score - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_hard_anomaly_is_dropped() {
        let config = QualityConfig::default();
        let assessed = assess_value(&config, reconciled(500.0), &history());
        assert!(!assessed.verdict.passed);
        assert_eq!(assessed.verdict.repair_action, RepairAction::Dropped);
    }

    #[test]
    fn test_flat_history_keeps_finite_envelope() {
        let config = QualityConfig::default();
        let rules = generate_rules(&[50.0; 10], &config).unwrap();
        assert!(rules.envelope.upper > 50.0);
        assert!(rules.anomaly_score(50.2).is_finite());
        assert!(rules.anomaly_score(50.2) < 1.0);
    }

    #[test]
    fn test_rules_use_trailing_history_only() {
        let config = QualityConfig {
            history_len: 5,
            ..QualityConfig::default()
        };
        let mut long = vec![1_000.0; 20];
        long.extend([10.0, 10.0, 10.0, 10.0, 10.0]);
        let rules = generate_rules(&long, &config).unwrap();
        assert_eq!(rules.envelope.mean, 10.0);
    }

    #[test]
    fn test_rejected_suppressed_value_is_flagged() {
        let config = QualityConfig::default();
        let verdict = recheck_value(&config, 500.0, &history());
        assert!(!verdict.passed);
        assert_eq!(verdict.repair_action, RepairAction::Flagged);

        let verdict = recheck_value(&config, 100.0, &history());
        assert!(verdict.passed);
    }

    #[test]
    fn test_repeated_rejections_suppress_source() {
        let mut controller = QualityController::new(QualityConfig::default());
        let mut cycle = CycleQuality::default();
        cycle.participating.insert("scraper".to_string());
        cycle.rejected_dominant.insert("scraper".to_string());

        assert!(controller.end_cycle(&cycle, now()).is_empty());
        assert!(controller.end_cycle(&cycle, now()).is_empty());
        let transitions = controller.end_cycle(&cycle, now());

        assert_eq!(
            transitions,
            vec![SourceTransition::Suppressed {
                source_id: "scraper".to_string(),
                strikes: 3
            }]
        );
        assert!(controller.suppressed_sources().contains("scraper"));
    }

    #[test]
    fn test_clean_cycle_decays_strikes() {
        let mut controller = QualityController::new(QualityConfig::default());
        let mut bad = CycleQuality::default();
        bad.participating.insert("feed".to_string());
        bad.rejected_dominant.insert("feed".to_string());
        let mut clean = CycleQuality::default();
        clean.participating.insert("feed".to_string());

        controller.end_cycle(&bad, now());
        controller.end_cycle(&bad, now());
        controller.end_cycle(&clean, now());
        controller.end_cycle(&bad, now());

        // 2 strikes, -1, +1: still below the threshold of 3
        assert_eq!(controller.source_state("feed"), SourceState::Active { strikes: 2 });
    }

    #[test]
    fn test_accepted_recheck_restores_source() {
        let config = QualityConfig {
            suppress_after: 1,
            ..QualityConfig::default()
        };
        let mut controller = QualityController::new(config);
        let mut bad = CycleQuality::default();
        bad.rejected_dominant.insert("feed".to_string());
        controller.end_cycle(&bad, now());
        assert!(controller.source_state("feed").is_suppressed());

        // Suppressed sources ignore further strikes and clean cycles
        controller.end_cycle(&CycleQuality::default(), now());
        assert!(controller.source_state("feed").is_suppressed());

        let mut recheck = CycleQuality::default();
        recheck.rechecks_accepted.insert("feed".to_string());
        let transitions = controller.end_cycle(&recheck, now());
        assert_eq!(
            transitions,
            vec![SourceTransition::Restored {
                source_id: "feed".to_string()
            }]
        );
        assert_eq!(controller.source_state("feed"), SourceState::Active { strikes: 0 });
    }

    proptest! {
        #[test]
        fn property_clipped_values_lie_on_boundary(
            history in proptest::collection::vec(-500.0f64..500.0, 5..40),
            candidate in -5_000.0f64..5_000.0,
        ) {
            let config = QualityConfig::default();
            let rules = generate_rules(&history, &config).unwrap();
            let (repaired, verdict) = rules.evaluate(candidate);
            if verdict.repair_action == RepairAction::Clipped {
                prop_assert!(repaired == rules.envelope.upper || repaired == rules.envelope.lower);
            }
            if verdict.passed {
                let slack = 1e-9 * (1.0 + rules.envelope.upper.abs() + rules.envelope.lower.abs());
                prop_assert!(repaired >= rules.envelope.lower - slack);
                prop_assert!(repaired <= rules.envelope.upper + slack);
            }
        }
    }
}
