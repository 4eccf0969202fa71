//! Source reliability tracking
//!
//! Each source carries a trust score in [0, 1] that decays toward its
//! observed agreement with the reconciled consensus:
//!
//! `score' = clamp(score * decay + (1 - decay) * agreement_delta, 0, 1)`
//!
//! Scores live in per-source atomic cells and are updated with
//! compare-and-swap, so concurrent reconciliations of independent series
//! never serialise on a global lock. Updates are not transactional: a
//! superseded refresh cycle keeps whatever updates it already applied.

use crate::config::ReliabilityConfig;
use crate::types::Confidence;
use async_trait::async_trait;
use esg_common::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Injectable reliability store
///
/// `get`/`update` are synchronous bookkeeping; `load`/`persist` move the
/// scores to and from a durable backing store (no-ops for the in-memory
/// implementation).
#[async_trait]
pub trait ReliabilityStore: Send + Sync {
    /// Last known score, or the neutral score for unseen sources
    fn get(&self, source_id: &str) -> Confidence;

    /// Apply one decay step toward `agreement_delta`; returns the new score
    fn update(&self, source_id: &str, agreement_delta: f64) -> Confidence;

    /// All known scores
    fn snapshot(&self) -> BTreeMap<String, Confidence>;

    /// Load scores from the durable store; returns the number loaded
    async fn load(&self) -> Result<usize>;

    /// Write scores to the durable store; returns the number written
    async fn persist(&self) -> Result<usize>;
}

/// One decay step, clamped to [0, 1]
pub fn decayed_score(score: f64, decay: f64, agreement_delta: f64) -> f64 {
    let agreement = agreement_delta.clamp(0.0, 1.0);
    (score * decay + (1.0 - decay) * agreement).clamp(0.0, 1.0)
}

/// Concurrent score table shared by the store implementations
pub struct ReliabilityScores {
    decay: f64,
    neutral: f64,
    cells: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl ReliabilityScores {
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self {
            decay: config.decay,
            neutral: config.neutral_score,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, source_id: &str) -> Confidence {
        let cells = self.cells.read().unwrap_or_else(|e| e.into_inner());
        cells
            .get(source_id)
            .map(|cell| f64::from_bits(cell.load(Ordering::Acquire)))
            .unwrap_or(self.neutral)
    }

    pub fn update(&self, source_id: &str, agreement_delta: f64) -> Confidence {
        let cell = self.cell(source_id);
        let decay = self.decay;
        let previous = cell
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(decayed_score(f64::from_bits(bits), decay, agreement_delta).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        let updated = decayed_score(f64::from_bits(previous), decay, agreement_delta);

        debug!(
            source = source_id,
            previous = f64::from_bits(previous),
            updated,
            agreement_delta,
            "Reliability updated"
        );
        updated
    }

    pub fn snapshot(&self) -> BTreeMap<String, Confidence> {
        let cells = self.cells.read().unwrap_or_else(|e| e.into_inner());
        cells
            .iter()
            .map(|(source, cell)| (source.clone(), f64::from_bits(cell.load(Ordering::Acquire))))
            .collect()
    }

    /// Overwrite scores (used when loading from durable storage)
    pub fn restore(&self, scores: impl IntoIterator<Item = (String, Confidence)>) -> usize {
        let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for (source, score) in scores {
            let bits = score.clamp(0.0, 1.0).to_bits();
            match cells.get(&source) {
                Some(cell) => cell.store(bits, Ordering::Release),
                None => {
                    cells.insert(source, Arc::new(AtomicU64::new(bits)));
                }
            }
            count += 1;
        }
        count
    }

    /// Cell for a source, created at the neutral score on first sighting
    fn cell(&self, source_id: &str) -> Arc<AtomicU64> {
        {
            let cells = self.cells.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cell) = cells.get(source_id) {
                return Arc::clone(cell);
            }
        }
        let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            cells
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(self.neutral.to_bits()))),
        )
    }
}

/// Process-local store; scores last for the lifetime of the value
pub struct InMemoryReliabilityStore {
    scores: ReliabilityScores,
}

impl InMemoryReliabilityStore {
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self {
            scores: ReliabilityScores::new(config),
        }
    }

    /// Seed scores (tests and warm starts)
    pub fn with_scores(config: &ReliabilityConfig, scores: &[(&str, Confidence)]) -> Self {
        let store = Self::new(config);
        store
            .scores
            .restore(scores.iter().map(|(s, v)| (s.to_string(), *v)));
        store
    }
}

#[async_trait]
impl ReliabilityStore for InMemoryReliabilityStore {
    fn get(&self, source_id: &str) -> Confidence {
        self.scores.get(source_id)
    }

    fn update(&self, source_id: &str, agreement_delta: f64) -> Confidence {
        self.scores.update(source_id, agreement_delta)
    }

    fn snapshot(&self) -> BTreeMap<String, Confidence> {
        self.scores.snapshot()
    }

    async fn load(&self) -> Result<usize> {
        Ok(0)
    }

    async fn persist(&self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReliabilityConfig {
        ReliabilityConfig::default()
    }

    #[test]
    fn test_unseen_source_is_neutral() {
        let store = InMemoryReliabilityStore::new(&config());
        assert_eq!(store.get("never-seen"), 0.5);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_update_follows_decay_formula() {
        let store = InMemoryReliabilityStore::with_scores(&config(), &[("msci", 0.8)]);
        let updated = store.update("msci", 0.0);
        assert!((updated - 0.8 * 0.95).abs() < 1e-12);
        assert!((store.get("msci") - updated).abs() < 1e-12);
    }

    #[test]
    fn test_first_update_starts_from_neutral() {
        let store = InMemoryReliabilityStore::new(&config());
        let updated = store.update("new-feed", 1.0);
        assert!((updated - (0.5 * 0.95 + 0.05)).abs() < 1e-12);
    }

    #[test]
    fn test_agreement_delta_is_clamped() {
        assert_eq!(decayed_score(1.0, 0.95, 5.0), 1.0);
        assert!((decayed_score(0.0, 0.95, -3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_agreement_converges_toward_one() {
        let store = InMemoryReliabilityStore::new(&config());
        for _ in 0..200 {
            store.update("steady", 1.0);
        }
        assert!(store.get("steady") > 0.99);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        // With decay applied to identical agreement values the order of
        // updates does not matter, so N concurrent updates must equal N
        // sequential ones.
        let store = Arc::new(InMemoryReliabilityStore::new(&config()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.update("shared", 0.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected = 0.5 * 0.95f64.powi(400);
        assert!((store.get("shared") - expected).abs() < 1e-12);
    }
}
