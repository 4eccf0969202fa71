//! Trend service
//!
//! Entry points used by the normalizer (`submit_observations`) and by the
//! visualization boundary (`refresh_trends`, `get_health`).
//!
//! # Refresh cycle
//! 1. Collect ledger buckets whose revision changed since they were last
//!    reconciled
//! 2. Reconcile and quality-check each series in parallel (blocking pool);
//!    reliability scores are updated as a side effect
//! 3. Merge results into the window buffers, advance the source
//!    suppression state machine, persist reliability scores when any
//!    bucket was reconciled
//! 4. Compute trends for every group/metric key touched this cycle
//!    (forced refresh: also keys whose newest data is within the staleness
//!    ceiling)
//! 5. Let the fallback orchestrator pick the live tier, archive computed
//!    generations, assess health
//!
//! Concurrent refresh requests attach to the running cycle. A forced
//! refresh cancels the running cycle and starts a new one; reliability
//! updates already applied by the cancelled cycle are kept.

use crate::coalesce::InFlight;
use crate::config::{EngineConfig, QualityConfig};
use crate::error::{Error, Result};
use crate::fallback::{CycleInput, FallbackOrchestrator, LiveSet};
use crate::groups::SubjectGroups;
use crate::health::{HealthMonitor, HealthReport, PipelineCounters};
use crate::ledger::{ObservationLedger, PendingBucket, SubmitReceipt};
use crate::quality::{assess_value, recheck_value, CycleQuality, QualityController, SourceState, SourceTransition};
use crate::reconciliation::ReconciliationEngine;
use crate::reliability::ReliabilityStore;
use crate::store::TrendArchive;
use crate::trend::{aggregate, GroupPoint, TrendEngine};
use crate::types::{
    bucket_of, AssessedValue, BucketIndex, Confidence, HealthStatus, Observation, SeriesKey,
    TrendKey, TrendRecord, TrendSource,
};
use chrono::{DateTime, Utc};
use esg_common::events::{EventBus, TrendEvent};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one `refresh_trends` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
    pub cycle_id: Uuid,
    pub trends: Vec<TrendRecord>,
    pub source: TrendSource,
    pub computed_at: DateTime<Utc>,
    pub status: HealthStatus,
    /// The selected tier produced nothing; `trends` is the last known-good set
    pub exhausted: bool,
}

/// Mutable pipeline state, owned by whichever cycle holds the lock
struct PipelineState {
    /// Assessed values per series and bucket
    windows: HashMap<SeriesKey, BTreeMap<BucketIndex, AssessedValue>>,
    /// Ledger revision last reconciled per series and bucket
    revisions: HashMap<SeriesKey, BTreeMap<BucketIndex, u64>>,
    quality: QualityController,
    orchestrator: FallbackOrchestrator,
    counters: PipelineCounters,
}

/// Output of one series worker
struct SeriesOutcome {
    series: SeriesKey,
    revisions: Vec<(BucketIndex, u64)>,
    assessed: Vec<AssessedValue>,
    quality: CycleQuality,
}

struct Inner {
    config: EngineConfig,
    groups: SubjectGroups,
    reconciliation: Arc<ReconciliationEngine>,
    trend_engine: TrendEngine,
    health: HealthMonitor,
    archive: Arc<dyn TrendArchive>,
    events: EventBus,
    ledger: Mutex<ObservationLedger>,
    pipeline: Mutex<PipelineState>,
    cycles: InFlight<(), Option<RefreshOutcome>>,
    computations: InFlight<TrendKey, Option<TrendRecord>>,
}

/// Cheap-to-clone handle to the trend engine
#[derive(Clone)]
pub struct TrendService {
    inner: Arc<Inner>,
}

impl TrendService {
    pub fn new(
        config: EngineConfig,
        reliability: Arc<dyn ReliabilityStore>,
        archive: Arc<dyn TrendArchive>,
        events: EventBus,
    ) -> Self {
        let reconciliation = Arc::new(ReconciliationEngine::new(
            config.reconciliation.clone(),
            reliability,
        ));
        let pipeline = PipelineState {
            windows: HashMap::new(),
            revisions: HashMap::new(),
            quality: QualityController::new(config.quality.clone()),
            orchestrator: FallbackOrchestrator::new(config.fallback.clone(), config.trend.clone()),
            counters: PipelineCounters::default(),
        };

        Self {
            inner: Arc::new(Inner {
                groups: SubjectGroups::new(config.groups.clone()),
                trend_engine: TrendEngine::new(config.trend.clone()),
                health: HealthMonitor::new(),
                ledger: Mutex::new(ObservationLedger::new(config.reconciliation.bucket_seconds)),
                pipeline: Mutex::new(pipeline),
                cycles: InFlight::new(),
                computations: InFlight::new(),
                reconciliation,
                archive,
                events,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Load reliability scores and the latest computed generation
    pub async fn restore(&self) -> Result<()> {
        let scores = self.inner.reconciliation.reliability().load().await?;
        let generation = self.inner.archive.latest_computed().await?;

        let mut state = self.inner.pipeline.lock().await;
        match generation {
            Some(generation) => state.orchestrator.restore(generation),
            None => info!("No archived trend generation to restore"),
        }
        info!("Trend service restored ({} reliability scores)", scores);
        Ok(())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Batch ingestion for one `(subject_id, metric_name)`
    ///
    /// Idempotent per `(source_id, subject_id, metric_name, observed_at)`.
    /// Malformed observations are counted in the receipt, not raised.
    pub async fn submit_observations(
        &self,
        subject_id: &str,
        metric_name: &str,
        observations: Vec<Observation>,
    ) -> Result<SubmitReceipt> {
        if subject_id.trim().is_empty() || metric_name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "subject_id and metric_name must not be empty".to_string(),
            ));
        }

        let oldest = self.retention_floor(Utc::now());
        let receipt = self
            .inner
            .ledger
            .lock()
            .await
            .submit(subject_id, metric_name, observations, oldest);

        debug!(
            subject = subject_id,
            metric = metric_name,
            accepted = receipt.accepted,
            duplicates = receipt.duplicates,
            rejected = receipt.rejected.len(),
            "Observations submitted"
        );
        for (index, reason) in &receipt.rejected {
            warn!(subject = subject_id, metric = metric_name, index, "Observation rejected: {}", reason);
        }
        Ok(receipt)
    }

    pub fn get_reliability(&self, source_id: &str) -> Confidence {
        self.inner.reconciliation.reliability().get(source_id)
    }

    pub fn reliability_snapshot(&self) -> BTreeMap<String, Confidence> {
        self.inner.reconciliation.reliability().snapshot()
    }

    /// Write reliability scores to the durable store
    pub async fn persist_reliability(&self) -> Result<usize> {
        match self.inner.reconciliation.reliability().persist().await {
            Ok(count) => {
                info!("Persisted {} source reliability scores", count);
                Ok(count)
            }
            Err(e) => {
                self.inner.pipeline.lock().await.counters.store_failures += 1;
                Err(e)
            }
        }
    }

    /// Suppression state of every source seen so far
    pub async fn source_states(&self) -> BTreeMap<String, SourceState> {
        self.inner.pipeline.lock().await.quality.source_states()
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Run (or join) a refresh cycle
    pub async fn refresh_trends(&self, force: bool) -> RefreshOutcome {
        self.refresh_trends_at(force, Utc::now()).await
    }

    /// `refresh_trends` evaluated at an explicit instant
    pub async fn refresh_trends_at(&self, force: bool, now: DateTime<Utc>) -> RefreshOutcome {
        let mut supersede = force;
        loop {
            let service = self.clone();
            let result = self
                .inner
                .cycles
                .run((), supersede, move |token| async move {
                    service.run_cycle(force, now, token).await
                })
                .await;

            match result {
                Some(outcome) => return outcome,
                None => {
                    debug!("Refresh cycle superseded, attaching to the newer cycle");
                    supersede = false;
                }
            }
        }
    }

    /// Health of the currently published set
    pub async fn get_health(&self) -> HealthReport {
        let state = self.inner.pipeline.lock().await;
        self.inner
            .health
            .assess(state.orchestrator.live(), &state.counters, Utc::now())
    }

    /// Currently published set, if any
    pub async fn live_trends(&self) -> Option<LiveSet> {
        self.inner.pipeline.lock().await.orchestrator.live().cloned()
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    async fn run_cycle(
        &self,
        force: bool,
        now: DateTime<Utc>,
        token: CancellationToken,
    ) -> Option<RefreshOutcome> {
        let cycle_id = Uuid::new_v4();
        let inner = &self.inner;

        let mut guard = tokio::select! {
            _ = token.cancelled() => return None,
            guard = inner.pipeline.lock() => guard,
        };
        let state = &mut *guard;

        let oldest = self.retention_floor(now);

        // Step 1: changed buckets
        let pending = {
            let mut ledger = inner.ledger.lock().await;
            ledger.prune_before(oldest);
            ledger.pending(|series, bucket| {
                state
                    .revisions
                    .get(series)
                    .and_then(|revisions| revisions.get(&bucket))
                    .copied()
            })
        };
        prune_windows(&mut state.windows, oldest);
        prune_windows(&mut state.revisions, oldest);

        let mut by_series: BTreeMap<SeriesKey, Vec<PendingBucket>> = BTreeMap::new();
        for bucket in pending {
            by_series.entry(bucket.series.clone()).or_default().push(bucket);
        }
        let pending_buckets: usize = by_series.values().map(Vec::len).sum();

        // Step 2: parallel reconciliation and quality control
        let suppressed = state.quality.suppressed_sources();
        let mut workers = FuturesUnordered::new();
        for (series, buckets) in by_series {
            let engine = Arc::clone(&inner.reconciliation);
            let quality = inner.config.quality.clone();
            let suppressed = suppressed.clone();
            let token = token.clone();
            let history = passed_history(state.windows.get(&series));
            workers.push(tokio::task::spawn_blocking(move || {
                process_series(&engine, &quality, series, buckets, history, &suppressed, &token)
            }));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Series worker failed: {}", e),
            }
        }
        if token.is_cancelled() {
            info!(cycle_id = %cycle_id, "Refresh cycle superseded before publishing");
            return None;
        }

        // Step 3: merge
        let mut cycle_quality = CycleQuality::default();
        let mut touched: BTreeSet<TrendKey> = BTreeSet::new();
        for outcome in outcomes {
            let revisions = state.revisions.entry(outcome.series.clone()).or_default();
            revisions.extend(outcome.revisions);

            let window = state.windows.entry(outcome.series.clone()).or_default();
            for assessed in outcome.assessed {
                state.counters.conflicts_resolved += u64::from(assessed.value.conflicts_resolved);
                if !assessed.verdict.passed {
                    state.counters.quality_rejections += 1;
                    inner.events.emit_lossy(TrendEvent::QualityRejected {
                        subject_id: assessed.value.subject_id.clone(),
                        metric_name: assessed.value.metric_name.clone(),
                        bucket: assessed.value.bucket,
                        anomaly_score: assessed.verdict.anomaly_score,
                        source_id: assessed.value.dominant_source.clone(),
                        timestamp: now,
                    });
                }
                touched.insert(self.trend_key(&outcome.series));
                window.insert(assessed.value.bucket, assessed);
            }
            cycle_quality.merge(outcome.quality);
        }

        for transition in state.quality.end_cycle(&cycle_quality, now) {
            inner.events.emit_lossy(match transition {
                SourceTransition::Suppressed { source_id, strikes } => TrendEvent::SourceSuppressed {
                    source_id,
                    strikes,
                    timestamp: now,
                },
                SourceTransition::Restored { source_id } => TrendEvent::SourceRestored {
                    source_id,
                    timestamp: now,
                },
            });
        }
        state.counters.suppressed_sources = state.quality.suppressed_sources().into_iter().collect();
        state.counters.suppressed_sources.sort();

        if pending_buckets > 0 {
            if let Err(e) = inner.reconciliation.reliability().persist().await {
                warn!("Failed to persist source reliability: {}", e);
                state.counters.store_failures += 1;
            }
        }

        // Step 4: fresh trend records
        let new_data = !touched.is_empty();
        let mut fresh_keys = touched;
        if force {
            fresh_keys.extend(self.recent_keys(&state.windows, now));
        }

        let mut computations = FuturesUnordered::new();
        for key in &fresh_keys {
            let series = self.group_series(&state.windows, key);
            let engine = inner.trend_engine.clone();
            let task_key = key.clone();
            computations.push(inner.computations.run(key.clone(), false, move |_| async move {
                engine.compute(&task_key, &series, now)
            }));
        }
        let mut fresh = Vec::new();
        while let Some(record) = computations.next().await {
            fresh.extend(record);
        }
        drop(computations);

        // Step 5: publish
        let raw_data_present = state.windows.values().any(|w| !w.is_empty());
        let previous_tier = state.orchestrator.live().map(|live| live.source);
        let fresh_count = fresh.len();

        let windows = &state.windows;
        let live = state.orchestrator.evaluate(
            CycleInput {
                fresh,
                new_data,
                raw_data_present,
                generate: || self.generated_records(windows, now),
            },
            now,
        );

        if live.source == TrendSource::Computed && !live.exhausted {
            if let Some(generation) = state.orchestrator.last_computed().cloned() {
                if let Err(e) = inner.archive.save_generation(&generation).await {
                    warn!("Failed to archive trend generation: {}", e);
                    state.counters.store_failures += 1;
                }
            }
        }

        if previous_tier != Some(live.source) {
            info!(tier = %live.source, previous = ?previous_tier, "Trend tier changed");
            inner.events.emit_lossy(TrendEvent::TierSelected {
                previous: previous_tier,
                tier: live.source,
                timestamp: now,
            });
        }

        let report = inner.health.assess(Some(&live), &state.counters, now);
        info!(
            cycle_id = %cycle_id,
            tier = %live.source,
            pending_buckets,
            fresh = fresh_count,
            published = live.trends.len(),
            status = ?report.status,
            "Refresh cycle complete"
        );
        inner.events.emit_lossy(TrendEvent::CycleCompleted {
            cycle_id,
            tier: live.source,
            trend_count: live.trends.len(),
            health: report.status,
            timestamp: now,
        });

        Some(RefreshOutcome {
            cycle_id,
            trends: live.trends,
            source: live.source,
            computed_at: live.computed_at,
            status: report.status,
            exhausted: live.exhausted,
        })
    }

    /// Oldest bucket still retained: trend window plus quality history
    fn retention_floor(&self, now: DateTime<Utc>) -> BucketIndex {
        let config = &self.inner.config;
        let retained = (config.trend.window_buckets + config.quality.history_len) as i64;
        bucket_of(now, config.reconciliation.bucket_seconds) - retained
    }

    fn trend_key(&self, series: &SeriesKey) -> TrendKey {
        TrendKey::new(&self.inner.groups.group_of(&series.subject_id), &series.metric_name)
    }

    /// Keys whose newest bucket started within the staleness ceiling
    fn recent_keys(
        &self,
        windows: &HashMap<SeriesKey, BTreeMap<BucketIndex, AssessedValue>>,
        now: DateTime<Utc>,
    ) -> BTreeSet<TrendKey> {
        let bucket_seconds = self.inner.config.reconciliation.bucket_seconds;
        let ceiling = self.inner.config.fallback.staleness_ceiling_secs;
        windows
            .iter()
            .filter(|(_, window)| {
                window
                    .keys()
                    .next_back()
                    .is_some_and(|newest| now.timestamp() - newest * bucket_seconds <= ceiling)
            })
            .map(|(series, _)| self.trend_key(series))
            .collect()
    }

    /// Group series for one key over quality-passed (repaired) values
    fn group_series(
        &self,
        windows: &HashMap<SeriesKey, BTreeMap<BucketIndex, AssessedValue>>,
        key: &TrendKey,
    ) -> BTreeMap<BucketIndex, GroupPoint> {
        let members = windows
            .iter()
            .filter(|(series, _)| {
                series.metric_name == key.metric_name
                    && self.inner.groups.group_of(&series.subject_id) == key.subject_group
            })
            .flat_map(|(_, window)| window.iter());

        aggregate(members.filter_map(|(bucket, assessed)| {
            assessed.verdict.passed.then_some((
                *bucket,
                assessed.value.value,
                assessed.value.confidence,
                &assessed.value.contributing_sources,
            ))
        }))
    }

    fn generated_records(
        &self,
        windows: &HashMap<SeriesKey, BTreeMap<BucketIndex, AssessedValue>>,
        now: DateTime<Utc>,
    ) -> Vec<TrendRecord> {
        let keys: BTreeSet<TrendKey> = windows.keys().map(|series| self.trend_key(series)).collect();
        let discount = self.inner.config.fallback.generated_quality_discount;
        keys.iter()
            .filter_map(|key| {
                let series = self.group_series(windows, key);
                self.inner.trend_engine.synthesize(key, &series, discount, now)
            })
            .collect()
    }
}

fn prune_windows<V>(windows: &mut HashMap<SeriesKey, BTreeMap<BucketIndex, V>>, oldest: BucketIndex) {
    for window in windows.values_mut() {
        *window = window.split_off(&oldest);
    }
    windows.retain(|_, window| !window.is_empty());
}

/// Quality-passed values of a series, by bucket
fn passed_history(window: Option<&BTreeMap<BucketIndex, AssessedValue>>) -> BTreeMap<BucketIndex, f64> {
    window
        .map(|w| {
            w.iter()
                .filter(|(_, assessed)| assessed.verdict.passed)
                .map(|(bucket, assessed)| (*bucket, assessed.value.value))
                .collect()
        })
        .unwrap_or_default()
}

/// Reconcile, recheck and assess the changed buckets of one series, oldest first
fn process_series(
    engine: &ReconciliationEngine,
    quality: &QualityConfig,
    series: SeriesKey,
    buckets: Vec<PendingBucket>,
    mut history: BTreeMap<BucketIndex, f64>,
    suppressed: &HashSet<String>,
    token: &CancellationToken,
) -> SeriesOutcome {
    let mut outcome = SeriesOutcome {
        series: series.clone(),
        revisions: Vec::new(),
        assessed: Vec::new(),
        quality: CycleQuality::default(),
    };

    for pending in buckets {
        if token.is_cancelled() {
            break;
        }
        let trailing: Vec<f64> = history.range(..pending.bucket).map(|(_, v)| *v).collect();

        // Suppressed sources are rechecked, never reconciled
        for (source_id, value) in latest_suppressed(&pending.observations, suppressed) {
            let verdict = recheck_value(quality, value, &trailing);
            if verdict.passed {
                outcome.quality.rechecks_accepted.insert(source_id);
            } else {
                debug!(
                    series = %series,
                    bucket = pending.bucket,
                    source = %source_id,
                    anomaly_score = verdict.anomaly_score,
                    "Suppressed source recheck flagged"
                );
            }
        }

        outcome.revisions.push((pending.bucket, pending.revision));
        let reconciled =
            engine.reconcile_bucket(&series, pending.bucket, &pending.observations, suppressed);
        let Some(value) = reconciled else {
            continue;
        };

        outcome
            .quality
            .participating
            .extend(value.contributing_sources.iter().cloned());
        outcome
            .quality
            .participating
            .extend(value.dropped_sources.iter().cloned());

        let assessed = assess_value(quality, value, &trailing);
        if assessed.verdict.passed {
            history.insert(pending.bucket, assessed.value.value);
        } else {
            history.remove(&pending.bucket);
            outcome.quality.rejections += 1;
            if let Some(dominant) = &assessed.value.dominant_source {
                outcome.quality.rejected_dominant.insert(dominant.clone());
            }
        }
        outcome.assessed.push(assessed);
    }

    outcome
}

/// Latest value per suppressed source in a bucket
fn latest_suppressed(observations: &[Observation], suppressed: &HashSet<String>) -> Vec<(String, f64)> {
    let mut latest: BTreeMap<&str, &Observation> = BTreeMap::new();
    for observation in observations
        .iter()
        .filter(|o| suppressed.contains(&o.source_id))
    {
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
        .into_iter()
        .map(|(source, observation)| (source.to_string(), observation.value))
        .collect()
}
