//! Observation ledger
//!
//! Holds submitted observations grouped by series and bucket. Ingestion is
//! idempotent per `(source_id, subject_id, metric_name, observed_at)`.
//! Every bucket carries a revision number that increases whenever the
//! bucket receives a new observation; a bucket needs (re)reconciliation
//! when its revision is newer than the one the window buffer last saw.

use crate::error::ObservationRejection;
use crate::types::{bucket_of, BucketIndex, Observation, ObservationKey, SeriesKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Outcome of one `submit` call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub accepted: usize,
    /// Already-seen observations (no-ops)
    pub duplicates: usize,
    /// Index within the batch and reason, for each rejected observation
    #[serde(skip)]
    pub rejected: Vec<(usize, ObservationRejection)>,
}

/// Observations of one bucket plus its revision
#[derive(Debug, Clone, Default)]
pub struct BucketObservations {
    pub revision: u64,
    pub observations: Vec<Observation>,
}

/// Work item: a bucket whose observations changed since it was last reconciled
#[derive(Debug, Clone)]
pub struct PendingBucket {
    pub series: SeriesKey,
    pub bucket: BucketIndex,
    pub revision: u64,
    pub observations: Vec<Observation>,
}

/// Submitted observations, grouped by series and bucket
#[derive(Debug)]
pub struct ObservationLedger {
    bucket_seconds: i64,
    next_revision: u64,
    seen: HashSet<ObservationKey>,
    series: BTreeMap<SeriesKey, BTreeMap<BucketIndex, BucketObservations>>,
}

impl ObservationLedger {
    pub fn new(bucket_seconds: i64) -> Self {
        Self {
            bucket_seconds,
            next_revision: 0,
            seen: HashSet::new(),
            series: BTreeMap::new(),
        }
    }

    /// Ingest a batch for one `(subject_id, metric_name)`
    ///
    /// Observations older than `oldest_bucket` are rejected because their
    /// bucket has already left the retained history.
    pub fn submit(
        &mut self,
        subject_id: &str,
        metric_name: &str,
        observations: Vec<Observation>,
        oldest_bucket: BucketIndex,
    ) -> SubmitReceipt {
        let mut receipt = SubmitReceipt::default();

        for (index, observation) in observations.into_iter().enumerate() {
            if let Err(reason) = validate(subject_id, metric_name, &observation) {
                receipt.rejected.push((index, reason));
                continue;
            }

            let bucket = bucket_of(observation.observed_at, self.bucket_seconds);
            if bucket < oldest_bucket {
                receipt.rejected.push((
                    index,
                    ObservationRejection::OutsideRetention {
                        bucket,
                        oldest: oldest_bucket,
                    },
                ));
                continue;
            }

            if !self.seen.insert(observation.key()) {
                receipt.duplicates += 1;
                continue;
            }

            self.next_revision += 1;
            let entry = self
                .series
                .entry(observation.series_key())
                .or_default()
                .entry(bucket)
                .or_default();
            entry.revision = self.next_revision;
            entry.observations.push(observation);
            receipt.accepted += 1;
        }

        receipt
    }

    /// Buckets whose revision is newer than `reconciled_revision(series, bucket)`
    pub fn pending<F>(&self, mut reconciled_revision: F) -> Vec<PendingBucket>
    where
        F: FnMut(&SeriesKey, BucketIndex) -> Option<u64>,
    {
        let mut pending = Vec::new();
        for (series, buckets) in &self.series {
            for (bucket, entry) in buckets {
                let seen = reconciled_revision(series, *bucket).unwrap_or(0);
                if entry.revision > seen {
                    pending.push(PendingBucket {
                        series: series.clone(),
                        bucket: *bucket,
                        revision: entry.revision,
                        observations: entry.observations.clone(),
                    });
                }
            }
        }
        pending
    }

    /// Number of stored observations
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drop buckets older than `oldest_bucket`; returns the number of observations removed
    pub fn prune_before(&mut self, oldest_bucket: BucketIndex) -> usize {
        let mut removed = 0;
        for buckets in self.series.values_mut() {
            let retained = buckets.split_off(&oldest_bucket);
            let expired = std::mem::replace(buckets, retained);
            for entry in expired.into_values() {
                for observation in entry.observations {
                    self.seen.remove(&observation.key());
                    removed += 1;
                }
            }
        }
        self.series.retain(|_, buckets| !buckets.is_empty());
        removed
    }
}

fn validate(
    subject_id: &str,
    metric_name: &str,
    observation: &Observation,
) -> Result<(), ObservationRejection> {
    if observation.subject_id != subject_id {
        return Err(ObservationRejection::SubjectMismatch {
            expected: subject_id.to_string(),
            found: observation.subject_id.clone(),
        });
    }
    if observation.metric_name != metric_name {
        return Err(ObservationRejection::MetricMismatch {
            expected: metric_name.to_string(),
            found: observation.metric_name.clone(),
        });
    }
    if observation.source_id.trim().is_empty() {
        return Err(ObservationRejection::EmptySource);
    }
    if !observation.value.is_finite() {
        return Err(ObservationRejection::NonFiniteValue(observation.value));
    }
    if let Some(confidence) = observation.source_confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ObservationRejection::ConfidenceOutOfRange(confidence));
        }
    }
    Ok(())
}
