//! Error types for esg-trends
//!
//! Engine-level failures use `esg_common::Error`. Absence of data, quality
//! rejections and reconciliation conflicts are not errors and never
//! appear here; they are modelled as `Option`s and verdicts.

use thiserror::Error;

pub use esg_common::{Error, Result};

/// Why a single submitted observation was not ingested
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationRejection {
    /// Observation subject differs from the batch subject
    #[error("subject mismatch: batch is '{expected}', observation is '{found}'")]
    SubjectMismatch { expected: String, found: String },

    /// Observation metric differs from the batch metric
    #[error("metric mismatch: batch is '{expected}', observation is '{found}'")]
    MetricMismatch { expected: String, found: String },

    /// NaN or infinite value
    #[error("value is not finite: {0}")]
    NonFiniteValue(f64),

    /// Source confidence outside [0, 1]
    #[error("source confidence out of range: {0}")]
    ConfidenceOutOfRange(f64),

    /// Blank source identifier
    #[error("source_id is empty")]
    EmptySource,

    /// Older than the retained history
    #[error("observation at bucket {bucket} is older than retained history (oldest {oldest})")]
    OutsideRetention { bucket: i64, oldest: i64 },
}
