//! esg-trends library interface
//!
//! Turns normalized ESG observations from many providers into ranked,
//! lifecycle-classified trends:
//! - Source reliability tracking and multi-source reconciliation
//! - Adaptive quality control with source suppression
//! - Windowed trend computation per subject group and metric
//! - Tiered fallback (computed, cached, generated, placeholder)
//! - Health monitoring of the published set

pub mod coalesce;
pub mod config;
pub mod error;
pub mod fallback;
pub mod groups;
pub mod health;
pub mod ledger;
pub mod quality;
pub mod reconciliation;
pub mod reliability;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod trend;
pub mod types;

pub use crate::config::EngineConfig;
pub use crate::error::{Error, ObservationRejection, Result};
pub use crate::health::{HealthMetrics, HealthReport};
pub use crate::ledger::SubmitReceipt;
pub use crate::service::{RefreshOutcome, TrendService};
pub use crate::types::{
    HealthStatus, Observation, ReconciledValue, Stage, TrendRecord, TrendSource,
};
