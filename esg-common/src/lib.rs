//! # ESG Common Library
//!
//! Shared code for the ESG trend services:
//! - Error and result types
//! - Configuration loading (TOML files, root folder resolution)
//! - Logging initialisation
//! - Boundary enums (TrendSource, HealthStatus)
//! - Event types (TrendEvent enum) and the broadcast EventBus

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use types::{HealthStatus, TrendSource};
