//! Shared enums that cross the boundary between the trend engine and its consumers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Provenance of a published trend record (and of a whole published set)
///
/// Ordered from most to least trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendSource {
    /// Freshly computed this cycle
    Computed,
    /// Republished from a previous computed generation
    Cached,
    /// Synthesized from partial data without regression statistics
    Generated,
    /// Static placeholder set
    Fallback,
}

impl TrendSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendSource::Computed => "computed",
            TrendSource::Cached => "cached",
            TrendSource::Generated => "generated",
            TrendSource::Fallback => "fallback",
        }
    }

    /// Parse the lowercase label used in persisted rows
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "computed" => Some(TrendSource::Computed),
            "cached" => Some(TrendSource::Cached),
            "generated" => Some(TrendSource::Generated),
            "fallback" => Some(TrendSource::Fallback),
            _ => None,
        }
    }
}

impl fmt::Display for TrendSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative data health label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Poor => write!(f, "poor"),
            HealthStatus::Fair => write!(f, "fair"),
            HealthStatus::Good => write!(f, "good"),
            HealthStatus::Excellent => write!(f, "excellent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_source_label_roundtrip() {
        for source in [
            TrendSource::Computed,
            TrendSource::Cached,
            TrendSource::Generated,
            TrendSource::Fallback,
        ] {
            assert_eq!(TrendSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(TrendSource::parse("real_time"), None);
    }

    #[test]
    fn test_health_status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Excellent).unwrap();
        assert_eq!(json, "\"excellent\"");
    }
}
