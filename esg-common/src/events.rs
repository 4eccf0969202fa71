//! Event types for the trend engine event system
//!
//! Provides the TrendEvent enum and the broadcast EventBus. Events are
//! diagnostics: nothing in the engine depends on a subscriber being present.

use crate::types::{HealthStatus, TrendSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Trend engine event types
///
/// Events are broadcast via EventBus and can be serialized for transmission
/// to a dashboard or log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrendEvent {
    /// A refresh cycle finished and published a trend set
    CycleCompleted {
        /// Cycle identifier
        cycle_id: Uuid,
        /// Tier the published set came from
        tier: TrendSource,
        /// Number of published records
        trend_count: usize,
        /// Health label of the published set
        health: HealthStatus,
        /// When the cycle finished
        timestamp: DateTime<Utc>,
    },

    /// The fallback orchestrator selected a tier different from the previous cycle
    TierSelected {
        /// Previous tier (None on first publication)
        previous: Option<TrendSource>,
        /// Newly selected tier
        tier: TrendSource,
        timestamp: DateTime<Utc>,
    },

    /// A reconciled value was rejected by the quality controller
    QualityRejected {
        subject_id: String,
        metric_name: String,
        /// Bucket index of the rejected value
        bucket: i64,
        /// Normalised deviation from the trailing envelope
        anomaly_score: f64,
        /// Dominant contributing source, if known
        source_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A source was suppressed after repeated rejections
    SourceSuppressed {
        source_id: String,
        /// Rejection strikes at the time of suppression
        strikes: u32,
        timestamp: DateTime<Utc>,
    },

    /// A suppressed source produced an accepted value and is active again
    SourceRestored {
        source_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Central event distribution bus
///
/// Thin wrapper around a tokio broadcast channel. Cloning the bus shares
/// the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TrendEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers drop old events
    ///
    /// # Examples
    ///
    /// ```
    /// use esg_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(256);
    /// assert_eq!(event_bus.capacity(), 256);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<TrendEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: TrendEvent,
    ) -> Result<usize, broadcast::error::SendError<TrendEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: TrendEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(TrendEvent::SourceRestored {
            source_id: "msci".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            TrendEvent::SourceRestored { source_id, .. } => assert_eq!(source_id, "msci"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);

        let event = TrendEvent::TierSelected {
            previous: None,
            tier: TrendSource::Fallback,
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        // Lossy emission never fails
        bus.emit_lossy(event);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = TrendEvent::SourceSuppressed {
            source_id: "feed-a".to_string(),
            strikes: 3,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SourceSuppressed");
        assert_eq!(json["strikes"], 3);
    }
}
