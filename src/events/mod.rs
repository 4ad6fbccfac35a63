//! Observation interface for consumer notifications
//!
//! This module provides the single broadcast bus through which every
//! component reports what it observed. Consumers subscribe here and never
//! participate in protocol logic.

pub mod types;

pub use types::Observation;

use tokio::sync::broadcast;

/// Observation channel capacity (ring buffer size)
const OBSERVATION_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for distributing observations
///
/// The bus uses tokio's broadcast channel to distribute observations to
/// multiple subscribers. Every observation is delivered to all active
/// subscribers.
///
/// # Example
///
/// ```no_run
/// use roomlink::events::{Observation, ObservationBus};
/// use roomlink::channel::ConnectionState;
///
/// let bus = ObservationBus::new();
///
/// // Publish an observation
/// bus.publish(Observation::ConnectionStateChanged {
///     state: ConnectionState::Connected,
/// });
///
/// // Subscribe to observations
/// let mut rx = bus.subscribe();
/// tokio::spawn(async move {
///     while let Ok(obs) = rx.recv().await {
///         println!("observed: {:?}", obs);
///     }
/// });
/// ```
pub struct ObservationBus {
    tx: broadcast::Sender<Observation>,
}

impl ObservationBus {
    /// Create a new observation bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(OBSERVATION_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an observation to all subscribers
    ///
    /// If there are no active subscribers, the observation is silently
    /// dropped. Observations are fire-and-forget notifications.
    pub fn publish(&self, observation: Observation) {
        // With no subscribers send returns Err, which is normal
        let _ = self.tx.send(observation);
    }

    /// Subscribe to observations
    ///
    /// Returns a receiver that will receive all future observations.
    /// The receiver uses a ring buffer, so a subscriber that falls too far
    /// behind receives a `Lagged` error and misses some observations.
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ObservationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionState;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = ObservationBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Observation::ConnectionStateChanged {
            state: ConnectionState::Connected,
        });

        let obs = rx.recv().await.unwrap();
        assert!(matches!(obs, Observation::ConnectionStateChanged { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = ObservationBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Observation::SignalingFailed {
            reason: "ice gathering failed".to_string(),
        });

        let obs1 = rx1.recv().await.unwrap();
        let obs2 = rx2.recv().await.unwrap();

        assert!(matches!(obs1, Observation::SignalingFailed { .. }));
        assert!(matches!(obs2, Observation::SignalingFailed { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = ObservationBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Should not panic when publishing with no subscribers
        bus.publish(Observation::SignalingFailed {
            reason: "test".to_string(),
        });
    }
}
