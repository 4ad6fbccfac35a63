//! Observation types
//!
//! Defines everything that can be broadcast through the observation bus.
//! Observations are in-process values, not wire messages; frame handles
//! carry decoded bytes that never round-trip through JSON.

use crate::api::FetchKind;
use crate::channel::{BoundingBox, ConnectionState, TelemetrySample};
use crate::frames::FrameHandle;
use crate::hub::FetchOutcome;
use crate::signaling::SignalingState;
use crate::tasks::TaskOutcome;

/// Observation enumeration
///
/// Each variant maps to a dotted event name used for filtering and routing,
/// mirroring the wire event naming of the rig.
#[derive(Clone, Debug)]
pub enum Observation {
    /// Telemetry channel connection state transition
    ConnectionStateChanged {
        /// New connection state
        state: ConnectionState,
    },

    /// A telemetry sample arrived on the channel
    Telemetry {
        /// The decoded sample
        sample: TelemetrySample,
    },

    /// A video frame was published by the frame channel
    VideoFrame {
        /// Handle to the decoded frame bytes
        frame: FrameHandle,
        /// Number of persons detected in the frame
        person_count: u32,
        /// Detection boxes, if any
        boxes: Vec<BoundingBox>,
    },

    /// Signaling state machine transition
    SignalingStateChanged {
        /// New signaling state
        state: SignalingState,
    },

    /// Signaling failed and the client fell back to discrete frames.
    /// Surfaced exactly once per negotiation attempt.
    SignalingFailed {
        /// Human-readable failure reason
        reason: String,
    },

    /// An analysis task reached a terminal state
    TaskResult {
        /// Task identifier (rig-assigned, or local for immediate results)
        task_id: String,
        /// Task class, e.g. "led_analysis"
        class: String,
        /// Terminal outcome
        outcome: TaskOutcome,
    },

    /// A periodic fetch completed for one data kind
    FetchResult {
        /// The data kind that was fetched
        kind: FetchKind,
        /// Value on success, error on failure
        outcome: FetchOutcome,
    },
}

impl Observation {
    /// Get the observation name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection.state_changed",
            Self::Telemetry { .. } => "telemetry.sample",
            Self::VideoFrame { .. } => "video.frame",
            Self::SignalingStateChanged { .. } => "signaling.state_changed",
            Self::SignalingFailed { .. } => "signaling.failed",
            Self::TaskResult { .. } => "task.result",
            Self::FetchResult { .. } => "fetch.result",
        }
    }

    /// Check if the observation name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all observations
    /// - `signaling.*` matches all signaling observations
    /// - `signaling.failed` matches the exact observation
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let obs = Observation::ConnectionStateChanged {
            state: ConnectionState::Reconnecting,
        };
        assert_eq!(obs.event_name(), "connection.state_changed");

        let obs = Observation::TaskResult {
            task_id: "42".to_string(),
            class: "led_analysis".to_string(),
            outcome: TaskOutcome::TimedOut,
        };
        assert_eq!(obs.event_name(), "task.result");
    }

    #[test]
    fn test_matches_topic() {
        let obs = Observation::SignalingStateChanged {
            state: SignalingState::Negotiating,
        };

        assert!(obs.matches_topic("*"));
        assert!(obs.matches_topic("signaling.*"));
        assert!(obs.matches_topic("signaling.state_changed"));
        assert!(!obs.matches_topic("connection.*"));
        assert!(!obs.matches_topic("signaling.failed"));
    }
}
