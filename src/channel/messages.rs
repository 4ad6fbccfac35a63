//! Telemetry channel wire messages
//!
//! Defines the tagged message enum exchanged with the rig over the event
//! connection. The `serde(tag = "event", content = "data")` attribute
//! produces a JSON structure like:
//! ```json
//! {
//!   "event": "telemetry_update",
//!   "data": { "temperature": 21.4, "humidity": 48.0, ... }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signaling::messages::{IceCandidate, SdpAnswer, SdpOffer};

/// One telemetry sample pushed by the rig
///
/// Samples are immutable once received; the channel keeps a bounded ring of
/// the most recent ones for late-joining consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// When the sample was taken (rig clock); now() if the rig omits it
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Room temperature in degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    /// Ambient light level in lux
    pub light: f64,
    /// Whether the air conditioner is on
    #[serde(default)]
    pub ac_on: bool,
    /// Whether the window is open
    #[serde(default)]
    pub window_open: bool,
    /// Whether the LED actuator is on
    #[serde(default)]
    pub led_on: bool,
    /// Persons currently detected by the camera
    #[serde(default)]
    pub person_count: u32,
}

/// Detection bounding box attached to a video frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Detector label, e.g. "person"
    #[serde(default)]
    pub label: Option<String>,
}

/// Message enumeration for the event connection
///
/// Covers both directions: the rig pushes `telemetry_update`, `video_frame`
/// and `offer`; the client sends back `answer` and `ice-candidate`.
/// `ice-candidate` flows both ways during negotiation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ChannelMessage {
    /// Periodic sensor/actuator snapshot
    #[serde(rename = "telemetry_update")]
    TelemetryUpdate(TelemetrySample),

    /// Discrete video frame (fallback path)
    #[serde(rename = "video_frame")]
    VideoFrame {
        /// Base64-encoded JPEG payload
        frame: String,
        /// Persons detected in this frame
        person_count: u32,
        /// Detection boxes, absent on older rigs
        #[serde(default)]
        boxes: Vec<BoundingBox>,
    },

    /// Peer media offer from the rig
    #[serde(rename = "offer")]
    Offer(SdpOffer),

    /// Peer media answer
    #[serde(rename = "answer")]
    Answer(SdpAnswer),

    /// Trickled ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidate),
}

impl ChannelMessage {
    /// Get the wire event name (for dispatch and logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TelemetryUpdate(_) => "telemetry_update",
            Self::VideoFrame { .. } => "video_frame",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
        }
    }
}
