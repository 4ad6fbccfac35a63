//! Frame channel: the discrete-frame fallback path
//!
//! Decodes base64 JPEG payloads pushed over the telemetry channel into a
//! single live frame handle. Only the newest frame is retained; the
//! previously published handle is released when the next one arrives and
//! when the channel disconnects. Malformed payloads are dropped with a
//! throttled log and the stream continues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;

use crate::channel::BoundingBox;
use crate::events::{Observation, ObservationBus};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Handle to one decoded video frame
///
/// Clones share the underlying bytes; dropping the channel's copy releases
/// its ownership without invalidating consumer clones.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    /// Monotonic frame sequence number
    pub sequence: u64,
    /// Decoded JPEG bytes
    data: Bytes,
    /// Frame width, when the JPEG header could be parsed
    pub width: Option<u16>,
    /// Frame height, when the JPEG header could be parsed
    pub height: Option<u16>,
}

impl FrameHandle {
    /// Get frame data as a bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the frame is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parsed dimensions, if the JPEG header carried them
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        Some((self.width?, self.height?))
    }
}

/// The currently published frame with its detection metadata
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub handle: FrameHandle,
    pub person_count: u32,
    pub boxes: Vec<BoundingBox>,
}

/// Holder of the single live frame handle
pub struct FrameChannel {
    current: watch::Sender<Option<PublishedFrame>>,
    sequence: AtomicU64,
    observations: Arc<ObservationBus>,
    throttler: LogThrottler,
}

impl FrameChannel {
    pub fn new(observations: Arc<ObservationBus>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current,
            sequence: AtomicU64::new(0),
            observations,
            throttler: LogThrottler::default(),
        }
    }

    /// Decode and publish one frame payload.
    ///
    /// The previously published handle is released first; under
    /// backpressure only the newest frame is retained.
    pub fn on_frame(&self, payload: &str, person_count: u32, boxes: Vec<BoundingBox>) {
        let data = match BASE64.decode(payload) {
            Ok(data) => data,
            Err(e) => {
                warn_throttled!(
                    self.throttler,
                    "frame_decode",
                    "Dropping frame with invalid base64 payload: {}",
                    e
                );
                return;
            }
        };

        if data.len() < 2 || data[0] != 0xFF || data[1] != 0xD8 {
            warn_throttled!(
                self.throttler,
                "frame_decode",
                "Dropping frame without JPEG signature ({} bytes)",
                data.len()
            );
            return;
        }

        let dimensions = parse_jpeg_dimensions(&data);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = FrameHandle {
            sequence,
            data: Bytes::from(data),
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
        };

        let frame = PublishedFrame {
            handle: handle.clone(),
            person_count,
            boxes: boxes.clone(),
        };

        let previous = self.current.send_replace(Some(frame));
        drop(previous);

        self.observations.publish(Observation::VideoFrame {
            frame: handle,
            person_count,
            boxes,
        });
    }

    /// Release the outstanding handle, used on channel disconnect.
    pub fn clear(&self) {
        let previous = self.current.send_replace(None);
        if previous.is_some() {
            debug!("Released outstanding frame handle");
        }
    }

    /// Snapshot of the currently published frame
    pub fn current(&self) -> Option<PublishedFrame> {
        self.current.borrow().clone()
    }

    /// Watch frame publications; only the newest value is retained
    pub fn watch(&self) -> watch::Receiver<Option<PublishedFrame>> {
        self.current.subscribe()
    }
}

/// Extract (width, height) from the first SOF segment of a JPEG
fn parse_jpeg_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    let mut i = 2;
    while i + 3 < data.len() {
        if data[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = data[i + 1];

        // Fill byte before a marker
        if marker == 0xFF {
            i += 1;
            continue;
        }
        // Standalone markers carry no length field
        if marker == 0x01 || (0xD0..=0xD9).contains(&marker) {
            i += 2;
            continue;
        }
        // Entropy-coded data follows SOS; dimensions come earlier
        if marker == 0xDA {
            return None;
        }

        let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        if matches!(marker, 0xC0 | 0xC1 | 0xC2 | 0xC3) {
            if i + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[i + 5], data[i + 6]]);
            let width = u16::from_be_bytes([data[i + 7], data[i + 8]]);
            return Some((width, height));
        }
        i += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    /// Minimal JPEG: SOI, SOF0 with the given dimensions, EOI
    fn tiny_jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    fn frame_observations(rx: &mut tokio::sync::broadcast::Receiver<Observation>) -> usize {
        let mut count = 0;
        loop {
            match rx.try_recv() {
                Ok(Observation::VideoFrame { .. }) => count += 1,
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return count,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
    }

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_jpeg_dimensions(&tiny_jpeg(640, 480)), Some((640, 480)));
        assert_eq!(parse_jpeg_dimensions(&[0xFF, 0xD8, 0xFF, 0xD9]), None);
    }

    #[tokio::test]
    async fn test_publish_decodes_and_parses() {
        let bus = Arc::new(ObservationBus::new());
        let mut observations = bus.subscribe();
        let frames = FrameChannel::new(bus);

        let payload = BASE64.encode(tiny_jpeg(100, 72));
        frames.on_frame(&payload, 2, vec![]);

        let published = frames.current().expect("frame published");
        assert_eq!(published.handle.sequence, 1);
        assert_eq!(published.handle.dimensions(), Some((100, 72)));
        assert_eq!(published.person_count, 2);
        assert!(!published.handle.is_empty());
        assert_eq!(frame_observations(&mut observations), 1);
    }

    #[tokio::test]
    async fn test_newest_frame_wins() {
        let bus = Arc::new(ObservationBus::new());
        let frames = FrameChannel::new(bus);
        let watch_rx = frames.watch();

        frames.on_frame(&BASE64.encode(tiny_jpeg(100, 72)), 0, vec![]);
        frames.on_frame(&BASE64.encode(tiny_jpeg(200, 150)), 1, vec![]);

        // The watch slot holds a single value; a slow consumer only ever
        // observes the newest frame
        let seen = watch_rx.borrow().clone().unwrap();
        assert_eq!(seen.handle.sequence, 2);
        assert_eq!(seen.handle.dimensions(), Some((200, 150)));
        assert_eq!(frames.current().unwrap().handle.sequence, 2);
    }

    #[tokio::test]
    async fn test_malformed_payloads_dropped_stream_continues() {
        let bus = Arc::new(ObservationBus::new());
        let mut observations = bus.subscribe();
        let frames = FrameChannel::new(bus);

        frames.on_frame("%%% not base64 %%%", 0, vec![]);
        assert!(frames.current().is_none());

        frames.on_frame(&BASE64.encode(b"plain text, not a jpeg"), 0, vec![]);
        assert!(frames.current().is_none());
        assert_eq!(frame_observations(&mut observations), 0);

        // A later valid frame still goes through
        frames.on_frame(&BASE64.encode(tiny_jpeg(100, 72)), 0, vec![]);
        assert_eq!(frames.current().unwrap().handle.sequence, 1);
        assert_eq!(frame_observations(&mut observations), 1);
    }

    #[tokio::test]
    async fn test_clear_releases_handle() {
        let bus = Arc::new(ObservationBus::new());
        let frames = FrameChannel::new(bus);

        frames.on_frame(&BASE64.encode(tiny_jpeg(100, 72)), 0, vec![]);
        assert!(frames.current().is_some());

        frames.clear();
        assert!(frames.current().is_none());
    }
}
