use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection-level failure on the telemetry channel. Triggers backoff
    /// reconnect, never surfaced as fatal.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer media negotiation failure. Triggers fallback to the frame
    /// channel and is surfaced exactly once.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Malformed frame payload. The frame is dropped and the stream
    /// continues.
    #[error("Frame decode error: {0}")]
    Decode(String),

    /// Analysis task exceeded its deadline. A terminal result distinct
    /// from failure.
    #[error("Analysis task timed out [{class}]: {task_id}")]
    PollTimeout { class: String, task_id: String },

    /// A single data-kind fetch failed. Isolated to its kind.
    #[error("Fetch error [{kind}]: {reason}")]
    Fetch { kind: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Whether the condition is transient and handled locally with retry,
    /// as opposed to surfaced once through the observation interface.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_) | Self::Fetch { .. })
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ClientError::PollTimeout {
            class: "led_analysis".to_string(),
            task_id: "T2".to_string(),
        };
        assert_eq!(err.to_string(), "Analysis task timed out [led_analysis]: T2");

        let err = ClientError::Fetch {
            kind: "led_stats".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("led_stats"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Transport("dropped".into()).is_transient());
        assert!(!ClientError::Signaling("bad sdp".into()).is_transient());
        assert!(!ClientError::Decode("truncated".into()).is_transient());
        assert!(!ClientError::PollTimeout {
            class: "led_analysis".into(),
            task_id: "T1".into()
        }
        .is_transient());
    }
}
