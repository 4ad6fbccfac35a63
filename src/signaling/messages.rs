//! Signaling wire types
//!
//! Serde shapes for the SDP and ICE payloads carried inside `offer`,
//! `answer` and `ice-candidate` channel messages. Field renames follow the
//! browser-side naming (`sdpMid`, `sdpMLineIndex`).

use serde::{Deserialize, Serialize};

/// SDP offer from the rig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpOffer {
    /// SDP content
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// SDP answer sent back by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpAnswer {
    /// SDP content
    pub sdp: String,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// ICE candidate, trickled in either direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}
