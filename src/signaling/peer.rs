//! Peer media resource
//!
//! The state machine talks to the media transport through the `MediaPeer`
//! trait so negotiation logic stays testable without a network. The
//! production implementation wraps `webrtc::RTCPeerConnection`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::messages::IceCandidate;
use crate::{ClientError, Result};

/// Events emitted by the peer resource back to its owner
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate to trickle to the rig
    LocalCandidate(IceCandidate),
    /// Media transport reached the connected state
    Connected,
    /// Media transport failed
    Failed(String),
}

/// Media transport seam used by the signaling state machine
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Apply the rig's offer and produce the local answer SDP
    async fn apply_remote_offer(&self, sdp: &str) -> Result<String>;

    /// Apply a remote answer to a locally created offer
    async fn apply_remote_answer(&self, sdp: &str) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Release the transport
    async fn close(&self) -> Result<()>;
}

/// Creates one peer resource per negotiation
#[async_trait]
pub trait MediaPeerFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>>;
}

/// Peer media configuration
#[derive(Debug, Clone)]
pub struct RtcPeerConfig {
    /// STUN server URLs, e.g. "stun:stun.l.google.com:19302"
    pub stun_servers: Vec<String>,
}

impl Default for RtcPeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Factory producing `RtcPeer` instances
pub struct RtcPeerFactory {
    config: RtcPeerConfig,
}

impl RtcPeerFactory {
    pub fn new(config: RtcPeerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaPeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>> {
        let peer = RtcPeer::new(&self.config, events).await?;
        Ok(Arc::new(peer))
    }
}

/// Production peer wrapping `RTCPeerConnection`
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    pub async fn new(
        config: &RtcPeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ClientError::Signaling(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            ClientError::Signaling(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            ClientError::Signaling(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();

            Box::pin(async move {
                info!("Peer connection state: {}", s);
                match s {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send(PeerEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(PeerEvent::Failed("media transport failed".into()));
                    }
                    _ => {}
                }
            })
        }));

        let candidate_events = events;
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();

            Box::pin(async move {
                if let Some(c) = candidate {
                    if let Ok(json) = c.to_json() {
                        debug!("Local ICE candidate: {}", json.candidate);
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                            username_fragment: None,
                        }));
                    }
                }
            })
        }));

        Ok(Self { pc })
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn apply_remote_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| ClientError::Signaling(format!("Invalid SDP offer: {}", e)))?;

        self.pc.set_remote_description(offer).await.map_err(|e| {
            ClientError::Signaling(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ClientError::Signaling(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                ClientError::Signaling(format!("Failed to set local description: {}", e))
            })?;

        Ok(answer.sdp)
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| ClientError::Signaling(format!("Invalid SDP answer: {}", e)))?;

        self.pc.set_remote_description(answer).await.map_err(|e| {
            ClientError::Signaling(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ClientError::Signaling(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| ClientError::Signaling(format!("Failed to close peer connection: {}", e)))
    }
}
