//! Signaling state machine for the peer media negotiation
//!
//! The rig initiates: an offer arrives over the telemetry channel, the
//! machine builds an answer through the peer resource and hands it back to
//! the caller for delivery. Candidates that arrive before the remote
//! description are queued and flushed in arrival order. Any negotiation
//! error is surfaced once and the machine falls back to discrete frames.

pub mod messages;
pub mod peer;

pub use messages::{IceCandidate, SdpAnswer, SdpOffer};
pub use peer::{MediaPeer, MediaPeerFactory, PeerEvent, RtcPeer, RtcPeerConfig, RtcPeerFactory};

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{Observation, ObservationBus};

/// Signaling lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    Idle,
    Negotiating,
    Established,
    FallbackActive,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::Idle => write!(f, "idle"),
            SignalingState::Negotiating => write!(f, "negotiating"),
            SignalingState::Established => write!(f, "established"),
            SignalingState::FallbackActive => write!(f, "fallback_active"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

/// Negotiation state machine
///
/// Owned by a single task; methods take `&mut self` and never block on the
/// network beyond the peer resource calls themselves.
pub struct SignalingMachine {
    state: SignalingState,
    factory: Arc<dyn MediaPeerFactory>,
    peer: Option<Arc<dyn MediaPeer>>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    observations: Arc<ObservationBus>,
}

impl SignalingMachine {
    /// Create the machine and the receiver for peer transport events.
    ///
    /// The owner selects on the returned receiver and routes `Connected`,
    /// `Failed` and `LocalCandidate` events back in.
    pub fn new(
        factory: Arc<dyn MediaPeerFactory>,
        observations: Arc<ObservationBus>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: SignalingState::Idle,
                factory,
                peer: None,
                pending_candidates: VecDeque::new(),
                remote_description_set: false,
                peer_events: tx,
                observations,
            },
            rx,
        )
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Handle an offer from the rig.
    ///
    /// While `Idle` this creates the peer resource, applies the offer and
    /// returns the answer for delivery over the channel. In any other state
    /// the offer is ignored.
    pub async fn handle_offer(&mut self, offer: &SdpOffer) -> Option<SdpAnswer> {
        if self.state != SignalingState::Idle {
            debug!(state = %self.state, "Ignoring offer");
            return None;
        }

        self.set_state(SignalingState::Negotiating);

        let peer = match self.factory.create(self.peer_events.clone()).await {
            Ok(peer) => peer,
            Err(e) => {
                self.fail(format!("peer setup failed: {}", e)).await;
                return None;
            }
        };
        self.peer = Some(Arc::clone(&peer));

        let answer_sdp = match peer.apply_remote_offer(&offer.sdp).await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.fail(format!("offer rejected: {}", e)).await;
                return None;
            }
        };

        self.remote_description_set = true;
        if !self.flush_pending().await {
            return None;
        }

        info!("Answer created, negotiation in progress");
        Some(SdpAnswer::new(answer_sdp))
    }

    /// Handle an answer to a locally created offer.
    ///
    /// Only meaningful while `Negotiating`; ignored otherwise.
    pub async fn handle_answer(&mut self, answer: &SdpAnswer) {
        if self.state != SignalingState::Negotiating {
            debug!(state = %self.state, "Ignoring answer");
            return;
        }
        let Some(peer) = self.peer.as_ref().map(Arc::clone) else {
            debug!("Ignoring answer without a peer resource");
            return;
        };

        match peer.apply_remote_answer(&answer.sdp).await {
            Ok(()) => {
                self.remote_description_set = true;
                if self.flush_pending().await {
                    self.set_state(SignalingState::Established);
                }
            }
            Err(e) => self.fail(format!("answer rejected: {}", e)).await,
        }
    }

    /// Handle a remote ICE candidate.
    ///
    /// Applied immediately when the remote description is set, otherwise
    /// queued in arrival order. Each candidate is applied exactly once.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if matches!(
            self.state,
            SignalingState::Closed | SignalingState::FallbackActive
        ) {
            debug!(state = %self.state, "Dropping candidate");
            return;
        }

        if self.remote_description_set {
            if let Some(peer) = self.peer.as_ref().map(Arc::clone) {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    self.fail(format!("candidate rejected: {}", e)).await;
                }
                return;
            }
        }

        self.pending_candidates.push_back(candidate);
    }

    /// Media transport reported connected.
    pub fn on_connected(&mut self) {
        if self.state == SignalingState::Negotiating {
            self.set_state(SignalingState::Established);
        }
    }

    /// Surface a negotiation failure once and fall back to discrete frames.
    ///
    /// Subsequent failures while already in fallback are ignored.
    pub async fn fail(&mut self, reason: String) {
        if matches!(
            self.state,
            SignalingState::Closed | SignalingState::FallbackActive
        ) {
            debug!(reason = %reason, "Ignoring failure in state {}", self.state);
            return;
        }

        warn!(reason = %reason, "Signaling failed, falling back to discrete frames");
        self.release_peer().await;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.set_state(SignalingState::FallbackActive);
        self.observations
            .publish(Observation::SignalingFailed { reason });
    }

    /// Return to `Idle` for a fresh negotiation. Not available after
    /// `close()`.
    pub async fn reset(&mut self) {
        if self.state == SignalingState::Closed {
            debug!("Ignoring reset after close");
            return;
        }
        self.release_peer().await;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.set_state(SignalingState::Idle);
    }

    /// Terminal teardown, valid from every state.
    pub async fn close(&mut self) {
        self.release_peer().await;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.set_state(SignalingState::Closed);
    }

    async fn release_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                debug!("Peer close error: {}", e);
            }
        }
    }

    /// Apply queued candidates in arrival order. Returns false if a
    /// candidate failed and the machine fell back.
    async fn flush_pending(&mut self) -> bool {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            let Some(peer) = self.peer.as_ref().map(Arc::clone) else {
                return false;
            };
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                self.fail(format!("queued candidate rejected: {}", e)).await;
                return false;
            }
        }
        true
    }

    fn set_state(&mut self, next: SignalingState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "Signaling state changed");
        self.state = next;
        self.observations
            .publish(Observation::SignalingStateChanged { state: next });
    }
}
