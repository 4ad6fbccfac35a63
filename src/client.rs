//! Client facade owning every rig-facing component
//!
//! `RigClient` wires the telemetry channel into the signaling machine and
//! the frame channel through a single dispatch task, and owns the task
//! poller and subscription hub on top of the shared HTTP client. `open()`
//! and `close()` bound the lifetime of everything; `close()` releases all
//! resources on every exit path.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, FetchKind};
use crate::channel::{ChannelMessage, ConnectionState, TelemetryChannel, TelemetrySample};
use crate::config::AppConfig;
use crate::events::{Observation, ObservationBus};
use crate::frames::{FrameChannel, PublishedFrame};
use crate::hub::{FetchSlot, SubscriptionHub};
use crate::signaling::{
    MediaPeerFactory, PeerEvent, RtcPeerFactory, SignalingMachine, SignalingState,
};
use crate::tasks::{TaskHandle, TaskPoller};
use crate::Result;

struct ClientRuntime {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Live operational picture of one rig
pub struct RigClient {
    config: AppConfig,
    factory: Arc<dyn MediaPeerFactory>,
    observations: Arc<ObservationBus>,
    api: Arc<ApiClient>,
    channel: Arc<TelemetryChannel>,
    frames: Arc<FrameChannel>,
    poller: Arc<TaskPoller>,
    hub: Arc<SubscriptionHub>,
    runtime: Mutex<Option<ClientRuntime>>,
}

impl RigClient {
    /// Build a client with the production media transport
    pub fn new(config: AppConfig) -> Result<Self> {
        let factory = Arc::new(RtcPeerFactory::new(config.peer_config()));
        Self::with_factory(config, factory)
    }

    /// Build a client around a custom media peer factory
    pub fn with_factory(config: AppConfig, factory: Arc<dyn MediaPeerFactory>) -> Result<Self> {
        let observations = Arc::new(ObservationBus::new());
        let api = Arc::new(ApiClient::new(&config.api_config())?);
        let channel = Arc::new(TelemetryChannel::new(
            config.channel_config(),
            Arc::clone(&observations),
        ));
        let frames = Arc::new(FrameChannel::new(Arc::clone(&observations)));
        let poller = Arc::new(TaskPoller::new(
            Arc::clone(&api),
            Arc::clone(&observations),
            config.poller_config(),
        ));
        let hub = Arc::new(SubscriptionHub::new(
            Arc::clone(&api),
            Arc::clone(&observations),
        ));

        Ok(Self {
            config,
            factory,
            observations,
            api,
            channel,
            frames,
            poller,
            hub,
            runtime: Mutex::new(None),
        })
    }

    /// Connect the channel, start configured subscriptions and the
    /// dispatch task. A no-op if already open.
    pub fn open(&self) {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            debug!("Client already open");
            return;
        }
        info!("Opening rig client");

        self.channel.connect();
        for subscription in &self.config.hub.subscriptions {
            self.hub.subscribe(
                subscription.kind,
                Duration::from_millis(subscription.interval_ms),
            );
        }

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            cancel: cancel.clone(),
            channel: Arc::clone(&self.channel),
            frames: Arc::clone(&self.frames),
            factory: Arc::clone(&self.factory),
            observations: Arc::clone(&self.observations),
        };
        let handle = tokio::spawn(dispatcher.run());
        *runtime = Some(ClientRuntime { cancel, handle });
    }

    /// Tear everything down.
    ///
    /// When this returns the channel is disconnected, all poll loops and
    /// subscriptions are stopped and the current frame handle is released.
    /// A no-op when already closed.
    pub async fn close(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(rt) = runtime {
            rt.cancel.cancel();
            if let Err(e) = rt.handle.await {
                warn!("Dispatch task join error: {}", e);
            }
        }

        self.channel.disconnect().await;
        self.poller.close().await;
        self.hub.close().await;
        self.frames.clear();
        info!("Rig client closed");
    }

    /// Subscribe to the observation stream
    pub fn observe(&self) -> broadcast::Receiver<Observation> {
        self.observations.subscribe()
    }

    /// Submit an analysis job; see [`TaskPoller::submit`]
    pub fn submit_analysis(&self, class: &str, params: Vec<(String, String)>) -> TaskHandle {
        self.poller.submit(class, params)
    }

    /// Begin periodic fetches for a data kind
    pub fn subscribe_fetch(&self, kind: FetchKind, interval: Duration) {
        self.hub.subscribe(kind, interval);
    }

    /// Stop periodic fetches for a data kind
    pub fn unsubscribe_fetch(&self, kind: FetchKind) -> bool {
        self.hub.unsubscribe(kind)
    }

    /// Cached state of a subscribed kind
    pub fn fetch_slot(&self, kind: FetchKind) -> Option<FetchSlot> {
        self.hub.slot(kind)
    }

    /// Typed pull client for one-off requests
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Telemetry channel connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Retained telemetry samples, oldest first
    pub fn recent_samples(&self) -> Vec<TelemetrySample> {
        self.channel.recent_samples()
    }

    /// The currently published video frame, if any
    pub fn current_frame(&self) -> Option<PublishedFrame> {
        self.frames.current()
    }
}

/// Single dispatch point between the channel, signaling and frames
struct Dispatcher {
    cancel: CancellationToken,
    channel: Arc<TelemetryChannel>,
    frames: Arc<FrameChannel>,
    factory: Arc<dyn MediaPeerFactory>,
    observations: Arc<ObservationBus>,
}

impl Dispatcher {
    async fn run(self) {
        let (mut machine, mut peer_events) =
            SignalingMachine::new(Arc::clone(&self.factory), Arc::clone(&self.observations));
        let mut messages = self.channel.subscribe();
        let mut states = self.channel.watch_state();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                msg = messages.recv() => match msg {
                    Ok(msg) => self.handle_message(&mut machine, msg).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Dispatch lagged behind the channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                event = peer_events.recv() => match event {
                    Some(event) => self.handle_peer_event(&mut machine, event).await,
                    None => break,
                },

                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.handle_connection_state(&mut machine, state).await;
                }
            }
        }

        machine.close().await;
        debug!("Dispatch task exiting");
    }

    async fn handle_message(&self, machine: &mut SignalingMachine, msg: ChannelMessage) {
        match msg {
            // Telemetry samples are recorded and published by the channel
            ChannelMessage::TelemetryUpdate(_) => {}

            ChannelMessage::VideoFrame {
                frame,
                person_count,
                boxes,
            } => self.frames.on_frame(&frame, person_count, boxes),

            ChannelMessage::Offer(offer) => {
                if let Some(answer) = machine.handle_offer(&offer).await {
                    if let Err(e) = self.channel.send(ChannelMessage::Answer(answer)).await {
                        machine.fail(format!("answer delivery failed: {}", e)).await;
                    }
                }
            }

            ChannelMessage::Answer(answer) => machine.handle_answer(&answer).await,

            ChannelMessage::IceCandidate(candidate) => machine.handle_candidate(candidate).await,
        }
    }

    async fn handle_peer_event(&self, machine: &mut SignalingMachine, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .channel
                    .send(ChannelMessage::IceCandidate(candidate))
                    .await
                {
                    debug!("Dropping local candidate: {}", e);
                }
            }
            PeerEvent::Connected => machine.on_connected(),
            PeerEvent::Failed(reason) => machine.fail(reason).await,
        }
    }

    async fn handle_connection_state(
        &self,
        machine: &mut SignalingMachine,
        state: ConnectionState,
    ) {
        match state {
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                self.frames.clear();
                if machine.state() == SignalingState::Negotiating {
                    machine
                        .fail("telemetry channel lost during negotiation".to_string())
                        .await;
                }
            }
            ConnectionState::Connected => {
                // A fresh connection invalidates any previous negotiation;
                // the rig re-offers after it sees us connect
                if matches!(
                    machine.state(),
                    SignalingState::Established | SignalingState::FallbackActive
                ) {
                    machine.reset().await;
                }
            }
            ConnectionState::Connecting => {}
        }
    }
}
