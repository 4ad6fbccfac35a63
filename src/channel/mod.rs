//! Telemetry channel: the persistent event connection to the rig
//!
//! A WebSocket client task that receives telemetry and video pushes,
//! carries signaling payloads in both directions, and reconnects with
//! exponential backoff when the connection is lost unexpectedly.

pub mod messages;

pub use messages::{BoundingBox, ChannelMessage, TelemetrySample};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Observation, ObservationBus};
use crate::utils::{Backoff, LogThrottler};
use crate::warn_throttled;
use crate::{ClientError, Result};

/// Inbound message fan-out capacity (ring buffer size)
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Outbound send queue depth
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Connection state of the telemetry channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Telemetry channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL of the rig's event endpoint
    pub url: String,
    /// How many recent telemetry samples to retain
    pub sample_window: usize,
    /// Heartbeat ping interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Initial reconnect delay in milliseconds
    pub reconnect_base_ms: u64,
    /// Maximum reconnect delay in milliseconds
    pub reconnect_cap_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000/ws".to_string(),
            sample_window: 64,
            heartbeat_interval_ms: 30_000,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 30_000,
        }
    }
}

struct ChannelRuntime {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// WebSocket client for the rig's event connection
///
/// `connect()` is idempotent and spawns a single background task that owns
/// the socket. `disconnect()` is a deterministic teardown: when it returns,
/// the task has exited and the state is `Disconnected`. Inbound messages are
/// fanned out to `subscribe()` receivers in arrival order.
pub struct TelemetryChannel {
    config: ChannelConfig,
    observations: Arc<ObservationBus>,
    messages: broadcast::Sender<ChannelMessage>,
    state: Arc<watch::Sender<ConnectionState>>,
    samples: Arc<Mutex<VecDeque<TelemetrySample>>>,
    throttler: Arc<LogThrottler>,
    outbound: Mutex<Option<mpsc::Sender<ChannelMessage>>>,
    runtime: Mutex<Option<ChannelRuntime>>,
}

impl TelemetryChannel {
    pub fn new(config: ChannelConfig, observations: Arc<ObservationBus>) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            observations,
            messages,
            state: Arc::new(state),
            samples: Arc::new(Mutex::new(VecDeque::new())),
            throttler: Arc::new(LogThrottler::default()),
            outbound: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }

    /// Start the connection task. A no-op if already started.
    pub fn connect(&self) {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            debug!("Telemetry channel already started");
            return;
        }

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        *self.outbound.lock() = Some(outbound_tx);

        let worker = ChannelWorker {
            config: self.config.clone(),
            cancel: cancel.clone(),
            state: Arc::clone(&self.state),
            observations: Arc::clone(&self.observations),
            messages: self.messages.clone(),
            samples: Arc::clone(&self.samples),
            throttler: Arc::clone(&self.throttler),
        };
        let handle = tokio::spawn(worker.run(outbound_rx));
        *runtime = Some(ChannelRuntime { cancel, handle });
    }

    /// Stop the connection task and wait for it to exit.
    ///
    /// When this returns the socket is closed and the state is
    /// `Disconnected`. A no-op if the channel was never started.
    pub async fn disconnect(&self) {
        let runtime = self.runtime.lock().take();
        *self.outbound.lock() = None;

        if let Some(rt) = runtime {
            rt.cancel.cancel();
            if let Err(e) = rt.handle.await {
                warn!("Telemetry channel task join error: {}", e);
            }
        }
    }

    /// Subscribe to inbound messages, delivered in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.messages.subscribe()
    }

    /// Send a message to the rig (signaling answers and candidates).
    pub async fn send(&self, message: ChannelMessage) -> Result<()> {
        let tx = self.outbound.lock().clone();
        match tx {
            Some(tx) => tx
                .send(message)
                .await
                .map_err(|_| ClientError::Transport("telemetry channel is shutting down".into())),
            None => Err(ClientError::Transport(
                "telemetry channel is not connected".into(),
            )),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Snapshot of the retained telemetry samples, oldest first
    pub fn recent_samples(&self) -> Vec<TelemetrySample> {
        self.samples.lock().iter().cloned().collect()
    }
}

enum SessionEnd {
    Cancelled,
    Lost,
}

/// Background task owning the socket and the reconnect loop
struct ChannelWorker {
    config: ChannelConfig,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    observations: Arc<ObservationBus>,
    messages: broadcast::Sender<ChannelMessage>,
    samples: Arc<Mutex<VecDeque<TelemetrySample>>>,
    throttler: Arc<LogThrottler>,
}

impl ChannelWorker {
    async fn run(self, mut outbound: mpsc::Receiver<ChannelMessage>) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.reconnect_base_ms),
            Duration::from_millis(self.config.reconnect_cap_ms),
        );
        let mut attempted = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(if attempted {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });
            attempted = true;

            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _response)) => {
                    info!(url = %self.config.url, "Telemetry channel connected");
                    self.set_state(ConnectionState::Connected);
                    backoff.reset();
                    self.throttler.clear("channel_connect");

                    if let SessionEnd::Cancelled = self.session(ws, &mut outbound).await {
                        break;
                    }
                }
                Err(e) => {
                    warn_throttled!(
                        self.throttler,
                        "channel_connect",
                        "Telemetry channel connect failed: {}",
                        e
                    );
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("Telemetry channel task exiting");
    }

    /// Drive one established connection until loss or cancellation
    async fn session(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        outbound: &mut mpsc::Receiver<ChannelMessage>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = tokio::time::interval(Duration::from_millis(
            self.config.heartbeat_interval_ms,
        ));
        // First tick completes immediately; an early ping is harmless
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong from rig");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn_throttled!(
                                self.throttler,
                                "channel_lost",
                                "Telemetry channel closed by rig"
                            );
                            return SessionEnd::Lost;
                        }
                        Some(Err(e)) => {
                            warn_throttled!(
                                self.throttler,
                                "channel_lost",
                                "Telemetry channel receive error: {}",
                                e
                            );
                            return SessionEnd::Lost;
                        }
                        _ => {}
                    }
                }

                out = outbound.recv() => {
                    match out {
                        Some(msg) => match serde_json::to_string(&msg) {
                            Ok(json) => {
                                if sink.send(Message::Text(json)).await.is_err() {
                                    return SessionEnd::Lost;
                                }
                            }
                            Err(e) => {
                                warn!(kind = msg.kind(), "Failed to serialize outbound message: {}", e);
                            }
                        },
                        // Sender dropped, the channel is shutting down
                        None => return SessionEnd::Cancelled,
                    }
                }

                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let msg: ChannelMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn_throttled!(
                    self.throttler,
                    "channel_decode",
                    "Unrecognized channel message: {}",
                    e
                );
                return;
            }
        };

        if let ChannelMessage::TelemetryUpdate(sample) = &msg {
            let cap = self.config.sample_window.max(1);
            let mut ring = self.samples.lock();
            while ring.len() >= cap {
                ring.pop_front();
            }
            ring.push_back(sample.clone());
            drop(ring);

            self.observations.publish(Observation::Telemetry {
                sample: sample.clone(),
            });
        }

        let _ = self.messages.send(msg);
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "Connection state changed");
            self.observations
                .publish(Observation::ConnectionStateChanged { state: next });
        }
    }
}
