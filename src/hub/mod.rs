//! Subscription hub: periodic kind-keyed pulls
//!
//! One FetchSlot per data kind, each driven by its own interval task. A
//! tick that lands while the kind's previous fetch is still in flight is
//! skipped. Slot state only moves forward on success; failures are
//! surfaced per kind and never touch the other slots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ApiClient, FetchKind};
use crate::events::{Observation, ObservationBus};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Result of one periodic fetch
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The fetched payload
    Value(Value),
    /// The fetch failed; the slot keeps its previous value
    Error(String),
}

/// Cached state for one data kind
#[derive(Debug, Clone, Default)]
pub struct FetchSlot {
    /// Payload of the most recent successful fetch
    pub last_value: Option<Value>,
    /// When that fetch completed
    pub last_fetched_at: Option<DateTime<Utc>>,
}

struct Subscription {
    cancel: CancellationToken,
    slot: Arc<Mutex<FetchSlot>>,
    handle: JoinHandle<()>,
}

/// Owner of the per-kind fetch slots
pub struct SubscriptionHub {
    api: Arc<ApiClient>,
    observations: Arc<ObservationBus>,
    throttler: Arc<LogThrottler>,
    slots: Mutex<HashMap<FetchKind, Subscription>>,
}

impl SubscriptionHub {
    pub fn new(api: Arc<ApiClient>, observations: Arc<ObservationBus>) -> Self {
        Self {
            api,
            observations,
            throttler: Arc::new(LogThrottler::default()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Begin periodic fetches for a kind.
    ///
    /// The first fetch fires immediately. Re-subscribing replaces the
    /// interval but keeps the slot's cached value.
    pub fn subscribe(&self, kind: FetchKind, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        let mut slots = self.slots.lock();

        let slot = match slots.remove(&kind) {
            Some(previous) => {
                info!(%kind, "Replacing existing subscription");
                previous.cancel.cancel();
                previous.slot
            }
            None => {
                debug!(%kind, interval_ms = interval.as_millis() as u64, "Subscribing");
                Arc::new(Mutex::new(FetchSlot::default()))
            }
        };

        let cancel = CancellationToken::new();
        let worker = SlotWorker {
            api: Arc::clone(&self.api),
            observations: Arc::clone(&self.observations),
            throttler: Arc::clone(&self.throttler),
            kind,
            interval,
            cancel: cancel.clone(),
            in_flight: Arc::new(AtomicBool::new(false)),
            slot: Arc::clone(&slot),
        };
        let handle = tokio::spawn(worker.run());

        slots.insert(
            kind,
            Subscription {
                cancel,
                slot,
                handle,
            },
        );
    }

    /// Stop periodic fetches for a kind
    pub fn unsubscribe(&self, kind: FetchKind) -> bool {
        match self.slots.lock().remove(&kind) {
            Some(subscription) => {
                debug!(%kind, "Unsubscribing");
                subscription.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of a kind's cached slot state
    pub fn slot(&self, kind: FetchKind) -> Option<FetchSlot> {
        self.slots
            .lock()
            .get(&kind)
            .map(|subscription| subscription.slot.lock().clone())
    }

    /// Kinds with an active subscription
    pub fn subscribed_kinds(&self) -> Vec<FetchKind> {
        self.slots.lock().keys().copied().collect()
    }

    /// Cancel every subscription and wait for the workers to finish
    pub async fn close(&self) {
        let drained: Vec<Subscription> = {
            let mut slots = self.slots.lock();
            slots.drain().map(|(_, subscription)| subscription).collect()
        };
        for subscription in &drained {
            subscription.cancel.cancel();
        }
        for subscription in drained {
            let _ = subscription.handle.await;
        }
    }
}

struct SlotWorker {
    api: Arc<ApiClient>,
    observations: Arc<ObservationBus>,
    throttler: Arc<LogThrottler>,
    kind: FetchKind,
    interval: Duration,
    cancel: CancellationToken,
    in_flight: Arc<AtomicBool>,
    slot: Arc<Mutex<FetchSlot>>,
}

impl SlotWorker {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.in_flight.swap(true, Ordering::SeqCst) {
                debug!(kind = %self.kind, "Skipping tick, previous fetch still in flight");
                continue;
            }

            tokio::spawn(fetch_once(
                Arc::clone(&self.api),
                Arc::clone(&self.observations),
                Arc::clone(&self.throttler),
                self.kind,
                self.cancel.clone(),
                Arc::clone(&self.in_flight),
                Arc::clone(&self.slot),
            ));
        }
    }
}

async fn fetch_once(
    api: Arc<ApiClient>,
    observations: Arc<ObservationBus>,
    throttler: Arc<LogThrottler>,
    kind: FetchKind,
    cancel: CancellationToken,
    in_flight: Arc<AtomicBool>,
    slot: Arc<Mutex<FetchSlot>>,
) {
    let result = api.fetch(kind).await;
    if cancel.is_cancelled() {
        in_flight.store(false, Ordering::SeqCst);
        return;
    }

    let outcome = match result {
        Ok(value) => {
            let mut slot = slot.lock();
            slot.last_value = Some(value.clone());
            slot.last_fetched_at = Some(Utc::now());
            FetchOutcome::Value(value)
        }
        Err(e) => {
            warn_throttled!(
                throttler,
                &format!("fetch_{}", kind),
                "Fetch failed for {}: {}",
                kind,
                e
            );
            FetchOutcome::Error(e.to_string())
        }
    };

    observations.publish(Observation::FetchResult { kind, outcome });
    in_flight.store(false, Ordering::SeqCst);
}
