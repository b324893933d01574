//! ==============================================================================
//! broadcast.rs - system-status fan-out to dashboard observers
//! ==============================================================================
//!
//! purpose:
//!     every tick, build a SystemInfo digest and push it to each subscribed
//!     observer socket.
//!
//! delivery:
//!     each subscriber owns a queue of depth 1. a tick does exactly one
//!     try_send per subscriber:
//!     - accepted → delivered
//!     - full     → that observer has not drained the last digest yet; it is
//!                  skipped for this tick (no retry, no backlog)
//!     - closed   → the observer went away; its entry is pruned here, lazily
//!
//! relationships:
//!     - used by: ws.rs (observer sessions subscribe), main.rs (spawns run_ticker)
//!     - reads: lib.rs AppState::system_info for the digest
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::AppState;

pub type SubscriberId = u64;

/// the digest pushed to observers every tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub version: String,
    /// seconds since the broker started
    pub uptime: u64,
    pub uptime_text: String,
    pub persistence_connected: bool,
    pub device_connected: bool,
    pub last_update: DateTime<Utc>,
    /// where the controller and dashboards should point their sockets
    pub ws_ip: String,
    pub ws_port: u16,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a SystemInfo,
}

/// `{"type":"systemInfo","data":{...}}`
pub fn system_info_frame(info: &SystemInfo) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        kind: "systemInfo",
        data: info,
    })
}

/// "2d 3h 14m"
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

// ==============================================================================
// subscriber registry
// ==============================================================================

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Arc<str>>,
}

/// receiving half handed to an observer session
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<str>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub skipped: usize,
    pub pruned: usize,
}

#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(1);
        self.subscribers().push(Subscriber { id, tx });
        tracing::debug!(subscriber = id, "observer subscribed");
        Subscription { id, rx }
    }

    /// one delivery attempt per subscriber
    pub fn publish(&self, payload: Arc<str>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        self.subscribers().retain(|sub| match sub.tx.try_send(Arc::clone(&payload)) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                report.skipped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = sub.id, "pruning closed observer");
                report.pruned += 1;
                false
            }
        });
        report
    }

    /// registered subscribers, including closed ones not yet pruned
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

// ==============================================================================
// ticker
// ==============================================================================

/// build and publish one digest
pub async fn tick(state: &AppState) -> Option<DeliveryReport> {
    let info = state.system_info().await;
    match system_info_frame(&info) {
        Ok(frame) => Some(state.broadcaster.publish(Arc::from(frame))),
        Err(e) => {
            tracing::error!("failed to encode system info: {e}");
            None
        }
    }
}

pub async fn run_ticker(state: AppState, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Some(report) = tick(&state).await {
            if report.skipped > 0 || report.pruned > 0 {
                tracing::debug!(
                    delivered = report.delivered,
                    skipped = report.skipped,
                    pruned = report.pruned,
                    "system info broadcast"
                );
            }
        }
    }
}
