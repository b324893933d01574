//! ==============================================================================
//! proximity-broker - telemetry broker for an ESP32 proximity rig
//! ==============================================================================
//!
//! purpose:
//!     receives ultrasonic distance + button telemetry from one ESP32,
//!     classifies proximity into alert levels, keeps current state plus a
//!     bounded history, and serves it to a dashboard over http and websocket.
//!
//! architecture:
//!
//! ```text
//!     ┌────────────┐ /ws/device  ┌──────────┐  record   ┌──────────────┐
//!     │   ESP32    │────────────▶│   link   │──────────▶│    store     │
//!     │            │◀────────────│ (lease)  │           │ (RwLock)     │
//!     └────────────┘  commands   └────▲─────┘           └──┬────────┬──┘
//!                                     │ send                │        │
//!                               ┌─────┴─────┐   queries     │        │ submit
//!     dashboard ── http :3001 ─▶│    api    │◀──────────────┘        ▼
//!                               └───────────┘                 ┌──────────┐
//!     dashboard ── ws   :3002 ◀── broadcast (systemInfo/5s)   │ persist  │
//!                                                             └──────────┘
//! ```
//!
//! relationships:
//!     - main.rs wires config, logging, background tasks and the two listeners
//!     - AppState is the one handle every task and handler shares
//!
//! ==============================================================================

pub mod api;
pub mod broadcast;
pub mod classify;
pub mod config;
pub mod domain;
pub mod error;
pub mod link;
pub mod persist;
pub mod simulate;
pub mod store;
pub mod ws;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;

use crate::broadcast::{format_uptime, Broadcaster, SystemInfo};
use crate::config::BrokerConfig;
use crate::domain::Reading;
use crate::link::DeviceLink;
use crate::persist::Persistence;
use crate::store::{Recorded, StateStore};

// ==============================================================================
// shared state
// ==============================================================================
// cloned into every handler and background task. all mutable telemetry lives
// in the store; the link and broadcaster keep their own small registries.

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub link: Arc<DeviceLink>,
    pub broadcaster: Arc<Broadcaster>,
    pub persistence: Arc<Persistence>,
    pub started: Instant,
    /// advertised to observers in the system digest
    pub ws_ip: String,
    pub ws_port: u16,
    pub show_frames: bool,
}

impl AppState {
    pub fn new(config: &BrokerConfig, persistence: Persistence) -> Self {
        Self {
            store: Arc::new(StateStore::new(config.history.capacity, config.thresholds)),
            link: Arc::new(DeviceLink::new()),
            broadcaster: Arc::new(Broadcaster::new()),
            persistence: Arc::new(persistence),
            started: Instant::now(),
            ws_ip: advertised_ip(),
            ws_port: config.server.ws_port,
            show_frames: config.logging.show_frames,
        }
    }

    /// accept one reading: classify + store in one write, then hand a copy
    /// to persistence without waiting on it
    pub async fn ingest(&self, reading: Reading, notes: &str) -> Recorded {
        let recorded = self.store.record_reading(&reading, notes).await;
        if self.show_frames {
            tracing::info!(
                sensor1 = reading.sensor1,
                sensor2 = reading.sensor2,
                status = recorded.sample.status.as_str(),
                notes,
                "telemetry accepted"
            );
        } else {
            tracing::debug!(
                sensor1 = reading.sensor1,
                sensor2 = reading.sensor2,
                status = recorded.sample.status.as_str(),
                notes,
                "telemetry accepted"
            );
        }
        self.persistence.submit(recorded.clone());
        recorded
    }

    pub async fn system_info(&self) -> SystemInfo {
        let uptime = self.started.elapsed().as_secs();
        SystemInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime,
            uptime_text: format_uptime(uptime),
            persistence_connected: self.persistence.is_connected(),
            device_connected: self.link.is_linked(),
            last_update: self.store.last_update().await,
            ws_ip: self.ws_ip.clone(),
            ws_port: self.ws_port,
        }
    }
}

/// first non-loopback IPv4 of this host, or 0.0.0.0 when there is none
fn advertised_ip() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            tracing::warn!("no non-loopback IPv4 address found: {e}");
            "0.0.0.0".to_string()
        }
    }
}

// ==============================================================================
// listeners
// ==============================================================================

/// serve the rest api until `shutdown` resolves
pub async fn serve_http<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// serve the device and observer sockets until `shutdown` resolves; peers'
/// addresses are handed to the sessions for logging
pub async fn serve_ws<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        ws::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
