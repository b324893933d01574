//! ==============================================================================
//! link.rs - device link manager
//! ==============================================================================
//!
//! purpose:
//!     owns the one privileged connection to the ESP32 controller.
//!
//! state machine:
//!
//! ```text
//!         claim() ok                  lease dropped
//!     Idle ─────────────▶ Linked ─────────────────────▶ Idle
//!                           │
//!                           └── claim() from anyone else → LinkError::Occupied
//! ```
//!
//! ```text
//!     the check and the assignment happen under one mutex, so two sockets
//!     racing for an idle link can not both win. the winner gets a LinkLease;
//!     dropping it (socket closed, errored, task ended) releases the slot, but
//!     only if the slot still belongs to that lease.
//! ```
//!
//! outbound:
//!     send() pushes a DeviceCommand into the lease's queue while Linked.
//!     when Idle, or when the holder's queue is gone, the caller gets
//!     LinkError::Unavailable. nothing is buffered for a future device.
//!     the queue holds COMMAND_QUEUE_DEPTH commands; a controller that stops
//!     reading fills it and further sends get LinkError::Busy.
//!
//! relationships:
//!     - used by: ws.rs (device sessions hold the lease), api.rs (send)
//!     - frame parsing for inbound telemetry lives here too (parse_frame)
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::{DeviceCommand, Reading};
use crate::error::{FrameError, LinkError};

pub type LinkId = u64;

/// commands waiting for the session loop to forward them
pub const COMMAND_QUEUE_DEPTH: usize = 8;

struct Holder {
    id: LinkId,
    since: DateTime<Utc>,
    commands: mpsc::Sender<DeviceCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LinkStatus {
    Idle,
    Linked { id: LinkId, since: DateTime<Utc> },
}

#[derive(Default)]
pub struct DeviceLink {
    slot: Mutex<Option<Holder>>,
    next_id: AtomicU64,
}

impl DeviceLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Holder>> {
        // the critical sections never panic midway, so a poisoned slot is still consistent
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle → Linked. Fails with `Occupied` while another lease is live.
    pub fn claim(self: &Arc<Self>) -> Result<LinkLease, LinkError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(LinkError::Occupied);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        *slot = Some(Holder {
            id,
            since: Utc::now(),
            commands: tx,
        });
        tracing::info!(link = id, "controller linked");
        Ok(LinkLease {
            id,
            link: Arc::clone(self),
            commands: rx,
        })
    }

    /// queue a command for the linked controller
    pub fn send(&self, command: DeviceCommand) -> Result<(), LinkError> {
        let mut slot = self.slot();
        let Some(holder) = slot.as_ref() else {
            return Err(LinkError::Unavailable);
        };
        match holder.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(link = holder.id, "controller is not draining commands, command dropped");
                Err(LinkError::Busy)
            }
            Err(TrySendError::Closed(_)) => {
                // the session is gone but has not released yet; don't leave a stale handle behind
                tracing::warn!(link = holder.id, "controller queue closed, dropping stale link");
                *slot = None;
                Err(LinkError::Unavailable)
            }
        }
    }

    pub fn is_linked(&self) -> bool {
        self.slot().is_some()
    }

    pub fn status(&self) -> LinkStatus {
        match self.slot().as_ref() {
            Some(holder) => LinkStatus::Linked {
                id: holder.id,
                since: holder.since,
            },
            None => LinkStatus::Idle,
        }
    }

    fn release(&self, id: LinkId) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|holder| holder.id == id) {
            *slot = None;
            tracing::info!(link = id, "controller unlinked");
        }
    }
}

/// exclusive ownership of the device link; Linked for as long as it lives
pub struct LinkLease {
    id: LinkId,
    link: Arc<DeviceLink>,
    commands: mpsc::Receiver<DeviceCommand>,
}

impl LinkLease {
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// next command to forward to the device; None once the link was
    /// taken away from this lease
    pub async fn next_command(&mut self) -> Option<DeviceCommand> {
        self.commands.recv().await
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        self.link.release(self.id);
    }
}

// ==============================================================================
// inbound frames
// ==============================================================================

/// what a text frame on a device-capable socket turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `{"type":"esp32"}`: the sender claims to be the controller
    Identify,
    Telemetry(Reading),
}

pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("type").and_then(|t| t.as_str()) == Some("esp32") {
        return Ok(InboundFrame::Identify);
    }
    let reading: Reading = serde_json::from_value(value)?;
    reading.validate()?;
    Ok(InboundFrame::Telemetry(reading))
}
