//! ==============================================================================
//! domain.rs - telemetry types shared by every component
//! ==============================================================================
//!
//! purpose:
//!     the wire and in-memory shapes of the broker: samples, history entries,
//!     the 6-button vector, the threshold pair and the device command frames.
//!
//! relationships:
//!     - used by: classify.rs, store.rs, link.rs, api.rs, ws.rs, persist.rs
//!     - validation failures are reported as error::ValidationError
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// number of actuators on the controller board
pub const BUTTON_COUNT: usize = 6;

/// history note for frames that came over the device link
pub const NOTE_DEVICE: &str = "device frame";
/// history note for ticks produced by the simulator
pub const NOTE_SYNTHETIC: &str = "synthetic";

// ==============================================================================
// classification results
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Normal,
    Warning,
    Danger,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Warning => "warning",
            Status::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Low => "low",
            AlertLevel::Medium => "medium",
            AlertLevel::High => "high",
        }
    }
}

impl From<Status> for AlertLevel {
    fn from(status: Status) -> Self {
        match status {
            Status::Danger => AlertLevel::High,
            Status::Warning => AlertLevel::Medium,
            Status::Normal => AlertLevel::Low,
        }
    }
}

// ==============================================================================
// button vector
// ==============================================================================
// serialized as a bare json array: [1,0,0,0,0,0]
// deserialization goes through TryFrom so a wrong length or a value other than
// 0/1 is rejected before it can reach the store.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>")]
pub struct ButtonStates([u8; BUTTON_COUNT]);

impl ButtonStates {
    pub fn new(states: [u8; BUTTON_COUNT]) -> Result<Self, ValidationError> {
        Self::try_from(states.iter().map(|&v| i64::from(v)).collect::<Vec<_>>())
    }

    pub fn as_array(&self) -> [u8; BUTTON_COUNT] {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }
}

impl TryFrom<Vec<i64>> for ButtonStates {
    type Error = ValidationError;

    fn try_from(values: Vec<i64>) -> Result<Self, Self::Error> {
        if values.len() != BUTTON_COUNT {
            return Err(ValidationError::ButtonCount {
                expected: BUTTON_COUNT,
                got: values.len(),
            });
        }
        let mut states = [0u8; BUTTON_COUNT];
        for (index, (slot, value)) in states.iter_mut().zip(values).enumerate() {
            *slot = match value {
                0 => 0,
                1 => 1,
                other => return Err(ValidationError::ButtonValue { index, value: other }),
            };
        }
        Ok(Self(states))
    }
}

// ==============================================================================
// thresholds
// ==============================================================================

/// distance bands in centimetres; anything nearer than `danger` is danger,
/// nearer than `warning` is warning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub danger: f64,
    pub warning: f64,
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.danger.is_finite() || !self.warning.is_finite() {
            return Err(ValidationError::NonFiniteThreshold);
        }
        if self.danger < 1.0 {
            return Err(ValidationError::DangerTooLow(self.danger));
        }
        if self.warning <= self.danger {
            return Err(ValidationError::WarningNotAboveDanger {
                danger: self.danger,
                warning: self.warning,
            });
        }
        Ok(())
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self { danger: 15.0, warning: 25.0 }
    }
}

// ==============================================================================
// samples and history
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub id: Uuid,
    pub sensor1: f64,
    pub sensor2: f64,
    pub timestamp: DateTime<Utc>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sensor1: f64,
    pub sensor2: f64,
    pub button_states: ButtonStates,
    pub alert_level: AlertLevel,
    pub notes: String,
}

/// one validated telemetry frame: two distances and the full button vector
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Reading {
    pub sensor1: f64,
    pub sensor2: f64,
    pub buttons: ButtonStates,
}

impl Reading {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.sensor1.is_finite() || !self.sensor2.is_finite() {
            return Err(ValidationError::NonFiniteDistance);
        }
        Ok(())
    }
}

// ==============================================================================
// outbound frames
// ==============================================================================

/// command pushed down the device link; serialized untagged so the device
/// sees `{"buttons":[..]}` or `{"thresholds":{..}}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeviceCommand {
    Buttons { buttons: ButtonStates },
    Thresholds { thresholds: ThresholdConfig },
}
