//! error taxonomy of the broker.
//!
//! each class maps to a different outcome: validation errors are 400s,
//! an unavailable device is a 503, malformed frames and persistence failures
//! are logged and never reach an http caller.

use thiserror::Error;

/// bad input from the dashboard or the device; nothing was mutated
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("button vector must hold exactly {expected} values, got {got}")]
    ButtonCount { expected: usize, got: usize },

    #[error("button {index} must be 0 or 1, got {value}")]
    ButtonValue { index: usize, value: i64 },

    #[error("thresholds must be finite numbers")]
    NonFiniteThreshold,

    #[error("danger threshold must be at least 1, got {0}")]
    DangerTooLow(f64),

    #[error("warning threshold ({warning}) must be greater than danger threshold ({danger})")]
    WarningNotAboveDanger { danger: f64, warning: f64 },

    #[error("distance readings must be finite numbers")]
    NonFiniteDistance,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// another controller already holds the link
    #[error("a controller is already connected")]
    Occupied,

    /// no controller is linked, or the one that was has gone away
    #[error("no controller connected")]
    Unavailable,

    /// linked, but the controller's command queue is full
    #[error("controller is not accepting commands")]
    Busy,
}

/// an inbound device frame that could not be turned into a reading
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid telemetry json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persistence is not configured")]
    Disabled,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("persistence task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
