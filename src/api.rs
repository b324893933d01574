//! ==============================================================================
//! api.rs - http command / query surface
//! ==============================================================================
//!
//! purpose:
//!     thin translation from http requests to store queries, store commands
//!     and device-link sends. handlers never touch state except through
//!     StateStore / DeviceLink / Persistence methods.
//!
//! status codes:
//!     - 400 → the request itself was bad (ValidationError, unparsable body)
//!     - 503 → the request was fine but no controller is linked or it is
//!             not draining commands (or, for the persisted-store routes, no
//!             persistence backend is configured). command bodies echo what
//!             was committed next to the message.
//!     - 500 → a persistence query failed
//!
//! persisted-store routes:
//!     served under /api/mysql/* (the names the dashboard calls) and under
//!     /api/store/*. both prefixes hit the same handlers.
//!
//! ==============================================================================

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::broadcast::SystemInfo;
use crate::domain::{ButtonStates, DeviceCommand, HistoryEntry, TelemetrySample, ThresholdConfig};
use crate::error::{LinkError, PersistError, ValidationError};
use crate::link::LinkStatus;
use crate::persist::{ButtonRow, ChartData, HistoryRow, SensorRow, StatusRow, CHART_HOURS};
use crate::AppState;

/// persisted status rows served by /api/store/sensor-status-history
const STATUS_HISTORY_LIMIT: usize = 100;

/// prefixes the persisted-store routes are mounted under
const STORE_PREFIXES: [&str; 2] = ["/api/mysql", "/api/store"];

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/sensor", get(get_sensor))
        .route("/api/buttons", get(get_buttons).post(post_buttons))
        .route("/api/history", get(get_history).delete(delete_history))
        .route("/api/thresholds", get(get_thresholds).post(post_thresholds))
        .route("/api/esp32/send-buttons", post(relay_buttons))
        .route("/api/system", get(get_system))
        .route("/api/link", get(get_link));
    for prefix in STORE_PREFIXES {
        router = router
            .route(&format!("{prefix}/sensor_data"), get(store_sensor_data))
            .route(&format!("{prefix}/button_states"), get(store_button_states))
            .route(&format!("{prefix}/history_log"), get(store_history_log))
            .route(&format!("{prefix}/sensor-status-history"), get(store_status_history))
            .route(&format!("{prefix}/chart-data"), get(store_chart_data));
    }
    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ==============================================================================
// errors
// ==============================================================================

#[derive(Debug)]
pub enum ApiError {
    /// 400 with the reason
    Validation(String),
    /// 503; the fields of the object are what was committed before the relay
    /// failed, returned alongside the message
    Device(LinkError, Value),
    Persistence(PersistError),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Validation(e.body_text())
    }
}

impl From<PersistError> for ApiError {
    fn from(e: PersistError) -> Self {
        ApiError::Persistence(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
            }
            ApiError::Device(e, committed) => {
                let mut body = json!({ "message": e.to_string() });
                if let (Some(body), Value::Object(committed)) = (body.as_object_mut(), committed) {
                    body.extend(committed);
                }
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
            ApiError::Persistence(PersistError::Disabled) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": PersistError::Disabled.to_string() })),
            )
                .into_response(),
            ApiError::Persistence(e) => {
                tracing::error!("persistence query failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": e.to_string() })))
                    .into_response()
            }
        }
    }
}

// ==============================================================================
// queries
// ==============================================================================

async fn get_sensor(State(state): State<AppState>) -> Json<TelemetrySample> {
    Json(state.store.current().await)
}

async fn get_buttons(State(state): State<AppState>) -> Json<ButtonStates> {
    Json(state.store.buttons().await)
}

async fn get_history(State(state): State<AppState>) -> Json<Vec<HistoryEntry>> {
    Json(state.store.history().await)
}

async fn get_thresholds(State(state): State<AppState>) -> Json<ThresholdConfig> {
    Json(state.store.thresholds().await)
}

async fn get_system(State(state): State<AppState>) -> Json<SystemInfo> {
    Json(state.system_info().await)
}

async fn get_link(State(state): State<AppState>) -> Json<LinkStatus> {
    Json(state.link.status())
}

// ==============================================================================
// commands
// ==============================================================================

#[derive(Deserialize)]
struct ButtonsRequest {
    states: ButtonStates,
}

/// store first, then relay; the store keeps the new vector even when no
/// controller is there to receive it
async fn post_buttons(
    State(state): State<AppState>,
    payload: Result<Json<ButtonsRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(ButtonsRequest { states }) = payload?;
    state.store.set_buttons(states).await;
    tracing::info!(states = ?states.as_array(), "buttons updated from dashboard");

    state
        .link
        .send(DeviceCommand::Buttons { buttons: states })
        .map_err(|e| ApiError::Device(e, json!({ "states": states })))?;
    Ok(Json(json!({ "message": "buttons updated and sent to controller", "states": states })))
}

/// relay only; the store is not touched
async fn relay_buttons(
    State(state): State<AppState>,
    payload: Result<Json<ButtonsRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(ButtonsRequest { states }) = payload?;
    state
        .link
        .send(DeviceCommand::Buttons { buttons: states })
        .map_err(|e| ApiError::Device(e, Value::Null))?;
    Ok(Json(json!({ "message": "sent to controller", "states": states })))
}

async fn post_thresholds(
    State(state): State<AppState>,
    payload: Result<Json<ThresholdConfig>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(thresholds) = payload?;
    let status = state.store.set_thresholds(thresholds).await?;
    tracing::info!(
        danger = thresholds.danger,
        warning = thresholds.warning,
        current = status.as_str(),
        "thresholds updated"
    );

    state
        .link
        .send(DeviceCommand::Thresholds { thresholds })
        .map_err(|e| ApiError::Device(e, json!({ "thresholds": thresholds })))?;
    Ok(Json(json!({ "message": "thresholds updated", "thresholds": thresholds })))
}

/// in-memory ring only; persisted rows stay
async fn delete_history(State(state): State<AppState>) -> Json<Value> {
    let removed = state.store.clear_history().await;
    tracing::info!(removed, "in-memory history cleared");
    Json(json!({ "message": "history cleared", "removed": removed }))
}

// ==============================================================================
// persisted-store passthrough
// ==============================================================================

async fn store_sensor_data(State(state): State<AppState>) -> Result<Json<Vec<SensorRow>>, ApiError> {
    Ok(Json(state.persistence.query(|db| db.sensor_rows()).await?))
}

async fn store_button_states(State(state): State<AppState>) -> Result<Json<Vec<ButtonRow>>, ApiError> {
    Ok(Json(state.persistence.query(|db| db.button_rows()).await?))
}

async fn store_history_log(State(state): State<AppState>) -> Result<Json<Vec<HistoryRow>>, ApiError> {
    Ok(Json(state.persistence.query(|db| db.history_rows()).await?))
}

async fn store_status_history(State(state): State<AppState>) -> Result<Json<Vec<StatusRow>>, ApiError> {
    Ok(Json(
        state
            .persistence
            .query(|db| db.status_history(STATUS_HISTORY_LIMIT))
            .await?,
    ))
}

/// last 24 hours bucketed by hour of day, for the charts page
async fn store_chart_data(State(state): State<AppState>) -> Result<Json<ChartData>, ApiError> {
    let since = Utc::now() - chrono::Duration::hours(CHART_HOURS as i64);
    Ok(Json(state.persistence.query(move |db| db.chart_data(since)).await?))
}
