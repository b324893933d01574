//! synthetic telemetry source.
//!
//! stands in for the ESP32 when `source.kind = "simulate"`: every tick it
//! produces two distances in 10..=100 cm and feeds them through the same
//! ingestion path as a real device frame. buttons are carried over from the
//! store so the generator never overrides dashboard commands.

use std::time::Duration;

use rand::Rng;

use crate::domain::{ButtonStates, Reading, NOTE_SYNTHETIC};
use crate::AppState;

pub const MIN_DISTANCE_CM: u32 = 10;
pub const MAX_DISTANCE_CM: u32 = 100;

pub fn synthetic_reading<R: Rng + ?Sized>(rng: &mut R, buttons: ButtonStates) -> Reading {
    Reading {
        sensor1: f64::from(rng.gen_range(MIN_DISTANCE_CM..=MAX_DISTANCE_CM)),
        sensor2: f64::from(rng.gen_range(MIN_DISTANCE_CM..=MAX_DISTANCE_CM)),
        buttons,
    }
}

pub async fn run(state: AppState, every: Duration) {
    tracing::info!(interval_ms = every.as_millis() as u64, "synthetic telemetry source running");
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let buttons = state.store.buttons().await;
        // thread_rng is not Send; keep it out of the await points
        let reading = synthetic_reading(&mut rand::thread_rng(), buttons);
        state.ingest(reading, NOTE_SYNTHETIC).await;
    }
}
