//! ==============================================================================
//! store.rs - single-writer state store
//! ==============================================================================
//!
//! purpose:
//!     owns every piece of mutable telemetry state in the process:
//!     - the current sample
//!     - the bounded history ring
//!     - the button vector
//!     - the committed thresholds
//!
//! concurrency:
//!     everything sits behind one tokio RwLock. writers hold it only for the
//!     in-memory update (no io inside), so readers never wait on ingestion for
//!     longer than a single push. readers get clones, never references, so a
//!     reader can not observe a half-applied append.
//!
//! relationships:
//!     - used by: lib.rs (AppState::ingest), api.rs (queries and commands)
//!     - uses: classify.rs (status for each reading and on threshold change)
//!
//! ==============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::classify::{assess, classify};
use crate::domain::{
    ButtonStates, HistoryEntry, Reading, Status, TelemetrySample, ThresholdConfig,
};
use crate::error::ValidationError;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

// ==============================================================================
// history ring
// ==============================================================================

/// fifo ring of history entries, oldest first
#[derive(Debug, Clone)]
pub struct HistoryRing {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// append, evicting the oldest entry once full
    pub fn push(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ==============================================================================
// store
// ==============================================================================

/// result of recording one reading: the new current sample and the history
/// entry appended for it
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub sample: TelemetrySample,
    pub entry: HistoryEntry,
}

#[derive(Debug)]
struct Inner {
    current: TelemetrySample,
    history: HistoryRing,
    buttons: ButtonStates,
    thresholds: ThresholdConfig,
    last_update: DateTime<Utc>,
}

#[derive(Debug)]
pub struct StateStore {
    inner: RwLock<Inner>,
}

impl StateStore {
    /// start with the idle seed sample (50 cm / 60 cm, normal) and an empty ring
    pub fn new(history_capacity: usize, thresholds: ThresholdConfig) -> Self {
        let now = Utc::now();
        let (sensor1, sensor2) = (50.0, 60.0);
        let current = TelemetrySample {
            id: Uuid::new_v4(),
            sensor1,
            sensor2,
            timestamp: now,
            status: classify(sensor1, sensor2, &thresholds),
        };
        Self {
            inner: RwLock::new(Inner {
                current,
                history: HistoryRing::new(history_capacity),
                buttons: ButtonStates::default(),
                thresholds,
                last_update: now,
            }),
        }
    }

    pub async fn current(&self) -> TelemetrySample {
        self.inner.read().await.current.clone()
    }

    /// oldest to newest
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.read().await.history.snapshot()
    }

    pub async fn history_len(&self) -> usize {
        self.inner.read().await.history.len()
    }

    pub async fn append_sample(&self, sample: TelemetrySample, entry: HistoryEntry) {
        let mut inner = self.inner.write().await;
        inner.last_update = sample.timestamp;
        inner.current = sample;
        inner.history.push(entry);
    }

    /// classify a reading against the committed thresholds, make it current,
    /// append its history entry and take over its button vector, all under a
    /// single write
    pub async fn record_reading(&self, reading: &Reading, notes: &str) -> Recorded {
        let mut inner = self.inner.write().await;
        let (status, alert_level) = assess(reading.sensor1, reading.sensor2, &inner.thresholds);
        let timestamp = Utc::now();

        let sample = TelemetrySample {
            id: Uuid::new_v4(),
            sensor1: reading.sensor1,
            sensor2: reading.sensor2,
            timestamp,
            status,
        };
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            timestamp,
            sensor1: reading.sensor1,
            sensor2: reading.sensor2,
            button_states: reading.buttons,
            alert_level,
            notes: notes.to_string(),
        };

        inner.current = sample.clone();
        inner.history.push(entry.clone());
        inner.buttons = reading.buttons;
        inner.last_update = timestamp;

        Recorded { sample, entry }
    }

    /// empties the ring; the current sample stays
    pub async fn clear_history(&self) -> usize {
        self.inner.write().await.history.clear()
    }

    pub async fn set_buttons(&self, states: ButtonStates) {
        self.inner.write().await.buttons = states;
    }

    pub async fn buttons(&self) -> ButtonStates {
        self.inner.read().await.buttons
    }

    /// validate then commit; on success the current sample is re-classified
    /// (history is left as recorded) and its new status returned
    pub async fn set_thresholds(&self, cfg: ThresholdConfig) -> Result<Status, ValidationError> {
        cfg.validate()?;
        let mut inner = self.inner.write().await;
        inner.thresholds = cfg;
        let status = classify(inner.current.sensor1, inner.current.sensor2, &cfg);
        inner.current.status = status;
        Ok(status)
    }

    pub async fn thresholds(&self) -> ThresholdConfig {
        self.inner.read().await.thresholds
    }

    pub async fn last_update(&self) -> DateTime<Utc> {
        self.inner.read().await.last_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertLevel, NOTE_DEVICE};

    fn reading(sensor1: f64, sensor2: f64, buttons: [u8; 6]) -> Reading {
        Reading {
            sensor1,
            sensor2,
            buttons: ButtonStates::new(buttons).unwrap(),
        }
    }

    fn store() -> StateStore {
        StateStore::new(DEFAULT_HISTORY_CAPACITY, ThresholdConfig::default())
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let mut ring = HistoryRing::new(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let entry = HistoryEntry {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                sensor1: f64::from(i),
                sensor2: 0.0,
                button_states: ButtonStates::default(),
                alert_level: AlertLevel::Low,
                notes: String::new(),
            };
            ids.push(entry.id);
            let evicted = ring.push(entry);
            assert_eq!(evicted.is_some(), i >= 3);
        }
        let kept: Vec<_> = ring.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(kept, ids[2..]);
    }

    #[test]
    fn ring_capacity_is_at_least_one() {
        assert_eq!(HistoryRing::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn history_is_bounded_and_keeps_most_recent() {
        let store = store();
        for n in 0..250u32 {
            store.record_reading(&reading(f64::from(n), 100.0, [0; 6]), NOTE_DEVICE).await;
            let expected = (n as usize + 1).min(DEFAULT_HISTORY_CAPACITY);
            assert_eq!(store.history_len().await, expected);
        }
        let history = store.history().await;
        let kept: Vec<f64> = history.iter().map(|e| e.sensor1).collect();
        let expected: Vec<f64> = (150..250).map(f64::from).collect();
        assert_eq!(kept, expected);
    }

    #[tokio::test]
    async fn device_scenario_with_default_thresholds() {
        let store = store();
        let recorded = store.record_reading(&reading(12.0, 50.0, [1, 0, 0, 0, 0, 0]), NOTE_DEVICE).await;

        assert_eq!(recorded.sample.status, Status::Danger);
        assert_eq!(recorded.entry.alert_level, AlertLevel::High);
        assert_eq!(store.current().await, recorded.sample);
        assert_eq!(store.buttons().await.as_array(), [1, 0, 0, 0, 0, 0]);

        let history = store.history().await;
        assert_eq!(history.len(), 1);
        let entry = &history[0];
        assert_eq!(entry.sensor1, 12.0);
        assert_eq!(entry.sensor2, 50.0);
        assert_eq!(entry.button_states.as_array(), [1, 0, 0, 0, 0, 0]);
        assert_eq!(entry.notes, NOTE_DEVICE);
        assert_eq!(entry.timestamp, recorded.sample.timestamp);
    }

    #[tokio::test]
    async fn clear_history_keeps_current() {
        let store = store();
        store.record_reading(&reading(40.0, 40.0, [0; 6]), NOTE_DEVICE).await;
        let before = store.current().await;

        assert_eq!(store.clear_history().await, 1);
        assert!(store.history().await.is_empty());
        assert_eq!(store.current().await, before);
    }

    #[tokio::test]
    async fn invalid_thresholds_keep_prior_config() {
        let store = store();
        let err = store
            .set_thresholds(ThresholdConfig { danger: 30.0, warning: 20.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::WarningNotAboveDanger { .. }));
        assert_eq!(store.thresholds().await, ThresholdConfig::default());
    }

    #[tokio::test]
    async fn committed_thresholds_drive_later_classification() {
        let store = store();
        store.set_thresholds(ThresholdConfig { danger: 10.0, warning: 20.0 }).await.unwrap();

        let recorded = store.record_reading(&reading(12.0, 50.0, [0; 6]), NOTE_DEVICE).await;
        assert_eq!(recorded.sample.status, Status::Warning);
        assert_eq!(recorded.entry.alert_level, AlertLevel::Medium);
    }

    #[tokio::test]
    async fn threshold_change_reclassifies_current_only() {
        let store = store();
        store.record_reading(&reading(30.0, 80.0, [0; 6]), NOTE_DEVICE).await;
        assert_eq!(store.current().await.status, Status::Normal);

        let status = store
            .set_thresholds(ThresholdConfig { danger: 35.0, warning: 50.0 })
            .await
            .unwrap();
        assert_eq!(status, Status::Danger);
        assert_eq!(store.current().await.status, Status::Danger);
        // the recorded entry keeps the level it was classified with
        assert_eq!(store.history().await[0].alert_level, AlertLevel::Low);
    }

    #[tokio::test]
    async fn buttons_last_writer_wins() {
        let store = store();
        store.set_buttons(ButtonStates::new([1, 1, 1, 0, 0, 0]).unwrap()).await;
        store.record_reading(&reading(80.0, 80.0, [0, 0, 0, 0, 0, 1]), NOTE_DEVICE).await;
        assert_eq!(store.buttons().await.as_array(), [0, 0, 0, 0, 0, 1]);
        store.set_buttons(ButtonStates::new([1, 0, 1, 0, 1, 0]).unwrap()).await;
        assert_eq!(store.buttons().await.as_array(), [1, 0, 1, 0, 1, 0]);
    }

    #[tokio::test]
    async fn append_sample_updates_current_and_ring() {
        let store = store();
        let now = Utc::now();
        let sample = TelemetrySample {
            id: Uuid::new_v4(),
            sensor1: 70.0,
            sensor2: 71.0,
            timestamp: now,
            status: Status::Normal,
        };
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            timestamp: now,
            sensor1: 70.0,
            sensor2: 71.0,
            button_states: ButtonStates::default(),
            alert_level: AlertLevel::Low,
            notes: String::new(),
        };
        store.append_sample(sample.clone(), entry.clone()).await;
        assert_eq!(store.current().await, sample);
        assert_eq!(store.history().await, vec![entry]);
        assert_eq!(store.last_update().await, now);
    }

    #[tokio::test]
    async fn concurrent_readers_never_see_torn_appends() {
        let store = std::sync::Arc::new(store());
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for n in 0..200u32 {
                    store.record_reading(&reading(f64::from(n), 100.0, [0; 6]), NOTE_DEVICE).await;
                }
            })
        };
        for _ in 0..200 {
            let history = store.history().await;
            assert!(history.len() <= DEFAULT_HISTORY_CAPACITY);
            // arrival order is preserved in every snapshot
            assert!(history.windows(2).all(|w| w[0].sensor1 < w[1].sensor1));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
