//! ==============================================================================
//! persist.rs - best-effort telemetry log
//! ==============================================================================
//!
//! purpose:
//!     keeps a copy of every accepted sample in a relational store so the
//!     dashboard can page through more than the in-memory ring.
//!
//! guarantees (or lack of them):
//!     - submit() never blocks: it try_sends into a bounded queue; a full
//!       queue drops the record with a warning
//!     - one worker task drains the queue and runs the blocking writes on the
//!       blocking pool
//!     - a failed write is logged, marks the backend disconnected and is not
//!       retried. the in-memory store is never rolled back.
//!
//! relationships:
//!     - used by: lib.rs (AppState::ingest submits), api.rs (persisted-store reads)
//!     - TelemetryBackend is the seam; SqliteBackend is the real one
//!
//! ==============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::PersistError;
use crate::store::Recorded;

// ==============================================================================
// rows returned by the read-only passthrough routes
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRow {
    pub id: String,
    pub sensor1: f64,
    pub sensor2: f64,
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ButtonRow {
    pub id: i64,
    pub sensor_data_id: String,
    pub button_index: i64,
    pub state: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRow {
    pub id: String,
    pub sensor_data_id: String,
    pub alert_level: String,
    pub notes: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRow {
    pub id: String,
    pub status: String,
    pub timestamp: String,
}

/// totals by status over the chart window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertCounts {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
}

/// hour-of-day buckets (UTC, 0..24) over the chart window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    /// "0:00" .. "23:00"
    pub labels: Vec<String>,
    /// average distance per hour, 0 for hours without samples
    pub sensor1_data: Vec<f64>,
    pub sensor2_data: Vec<f64>,
    pub alert_counts: AlertCounts,
    /// samples per hour
    pub hourly_activity: Vec<i64>,
}

pub const CHART_HOURS: usize = 24;

impl ChartData {
    fn empty() -> Self {
        Self {
            labels: (0..CHART_HOURS).map(|h| format!("{h}:00")).collect(),
            sensor1_data: vec![0.0; CHART_HOURS],
            sensor2_data: vec![0.0; CHART_HOURS],
            alert_counts: AlertCounts::default(),
            hourly_activity: vec![0; CHART_HOURS],
        }
    }
}

/// storage seam; implementations are blocking and get called from the
/// blocking pool
pub trait TelemetryBackend: Send + Sync {
    fn write(&self, record: &Recorded) -> Result<(), PersistError>;
    /// newest first
    fn sensor_rows(&self) -> Result<Vec<SensorRow>, PersistError>;
    fn button_rows(&self) -> Result<Vec<ButtonRow>, PersistError>;
    fn history_rows(&self) -> Result<Vec<HistoryRow>, PersistError>;
    /// the last `limit` statuses, oldest first
    fn status_history(&self, limit: usize) -> Result<Vec<StatusRow>, PersistError>;
    /// samples taken at or after `since`, bucketed by hour of day
    fn chart_data(&self, since: DateTime<Utc>) -> Result<ChartData, PersistError>;
}

// ==============================================================================
// sqlite backend
// ==============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sensor_data (
    id        TEXT PRIMARY KEY,
    sensor1   REAL NOT NULL,
    sensor2   REAL NOT NULL,
    status    TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS button_states (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_data_id TEXT NOT NULL REFERENCES sensor_data(id),
    button_index   INTEGER NOT NULL,
    state          INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS history_log (
    id             TEXT PRIMARY KEY,
    sensor_data_id TEXT NOT NULL REFERENCES sensor_data(id),
    alert_level    TEXT NOT NULL,
    notes          TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sensor_data_timestamp ON sensor_data(timestamp);
";

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, PersistError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TelemetryBackend for SqliteBackend {
    fn write(&self, record: &Recorded) -> Result<(), PersistError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let sample = &record.sample;
        let sample_id = sample.id.to_string();
        let timestamp = sample.timestamp.to_rfc3339();

        tx.execute(
            "INSERT INTO sensor_data (id, sensor1, sensor2, status, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sample_id, sample.sensor1, sample.sensor2, sample.status.as_str(), timestamp],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO button_states (sensor_data_id, button_index, state) VALUES (?1, ?2, ?3)",
            )?;
            for (index, state) in record.entry.button_states.iter().enumerate() {
                insert.execute(params![sample_id, index as i64, i64::from(state)])?;
            }
        }
        tx.execute(
            "INSERT INTO history_log (id, sensor_data_id, alert_level, notes, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.entry.id.to_string(),
                sample_id,
                record.entry.alert_level.as_str(),
                record.entry.notes,
                timestamp
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn sensor_rows(&self) -> Result<Vec<SensorRow>, PersistError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, sensor1, sensor2, status, timestamp FROM sensor_data ORDER BY timestamp DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SensorRow {
                    id: row.get(0)?,
                    sensor1: row.get(1)?,
                    sensor2: row.get(2)?,
                    status: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn button_rows(&self) -> Result<Vec<ButtonRow>, PersistError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, sensor_data_id, button_index, state FROM button_states ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ButtonRow {
                    id: row.get(0)?,
                    sensor_data_id: row.get(1)?,
                    button_index: row.get(2)?,
                    state: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn history_rows(&self) -> Result<Vec<HistoryRow>, PersistError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, sensor_data_id, alert_level, notes, created_at FROM history_log ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(HistoryRow {
                    id: row.get(0)?,
                    sensor_data_id: row.get(1)?,
                    alert_level: row.get(2)?,
                    notes: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn status_history(&self, limit: usize) -> Result<Vec<StatusRow>, PersistError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, status, timestamp FROM sensor_data ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map([limit as i64], |row| {
                Ok(StatusRow {
                    id: row.get(0)?,
                    status: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    fn chart_data(&self, since: DateTime<Utc>) -> Result<ChartData, PersistError> {
        let conn = self.conn();
        let since = since.to_rfc3339();
        let mut chart = ChartData::empty();

        let mut stmt = conn.prepare(
            "SELECT CAST(strftime('%H', timestamp) AS INTEGER) AS hour,
                    AVG(sensor1), AVG(sensor2), COUNT(*)
             FROM sensor_data
             WHERE julianday(timestamp) >= julianday(?1)
             GROUP BY hour",
        )?;
        let buckets = stmt.query_map([&since], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for bucket in buckets {
            let (hour, avg1, avg2, count) = bucket?;
            let Some(hour) = usize::try_from(hour).ok().filter(|h| *h < CHART_HOURS) else {
                continue;
            };
            chart.sensor1_data[hour] = avg1;
            chart.sensor2_data[hour] = avg2;
            chart.hourly_activity[hour] = count;
        }

        chart.alert_counts = conn.query_row(
            "SELECT COALESCE(SUM(status = 'normal'), 0),
                    COALESCE(SUM(status = 'warning'), 0),
                    COALESCE(SUM(status = 'danger'), 0)
             FROM sensor_data
             WHERE julianday(timestamp) >= julianday(?1)",
            [&since],
            |row| {
                Ok(AlertCounts {
                    low: row.get(0)?,
                    medium: row.get(1)?,
                    high: row.get(2)?,
                })
            },
        )?;
        Ok(chart)
    }
}

// ==============================================================================
// persistence handle
// ==============================================================================

pub const DEFAULT_QUEUE_DEPTH: usize = 256;

struct Enabled {
    backend: Arc<dyn TelemetryBackend>,
    queue: mpsc::Sender<Recorded>,
}

/// what the rest of the broker talks to; cheap to share behind an Arc
pub struct Persistence {
    enabled: Option<Enabled>,
    connected: Arc<AtomicBool>,
}

impl Persistence {
    pub fn disabled() -> Self {
        Self {
            enabled: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// start the writer task; must be called inside a tokio runtime
    pub fn spawn(backend: Arc<dyn TelemetryBackend>, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let connected = Arc::new(AtomicBool::new(true));
        tokio::spawn(writer(Arc::clone(&backend), rx, Arc::clone(&connected)));
        Self {
            enabled: Some(Enabled { backend, queue: tx }),
            connected,
        }
    }

    /// true while enabled and the last write went through
    pub fn is_connected(&self) -> bool {
        self.enabled.is_some() && self.connected.load(Ordering::Relaxed)
    }

    /// hand a record to the writer; never waits
    pub fn submit(&self, record: Recorded) {
        let Some(enabled) = &self.enabled else {
            return;
        };
        match enabled.queue.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!(sample = %record.sample.id, "persistence queue full, sample not persisted");
            }
            Err(TrySendError::Closed(record)) => {
                self.connected.store(false, Ordering::Relaxed);
                tracing::error!(sample = %record.sample.id, "persistence writer stopped, sample not persisted");
            }
        }
    }

    /// run a read against the backend on the blocking pool
    pub async fn query<T, F>(&self, read: F) -> Result<T, PersistError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TelemetryBackend) -> Result<T, PersistError> + Send + 'static,
    {
        let enabled = self.enabled.as_ref().ok_or(PersistError::Disabled)?;
        let backend = Arc::clone(&enabled.backend);
        tokio::task::spawn_blocking(move || read(backend.as_ref())).await?
    }
}

async fn writer(
    backend: Arc<dyn TelemetryBackend>,
    mut rx: mpsc::Receiver<Recorded>,
    connected: Arc<AtomicBool>,
) {
    while let Some(record) = rx.recv().await {
        let backend = Arc::clone(&backend);
        let id = record.sample.id;
        let outcome = tokio::task::spawn_blocking(move || backend.write(&record))
            .await
            .map_err(PersistError::from)
            .and_then(|written| written);
        match outcome {
            Ok(()) => {
                if !connected.swap(true, Ordering::Relaxed) {
                    tracing::info!("persistence backend reachable again");
                }
            }
            Err(e) => {
                connected.store(false, Ordering::Relaxed);
                tracing::error!(sample = %id, "failed to persist sample: {e}");
            }
        }
    }
    tracing::debug!("persistence writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ButtonStates, Reading, ThresholdConfig, NOTE_DEVICE};
    use crate::store::StateStore;

    async fn recorded(sensor1: f64, sensor2: f64) -> Recorded {
        let store = StateStore::new(10, ThresholdConfig::default());
        let reading = Reading {
            sensor1,
            sensor2,
            buttons: ButtonStates::new([1, 0, 0, 0, 0, 1]).unwrap(),
        };
        store.record_reading(&reading, NOTE_DEVICE).await
    }

    #[tokio::test]
    async fn write_fills_all_three_tables() {
        let db = SqliteBackend::in_memory().unwrap();
        let rec = recorded(12.0, 50.0).await;
        db.write(&rec).unwrap();

        let sensors = db.sensor_rows().unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].id, rec.sample.id.to_string());
        assert_eq!(sensors[0].status, "danger");

        let buttons = db.button_rows().unwrap();
        assert_eq!(buttons.len(), 6);
        let mut states: Vec<_> = buttons.iter().map(|b| (b.button_index, b.state)).collect();
        states.sort();
        assert_eq!(states, vec![(0, 1), (1, 0), (2, 0), (3, 0), (4, 0), (5, 1)]);

        let history = db.history_rows().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].alert_level, "high");
        assert_eq!(history[0].notes, NOTE_DEVICE);
    }

    #[tokio::test]
    async fn status_history_is_oldest_first_and_limited() {
        let db = SqliteBackend::in_memory().unwrap();
        let mut ids = Vec::new();
        for d in [10.0, 20.0, 30.0] {
            let rec = recorded(d, 100.0).await;
            ids.push(rec.sample.id.to_string());
            db.write(&rec).unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let rows = db.status_history(2).unwrap();
        let got: Vec<_> = rows.iter().map(|r| r.id.clone()).collect();
        assert_eq!(got, ids[1..]);
        assert_eq!(rows[1].status, "normal");
    }

    #[tokio::test]
    async fn duplicate_write_fails_without_partial_rows() {
        let db = SqliteBackend::in_memory().unwrap();
        let rec = recorded(40.0, 40.0).await;
        db.write(&rec).unwrap();
        assert!(db.write(&rec).is_err());
        assert_eq!(db.button_rows().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn chart_data_buckets_the_last_day_by_hour() {
        use chrono::{Duration, Timelike};

        let db = SqliteBackend::in_memory().unwrap();
        let now = Utc::now();
        let one_ago = now - Duration::hours(1);
        let two_ago = now - Duration::hours(2);
        // (when, sensor1, sensor2); the 30-hour-old row is outside the window
        let seeds = [
            (one_ago, 10.0, 100.0),
            (one_ago, 30.0, 100.0),
            (two_ago, 50.0, 60.0),
            (now - Duration::hours(30), 5.0, 5.0),
        ];
        for (when, sensor1, sensor2) in seeds {
            let mut rec = recorded(sensor1, sensor2).await;
            rec.sample.timestamp = when;
            db.write(&rec).unwrap();
        }

        let chart = db.chart_data(now - Duration::hours(24)).unwrap();
        assert_eq!(chart.labels.len(), CHART_HOURS);
        assert_eq!(chart.labels[0], "0:00");
        assert_eq!(chart.labels[23], "23:00");

        let h1 = one_ago.hour() as usize;
        let h2 = two_ago.hour() as usize;
        assert_eq!(chart.hourly_activity[h1], 2);
        assert_eq!(chart.hourly_activity[h2], 1);
        assert_eq!(chart.hourly_activity.iter().sum::<i64>(), 3);
        assert_eq!(chart.sensor1_data[h1], 20.0);
        assert_eq!(chart.sensor2_data[h1], 100.0);
        assert_eq!(chart.sensor1_data[h2], 50.0);
        // 10 cm is danger; 30 and 50 are normal under the default thresholds
        assert_eq!(chart.alert_counts, AlertCounts { low: 2, medium: 0, high: 1 });
    }

    #[tokio::test]
    async fn chart_data_on_an_empty_table_is_all_zero() {
        let db = SqliteBackend::in_memory().unwrap();
        let chart = db.chart_data(Utc::now() - chrono::Duration::hours(24)).unwrap();
        assert_eq!(chart, ChartData::empty());
    }

    struct Broken;

    impl TelemetryBackend for Broken {
        fn write(&self, _: &Recorded) -> Result<(), PersistError> {
            Err(PersistError::Sqlite(rusqlite::Error::InvalidQuery))
        }
        fn sensor_rows(&self) -> Result<Vec<SensorRow>, PersistError> {
            Ok(Vec::new())
        }
        fn button_rows(&self) -> Result<Vec<ButtonRow>, PersistError> {
            Ok(Vec::new())
        }
        fn history_rows(&self) -> Result<Vec<HistoryRow>, PersistError> {
            Ok(Vec::new())
        }
        fn status_history(&self, _: usize) -> Result<Vec<StatusRow>, PersistError> {
            Ok(Vec::new())
        }
        fn chart_data(&self, _: DateTime<Utc>) -> Result<ChartData, PersistError> {
            Ok(ChartData::empty())
        }
    }

    #[tokio::test]
    async fn failed_write_marks_backend_disconnected() {
        let persistence = Persistence::spawn(Arc::new(Broken), 4);
        assert!(persistence.is_connected());
        persistence.submit(recorded(50.0, 50.0).await);

        for _ in 0..100 {
            if !persistence.is_connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!persistence.is_connected());
    }

    #[tokio::test]
    async fn disabled_persistence_rejects_queries() {
        let persistence = Persistence::disabled();
        persistence.submit(recorded(50.0, 50.0).await);
        assert!(!persistence.is_connected());
        let err = persistence.query(|db| db.sensor_rows()).await.unwrap_err();
        assert!(matches!(err, PersistError::Disabled));
    }

    #[tokio::test]
    async fn queued_writes_land_in_sqlite() {
        let backend = Arc::new(SqliteBackend::in_memory().unwrap());
        let persistence = Persistence::spawn(backend.clone(), 8);
        for d in [11.0, 22.0, 33.0] {
            persistence.submit(recorded(d, 100.0).await);
        }
        for _ in 0..100 {
            if backend.sensor_rows().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let rows = persistence.query(|db| db.sensor_rows()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(persistence.is_connected());
    }
}
