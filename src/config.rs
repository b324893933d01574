//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `broker.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: bind address and the http / websocket ports.
//!     - ThresholdConfig: initial danger / warning distances (cm).
//!     - HistoryConfig: capacity of the in-memory ring.
//!     - BroadcastConfig: how often observers get the system digest.
//!     - SourceConfig: real device link or the synthetic generator.
//!     - PersistenceConfig: optional sqlite telemetry log.
//!     - LoggingConfig: default tracing filter.
//!
//! every section is optional; a missing key takes its default.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::domain::ThresholdConfig;
use crate::persist::DEFAULT_QUEUE_DEPTH;
use crate::store::DEFAULT_HISTORY_CAPACITY;

/// environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "BROKER_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub thresholds: ThresholdConfig,
    pub history: HistoryConfig,
    pub broadcast: BroadcastConfig,
    pub source: SourceConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BroadcastConfig {
    pub interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// telemetry arrives over the device websocket
    #[default]
    Device,
    /// a local generator stands in for the device
    Simulate,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// log every accepted frame at info instead of debug
    pub show_frames: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3001,
            ws_port: 3002,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_HISTORY_CAPACITY }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { interval_seconds: 5 }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { kind: SourceKind::Device, interval_seconds: 5 }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("telemetry.db"),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_frames: false }
    }
}

impl BrokerConfig {
    /// Parse and validate a config document
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: BrokerConfig = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load with default fallback
    ///
    /// runs before tracing is installed (the filter comes from this file),
    /// so problems are reported on stderr.
    pub fn load_or_default() -> Self {
        let paths = match std::env::var_os(CONFIG_ENV) {
            Some(explicit) => vec![PathBuf::from(explicit)],
            None => vec![
                PathBuf::from("config").join("broker.toml"),
                PathBuf::from("..").join("config").join("broker.toml"),
            ],
        };

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        eprintln!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        eprintln!("[CONFIG] Warning: failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        eprintln!("[CONFIG] Warning: no config file found - using defaults");
        Self::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.thresholds
            .validate()
            .context("invalid [thresholds] section")?;
        anyhow::ensure!(self.history.capacity > 0, "history.capacity must be at least 1");
        anyhow::ensure!(
            self.broadcast.interval_seconds > 0,
            "broadcast.interval_seconds must be at least 1"
        );
        anyhow::ensure!(
            self.source.interval_seconds > 0,
            "source.interval_seconds must be at least 1"
        );
        anyhow::ensure!(
            self.server.http_port == 0 || self.server.http_port != self.server.ws_port,
            "http_port and ws_port must differ"
        );
        Ok(())
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!(
            host = %self.server.host,
            http_port = self.server.http_port,
            ws_port = self.server.ws_port,
            "server"
        );
        tracing::info!(
            danger = self.thresholds.danger,
            warning = self.thresholds.warning,
            history = self.history.capacity,
            broadcast_secs = self.broadcast.interval_seconds,
            "telemetry"
        );
        tracing::info!(
            source = ?self.source.kind,
            persistence = self.persistence.enabled,
            db = %self.persistence.path.display(),
            log_level = %self.logging.level,
            "runtime"
        );
    }
}
