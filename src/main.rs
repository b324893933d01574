//! ==============================================================================
//! main.rs - proximity broker entry point
//! ==============================================================================
//!
//! purpose:
//!     the backend between one ESP32 proximity rig and its dashboard.
//!
//! responsibilities:
//!     - load broker.toml (or defaults) and install logging
//!     - open the optional sqlite telemetry log
//!     - start the systemInfo broadcaster and, if configured, the simulator
//!     - serve the rest api (http port) and the device/observer sockets (ws port)
//!     - shut both listeners down on ctrl-c
//!
//! relationships:
//!     - uses: lib.rs (AppState, serve_http, serve_ws) and everything under it
//!     - reads: config/broker.toml (via config.rs)
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use proximity_broker::config::{BrokerConfig, SourceKind};
use proximity_broker::persist::{Persistence, SqliteBackend};
use proximity_broker::{broadcast, serve_http, serve_ws, simulate, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    let config = BrokerConfig::load_or_default();

    // step 2: logging. RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("proximity broker v{}", env!("CARGO_PKG_VERSION"));
    config.print_summary();

    // step 3: optional persistence. a backend that fails to open is logged and
    // the broker carries on in memory
    let persistence = if config.persistence.enabled {
        match SqliteBackend::open(&config.persistence.path) {
            Ok(backend) => {
                tracing::info!(path = %config.persistence.path.display(), "persistence ready");
                Persistence::spawn(Arc::new(backend), config.persistence.queue_depth)
            }
            Err(e) => {
                tracing::error!(path = %config.persistence.path.display(), "persistence unavailable: {e}");
                Persistence::disabled()
            }
        }
    } else {
        Persistence::disabled()
    };

    // step 4: shared state
    let state = AppState::new(&config, persistence);

    // step 5: background tasks
    tokio::spawn(broadcast::run_ticker(
        state.clone(),
        Duration::from_secs(config.broadcast.interval_seconds),
    ));
    if config.source.kind == SourceKind::Simulate {
        tokio::spawn(simulate::run(
            state.clone(),
            Duration::from_secs(config.source.interval_seconds),
        ));
    }

    // step 6: listeners
    let http_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let ws_addr = format!("{}:{}", config.server.host, config.server.ws_port);
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {http_addr}"))?;
    let ws_listener = TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("failed to bind websocket listener on {ws_addr}"))?;
    tracing::info!("rest api at http://{}", http_listener.local_addr()?);
    tracing::info!("device socket at ws://{}/ws/device", ws_listener.local_addr()?);
    tracing::info!("observer socket at ws://{}/ws", ws_listener.local_addr()?);

    // step 7: run until ctrl-c
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutting down"),
            Err(e) => {
                // no signal handler means no graceful stop; keep serving
                tracing::error!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        }
        let _ = stop_tx.send(true);
    });

    let (http, ws) = tokio::join!(
        serve_http(http_listener, state.clone(), stopped(stop_rx.clone())),
        serve_ws(ws_listener, state, stopped(stop_rx)),
    );
    http.context("http server failed")?;
    ws.context("websocket server failed")?;
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
