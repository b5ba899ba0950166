use std::time::Duration;

use anyhow::Result;
use rollcall_core::CycleEvent;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::from_env();
    let engine = engine::spawn_engine(&config)?;

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine.clone()))?
        .build()
        .await?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, system = config.system_bus, "D-Bus service registered");

    tokio::spawn(forward_events(conn.clone(), engine.subscribe()));
    tokio::spawn(engine::run_ticker(
        engine.clone(),
        Duration::from_millis(config.scan_interval_ms),
    ));

    if config.autostart {
        if let Err(e) = engine.start_scanning().await {
            tracing::error!(error = %e, "autostart failed");
        }
    }

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    if let Err(e) = engine.stop_scanning().await {
        tracing::warn!(error = %e, "stop on shutdown failed");
    }

    Ok(())
}

/// Re-emit engine cycle events as `ScanEvent` D-Bus signals.
async fn forward_events(conn: zbus::Connection, mut events: broadcast::Receiver<CycleEvent>) {
    let iface = match conn
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(e) => {
            tracing::error!(error = %e, "event forwarder: interface lookup failed");
            return;
        }
    };

    loop {
        match events.recv().await {
            Ok(event) => {
                let payload = match event.to_json() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(error = %e, "event serialization failed");
                        continue;
                    }
                };
                if let Err(e) = AttendanceService::scan_event(iface.signal_emitter(), &payload).await {
                    tracing::warn!(error = %e, "ScanEvent emit failed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
