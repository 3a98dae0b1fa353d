//! HSX executive daemon (hsxd)
//!
//! Hosts the bytecode executive and exposes the control plane:
//! - TCP line-delimited JSON requests/responses
//! - session registry with PID locks and keepalive
//! - ACK-driven event streaming with back-pressure
//!
//! Default bind: 127.0.0.1:9178

use anyhow::Result;
use hsx_runtime::hal::HalVtables;
use hsx_runtime::persist::JsonFileStore;
use hsx_runtime::profile::Profile;
use hsxd::tracing_layer::{self, EventLogLayer};
use hsxd::{server, Daemon};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let profile = std::env::var("HSXD_PROFILE")
        .ok()
        .and_then(|p| Profile::by_name(&p))
        .unwrap_or_default();
    let daemon = Daemon::new(profile);

    // Structured logs locally, plus an in-band mirror onto the event bus.
    let (layer, log_rx) = EventLogLayer::new();
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(layer)
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hsxd=debug")),
        )
        .init();
    tokio::spawn(tracing_layer::run_drain(Arc::clone(&daemon), log_rx));

    info!("Starting HSX executive daemon (hsxd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Ok(secs) = std::env::var("HSXD_RETENTION_S") {
        if let Ok(secs) = secs.parse::<i64>() {
            daemon.exec.lock().await.events.set_retention_ms(secs * 1000);
        }
    }
    if let Ok(path) = std::env::var("HSXD_PERSIST") {
        let store = JsonFileStore::open(path.into())?;
        daemon.exec.lock().await.set_persist(Box::new(store));
    }
    if let Ok(root) = std::env::var("HSXD_FS_ROOT") {
        daemon.exec.lock().await.hal = HalVtables::host(Some(root.into()));
    }

    let bind_addr = std::env::var("HSXD_BIND")
        .unwrap_or_else(|_| "127.0.0.1:9178".to_string())
        .parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("hsxd listening on {}", bind_addr);

    server::serve(daemon, listener).await
}
