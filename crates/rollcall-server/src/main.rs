//! # rollcall-server
//!
//! HTTP server for rollcall, automatic event attendance.
//!
//! This binary provides:
//! - REST API for monitoring, attendance status and history
//! - Simulated device endpoints (position, permissions, region crossings)
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package rollcall-server
//!
//! # Explicit config file
//! ROLLCALL_CONFIG=/etc/rollcall/config.toml ./rollcall-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use rollcall_core::Config;
use rollcall_server::api::create_router;
use rollcall_server::logging::{self, LogMode};
use rollcall_server::state::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os("ROLLCALL_CONFIG").map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref()).context("loading configuration")?;

    logging::init(LogMode::from_production_flag(config.server.production))?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting rollcall-server");

    config.engine.session_path = config.session_path();
    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("invalid server.bind_address {:?}", config.server.bind_address))?;

    let state = AppState::from_config(config)?.shared();

    match state.engine.resume_session().await {
        Ok(Some(reconciliation)) => info!(
            inside = reconciliation.inside.len(),
            corrections = reconciliation.enqueued.len(),
            "Previous monitoring session resumed"
        ),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "Could not resume previous monitoring session"),
    }

    let app = create_router(state.clone());
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        pending = state.engine.pending_writes(),
        "Draining queued check-in writes"
    );
    state.engine.wait_idle().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
