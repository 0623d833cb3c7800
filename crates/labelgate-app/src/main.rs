// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labelgate — cloud-connect gateway for label printers
//
// Entry point. Initialises logging, loads configuration and the TLS identity,
// then runs the device listener and the HTTP control surface until Ctrl-C.

mod api;

use std::net::SocketAddr;

use tokio::net::TcpListener;

use labelgate_core::config::GatewayConfig;
use labelgate_core::error::{GatewayError, Result};
use labelgate_gateway::{CommandRelay, DeviceListener, DeviceRegistry, ReconnectionSupervisor};
use labelgate_security::TlsIdentity;

use api::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Labelgate starting");

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Labelgate failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = GatewayConfig::load()?;
    let (cert_path, key_path) = config.tls_paths()?;
    let identity = TlsIdentity::load(cert_path, key_path)?;
    let tls = identity.server_config()?;

    let grace = config.grace_period();
    tracing::info!(
        api_port = config.api_port,
        websocket_port = config.websocket_port,
        grace_ms = config.printer_timeout,
        "configuration loaded"
    );

    // One registry for the whole process, shared by both surfaces.
    let registry = DeviceRegistry::new();
    let supervisor = ReconnectionSupervisor::new(registry.clone(), grace);
    let relay = CommandRelay::new(registry.clone(), grace);

    let mut devices = DeviceListener::new(Some(config.websocket_port));
    devices.start(tls, registry.clone(), supervisor).await?;

    let api_addr: SocketAddr = ([0, 0, 0, 0], config.api_port).into();
    let api_listener = TcpListener::bind(api_addr)
        .await
        .map_err(|e| GatewayError::Server(format!("bind {api_addr}: {e}")))?;
    tracing::info!(addr = %api_addr, "control surface listening");

    let app = api::create_routes(AppState { registry, relay });
    axum::serve(api_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Server(format!("control surface: {e}")))?;

    devices.stop().await?;
    tracing::info!("Labelgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
