// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The TLS WebSocket endpoint printers connect out to.
//
// Each accepted TCP connection goes through a TLS handshake, then a
// WebSocket upgrade, and is then served by two tasks: a writer draining the
// socket's outbound queue and a reader feeding every frame to the socket's
// `Handshake`.  When the reader ends the writer completes the close
// handshake, and the handshake is told the socket closed, which starts the
// device's grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use labelgate_core::error::{GatewayError, Result};
use labelgate_core::types::ServerStatus;

use crate::handshake::Handshake;
use crate::registry::{DeviceConnection, DeviceRegistry};
use crate::supervisor::ReconnectionSupervisor;

/// Default port for the device listener.
const DEFAULT_PORT: u16 = 3001;

/// Upper bound on the TLS handshake plus WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer gets to send the closing frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared across all connection-handling tasks.
struct SharedState {
    acceptor: TlsAcceptor,
    registry: DeviceRegistry,
    supervisor: ReconnectionSupervisor,
    active_connections: Arc<AtomicU32>,
}

/// TLS WebSocket server for printer connections.
pub struct DeviceListener {
    /// The TCP port to listen on.
    port: u16,
    /// Current lifecycle state.
    status: ServerStatus,
    /// Notification handle used to signal a graceful shutdown.
    shutdown_signal: Arc<Notify>,
    /// Handle to the task running the accept loop.
    task_handle: Option<JoinHandle<()>>,
    /// Counter of currently open device sockets.
    active_connections: Arc<AtomicU32>,
    /// Address actually bound (differs from `port` when `port` is 0).
    local_addr: Option<SocketAddr>,
}

impl DeviceListener {
    /// Create a listener for `port` (default 3001) in `Stopped` state.
    pub fn new(port: Option<u16>) -> Self {
        Self {
            port: port.unwrap_or(DEFAULT_PORT),
            status: ServerStatus::Stopped,
            shutdown_signal: Arc::new(Notify::new()),
            task_handle: None,
            active_connections: Arc::new(AtomicU32::new(0)),
            local_addr: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind `0.0.0.0:{port}` and start accepting devices.
    ///
    /// # Errors
    ///
    /// `GatewayError::Server` if the port cannot be bound.
    pub async fn start(
        &mut self,
        tls: Arc<rustls::ServerConfig>,
        registry: DeviceRegistry,
        supervisor: ReconnectionSupervisor,
    ) -> Result<SocketAddr> {
        if let (ServerStatus::Running, Some(addr)) = (self.status, self.local_addr) {
            debug!(%addr, "device listener already running");
            return Ok(addr);
        }

        self.status = ServerStatus::Starting;

        let bind_addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.status = ServerStatus::Stopped;
                return Err(GatewayError::Server(format!("bind {bind_addr}: {e}")));
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Server(format!("local address: {e}")))?;

        info!(addr = %local_addr, "device listener accepting secure WebSocket connections");

        let shared = Arc::new(SharedState {
            acceptor: TlsAcceptor::from(tls),
            registry,
            supervisor,
            active_connections: Arc::clone(&self.active_connections),
        });
        let shutdown = Arc::clone(&self.shutdown_signal);

        self.task_handle = Some(tokio::spawn(async move {
            Self::accept_loop(listener, shutdown, shared).await;
        }));
        self.local_addr = Some(local_addr);
        self.status = ServerStatus::Running;
        Ok(local_addr)
    }

    /// Stop accepting devices.  Sockets already open keep being served.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }

        info!(port = self.port, "stopping device listener");
        self.shutdown_signal.notify_one();

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| GatewayError::Server(format!("task join: {e}")))?;
        }

        self.status = ServerStatus::Stopped;
        self.local_addr = None;
        info!(port = self.port, "device listener stopped");
        Ok(())
    }

    async fn accept_loop(listener: TcpListener, shutdown: Arc<Notify>, shared: Arc<SharedState>) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!(%peer, "incoming device connection");
                            let state = Arc::clone(&shared);
                            tokio::spawn(async move {
                                state.active_connections.fetch_add(1, Ordering::Relaxed);
                                if let Err(e) = Self::handle_connection(stream, peer, &state).await {
                                    warn!(%peer, error = %e, "device connection error");
                                }
                                state.active_connections.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    /// TLS, WebSocket upgrade, then serve until the socket closes.
    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        state: &SharedState,
    ) -> Result<()> {
        let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, state.acceptor.accept(stream))
            .await
            .map_err(|_| GatewayError::DeviceSocket(format!("TLS handshake with {peer} timed out")))?
            .map_err(|e| GatewayError::DeviceSocket(format!("TLS handshake with {peer}: {e}")))?;

        let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(tls))
            .await
            .map_err(|_| GatewayError::DeviceSocket(format!("WebSocket upgrade from {peer} timed out")))?
            .map_err(|e| GatewayError::DeviceSocket(format!("WebSocket upgrade from {peer}: {e}")))?;

        info!(%peer, "device socket open");
        serve_device(ws, peer, state.registry.clone(), state.supervisor.clone()).await;
        Ok(())
    }
}

/// Serve one upgraded device socket until it closes.
///
/// Transport-agnostic so it can run over TLS in production and over an
/// in-memory pipe in tests.
pub async fn serve_device<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    registry: DeviceRegistry,
    supervisor: ReconnectionSupervisor,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (connection, mut outbound) = DeviceConnection::channel();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (finish_tx, mut finish_rx) = oneshot::channel::<()>();

    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                next = outbound.recv() => {
                    let Some(bytes) = next else { break };
                    if let Err(e) = ws_tx.send(Message::Binary(bytes)).await {
                        warn!(%peer, error = %e, "device write failed");
                        return;
                    }
                }
                _ = &mut finish_rx => break,
            }
        }
        // Completes the close handshake: answers a device's close frame, or
        // starts one when the gateway stopped reading first.
        if let Err(e) = ws_tx.close().await {
            debug!(%peer, error = %e, "close frame not sent");
        }
    });

    let mut handshake = Handshake::new(registry, connection);

    while let Some(frame) = ws_rx.next().await {
        let result = match frame {
            Ok(Message::Text(text)) => handshake.on_message(text.as_bytes()),
            Ok(Message::Binary(data)) => handshake.on_message(&data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%peer, error = %e, "device socket read ended");
                break;
            }
        };

        match result {
            Ok(()) => {}
            Err(GatewayError::MalformedHandshakeMessage(reason)) => {
                warn!(%peer, %reason, "malformed handshake message discarded");
            }
            Err(e) => {
                warn!(%peer, error = %e, "device socket unusable");
                break;
            }
        }
    }

    let _ = finish_tx.send(());
    if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(%peer, device_id = ?handshake.device_id(), "device socket closed");
    handshake.on_close(&supervisor);
}
