// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command relay. Delivers raw printer-language bytes to a device, riding
// out a disconnect that is still inside its grace period.
//
// Delivery is fire-and-forget: bytes are handed to the socket writer and the
// printer's reply (if any) is not awaited.  Nothing is queued for a device
// beyond the single in-flight wait of one call.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use labelgate_core::error::{GatewayError, Result};
use labelgate_core::types::{DeviceId, SendOutcome};

use crate::registry::{DeviceConnection, DeviceRegistry, Route};

/// Caller-facing command delivery.
#[derive(Debug, Clone)]
pub struct CommandRelay {
    registry: DeviceRegistry,
    grace: Duration,
}

impl CommandRelay {
    pub fn new(registry: DeviceRegistry, grace: Duration) -> Self {
        Self { registry, grace }
    }

    /// Send `command` to device `id`.
    ///
    /// - unknown id: `NotFound`, immediately;
    /// - connected: written at once, `Delivered`;
    /// - disconnected: waits up to the grace period for the device to come
    ///   back, then `Delivered`, or `Unreachable` if it never does.
    ///
    /// # Errors
    ///
    /// `GatewayError::TransportWrite` if the socket writer stopped between
    /// the lookup and the write.  Not retried.
    pub async fn send_command(&self, id: &DeviceId, command: Vec<u8>) -> Result<SendOutcome> {
        let waiter = match self.registry.route(id) {
            None => {
                debug!(device_id = %id, "relay to unknown device");
                return Ok(SendOutcome::NotFound);
            }
            Some(Route::Live(connection)) => return deliver(id, &connection, command),
            Some(Route::Waiting(waiter)) => waiter,
        };

        info!(
            device_id = %id,
            wait_ms = self.grace.as_millis() as u64,
            "device disconnected; waiting for reconnect"
        );

        if !self.wait_for_reconnect(waiter).await {
            warn!(device_id = %id, "device did not reconnect in time");
            return Ok(SendOutcome::Unreachable);
        }

        // The device may have dropped again between the wake-up and now.
        match self.registry.live_connection(id) {
            Some(connection) => deliver(id, &connection, command),
            None => Ok(SendOutcome::Unreachable),
        }
    }

    /// Wait until `connected` turns true, the entry is dropped, or the grace
    /// period runs out.  The timer goes away with the future either way.
    async fn wait_for_reconnect(&self, mut connected: watch::Receiver<bool>) -> bool {
        let reconnected = async move { connected.wait_for(|up| *up).await.is_ok() };
        tokio::time::timeout(self.grace, reconnected)
            .await
            .unwrap_or(false)
    }
}

fn deliver(id: &DeviceId, connection: &DeviceConnection, command: Vec<u8>) -> Result<SendOutcome> {
    let bytes = command.len();
    if !connection.send(command) {
        return Err(GatewayError::TransportWrite(id.clone()));
    }
    debug!(device_id = %id, bytes, "command relayed");
    Ok(SendOutcome::Delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ReconnectionSupervisor;
    use tokio::time::Instant;

    const GRACE: Duration = Duration::from_secs(5);
    const LABEL: &[u8] = b"^XA^FO50,50^A0N,40,40^FDHello^FS^XZ";

    struct Fixture {
        registry: DeviceRegistry,
        supervisor: ReconnectionSupervisor,
        relay: CommandRelay,
    }

    fn fixture() -> Fixture {
        let registry = DeviceRegistry::new();
        Fixture {
            supervisor: ReconnectionSupervisor::new(registry.clone(), GRACE),
            relay: CommandRelay::new(registry.clone(), GRACE),
            registry,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_is_not_found_without_waiting() {
        let f = fixture();
        let started = Instant::now();

        let outcome = f
            .relay
            .send_command(&DeviceId::new("ghost"), LABEL.to_vec())
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::NotFound);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_device_receives_command_immediately() {
        let f = fixture();
        let id = DeviceId::new("zt410");
        let (conn, mut rx) = DeviceConnection::channel();
        f.registry.register(id.clone(), conn);
        let started = Instant::now();

        let outcome = f.relay.send_command(&id, LABEL.to_vec()).await.unwrap();

        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(rx.try_recv().unwrap(), LABEL);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_through_reconnect_and_delivers_once() {
        let f = fixture();
        let id = DeviceId::new("zt410");
        let (conn, _old_rx) = DeviceConnection::channel();
        let conn_id = conn.id();
        f.registry.register(id.clone(), conn);
        f.supervisor.connection_closed(&id, conn_id);

        let relay = f.relay.clone();
        let target = id.clone();
        let pending = tokio::spawn(async move { relay.send_command(&target, LABEL.to_vec()).await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!pending.is_finished());

        let (conn, mut rx) = DeviceConnection::channel();
        f.registry.register(id.clone(), conn);

        assert_eq!(pending.await.unwrap().unwrap(), SendOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap(), LABEL);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_grace_and_device_is_purged() {
        let f = fixture();
        let id = DeviceId::new("zt410");
        let (conn, _rx) = DeviceConnection::channel();
        let conn_id = conn.id();
        f.registry.register(id.clone(), conn);
        f.supervisor.connection_closed(&id, conn_id);
        let started = Instant::now();

        let outcome = f.relay.send_command(&id, LABEL.to_vec()).await.unwrap();

        assert_eq!(outcome, SendOutcome::Unreachable);
        assert!(started.elapsed() <= GRACE);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(f.registry.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_started_late_in_grace_ends_when_device_is_purged() {
        let f = fixture();
        let id = DeviceId::new("zt410");
        let (conn, _rx) = DeviceConnection::channel();
        let conn_id = conn.id();
        f.registry.register(id.clone(), conn);
        f.supervisor.connection_closed(&id, conn_id);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let started = Instant::now();
        let outcome = f.relay.send_command(&id, LABEL.to_vec()).await.unwrap();

        // The removal at t=5 wakes the relay; it does not sit out its own
        // full five seconds.
        assert_eq!(outcome, SendOutcome::Unreachable);
        assert!(started.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_writer_is_a_transport_failure() {
        let f = fixture();
        let id = DeviceId::new("zt410");
        let (conn, rx) = DeviceConnection::channel();
        f.registry.register(id.clone(), conn);
        drop(rx);

        let err = f.relay.send_command(&id, LABEL.to_vec()).await.unwrap_err();
        assert!(matches!(err, GatewayError::TransportWrite(ref failed) if *failed == id));
    }
}
