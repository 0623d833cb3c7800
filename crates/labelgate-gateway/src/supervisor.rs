// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reconnection supervisor: keeps a dropped device's identity and name alive
// for a grace period so it can come back on a new socket.
//
// When a device socket closes the entry is marked disconnected and a removal
// task is spawned under the same shard lock.  A reconnect cancels the task
// before flipping the entry back to connected; if the abort loses the race,
// the task re-checks under the lock and leaves a live device alone.

use std::time::Duration;

use tracing::{debug, info};

use labelgate_core::types::{ConnectionId, DeviceId};

use crate::registry::{DeviceRegistry, RemovalTask};

/// Schedules and cancels grace-period removals.
#[derive(Debug, Clone)]
pub struct ReconnectionSupervisor {
    registry: DeviceRegistry,
    grace: Duration,
}

impl ReconnectionSupervisor {
    pub fn new(registry: DeviceRegistry, grace: Duration) -> Self {
        Self { registry, grace }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Handle the close of socket `connection_id` for device `id`.
    ///
    /// Ignored if the device is unknown, already disconnected, or has since
    /// reconnected on a different socket.  Returns whether a removal was
    /// scheduled.
    pub fn connection_closed(&self, id: &DeviceId, connection_id: ConnectionId) -> bool {
        let registry = self.registry.clone();
        let grace = self.grace;

        let scheduled = self
            .registry
            .with_entry(id, |entry| {
                if entry.connection_id() != connection_id {
                    debug!(
                        device_id = %id,
                        connection = %connection_id,
                        "close from superseded socket ignored"
                    );
                    return false;
                }
                if !entry.is_connected() {
                    return false;
                }
                entry.mark_disconnected();
                entry.replace_removal(spawn_removal(registry, id.clone(), grace));
                true
            })
            .unwrap_or(false);

        if scheduled {
            info!(
                device_id = %id,
                grace_ms = grace.as_millis() as u64,
                "raw channel closed; removal scheduled"
            );
        }
        scheduled
    }
}

/// Spawn the task that deletes `id` once `grace` has passed.
///
/// Called with the entry's shard lock held; the task only touches the
/// registry after its sleep, so it simply waits for the lock if it has to.
fn spawn_removal(registry: DeviceRegistry, id: DeviceId, grace: Duration) -> RemovalTask {
    let generation = registry.next_generation();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        registry.expire(&id, generation);
    });
    RemovalTask::new(generation, handle)
}
