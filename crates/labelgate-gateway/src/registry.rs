// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The connection registry is the single source of truth for which devices exist
// and whether they are reachable right now.
//
// Entries live in a sharded `DashMap`, so `list()` can run alongside writes
// and every mutation of one device happens under that device's shard lock.
// A device entry survives its socket: on close it is only marked
// disconnected and handed a removal task by the supervisor, and a reconnect
// on a fresh socket reattaches to the same entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use labelgate_core::types::{
    ConnectionId, DeviceId, DeviceInfo, DeviceSummary, PLACEHOLDER_FRIENDLY_NAME, Registration,
};

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Handle to one live device socket.
///
/// Writes are queued to the socket's writer task; a send only fails once
/// that task has gone away.
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl DeviceConnection {
    /// Create a handle plus the receiver the socket writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                outbound,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `bytes` for the device.  Returns `false` if the socket writer
    /// has stopped.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.outbound.send(bytes).is_ok()
    }

    /// Whether the socket writer is still running.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Scheduled removal
// ---------------------------------------------------------------------------

/// A grace-period removal waiting to fire.
///
/// `generation` is unique per scheduled task; an expiring task only deletes
/// the entry if it is still the entry's current task.
#[derive(Debug)]
pub(crate) struct RemovalTask {
    generation: u64,
    handle: JoinHandle<()>,
}

impl RemovalTask {
    pub(crate) fn new(generation: u64, handle: JoinHandle<()>) -> Self {
        Self { generation, handle }
    }

    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

/// Mutable state for one device.
#[derive(Debug)]
pub(crate) struct DeviceEntry {
    /// Insertion order, for stable listing.
    seq: u64,
    friendly_name: String,
    /// Set once the first post-open message has been taken as the name.
    name_captured: bool,
    connection: DeviceConnection,
    /// `true` while the transport is live.  Relays waiting on a reconnect
    /// subscribe to this; dropping the entry wakes them with an error.
    connected: watch::Sender<bool>,
    pending_removal: Option<RemovalTask>,
}

impl DeviceEntry {
    fn new(seq: u64, connection: DeviceConnection) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            seq,
            friendly_name: PLACEHOLDER_FRIENDLY_NAME.to_owned(),
            name_captured: false,
            connection,
            connected,
            pending_removal: None,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Swap in a fresh socket.  Any pending removal is cancelled before the
    /// device is flipped back to connected.
    fn reattach(&mut self, connection: DeviceConnection) {
        self.cancel_removal();
        self.connection = connection;
        self.connected.send_replace(true);
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.connected.send_replace(false);
    }

    /// Install `task` as the only pending removal, cancelling any previous one.
    pub(crate) fn replace_removal(&mut self, task: RemovalTask) {
        if let Some(previous) = self.pending_removal.replace(task) {
            previous.cancel();
        }
    }

    fn cancel_removal(&mut self) {
        if let Some(task) = self.pending_removal.take() {
            task.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_generation(&self) -> Option<u64> {
        self.pending_removal.as_ref().map(|task| task.generation)
    }

    fn removal_due(&self, generation: u64) -> bool {
        !self.is_connected()
            && self
                .pending_removal
                .as_ref()
                .is_some_and(|task| task.generation == generation)
    }

    fn info(&self, id: &DeviceId) -> DeviceInfo {
        DeviceInfo {
            id: id.clone(),
            friendly_name: self.friendly_name.clone(),
            connected: self.is_connected(),
            pending_removal: self.pending_removal.is_some(),
            connection_id: self.connection.id(),
        }
    }
}

/// How a relay should reach a device.
#[derive(Debug)]
pub(crate) enum Route {
    /// Connected: write straight to this handle.
    Live(DeviceConnection),
    /// Disconnected: wait on this for the device to come back.
    Waiting(watch::Receiver<bool>),
}

// ---------------------------------------------------------------------------
// DeviceRegistry
// ---------------------------------------------------------------------------

struct RegistryInner {
    devices: DashMap<DeviceId, DeviceEntry>,
    next_seq: AtomicU64,
    next_generation: AtomicU64,
}

/// Shared device registry.  Cloning is cheap and every clone sees the same
/// devices.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.inner.devices.len())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                devices: DashMap::new(),
                next_seq: AtomicU64::new(0),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Attach `connection` to device `id`, creating the entry if needed.
    ///
    /// An existing entry keeps its friendly name; its pending removal (if
    /// any) is cancelled and it becomes connected on the new socket.
    pub fn register(&self, id: DeviceId, connection: DeviceConnection) -> Registration {
        match self.inner.devices.entry(id) {
            Entry::Occupied(mut occupied) => {
                let device_id = occupied.key().clone();
                let entry = occupied.get_mut();
                if entry.is_connected() && entry.connection.is_open() {
                    warn!(
                        device_id = %device_id,
                        previous = %entry.connection.id(),
                        "device opened a second raw channel; replacing live connection"
                    );
                }
                entry.reattach(connection);
                info!(device_id = %device_id, "device reconnected");
                Registration::Reconnected
            }
            Entry::Vacant(vacant) => {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                info!(device_id = %vacant.key(), "device registered");
                vacant.insert(DeviceEntry::new(seq, connection));
                Registration::New
            }
        }
    }

    /// Flag device `id` as disconnected.  No-op for unknown ids.
    pub fn mark_disconnected(&self, id: &DeviceId) {
        self.with_entry(id, |entry| entry.mark_disconnected());
    }

    /// Forget device `id`, cancelling any pending removal.  No-op if it is
    /// already gone.
    pub fn remove(&self, id: &DeviceId) {
        if let Some((_, mut entry)) = self.inner.devices.remove(id) {
            entry.cancel_removal();
            info!(device_id = %id, "device removed");
        }
    }

    /// Snapshot of every known device, connected or in its grace period, in
    /// registration order.
    pub fn list(&self) -> Vec<DeviceSummary> {
        let mut devices: Vec<(u64, DeviceSummary)> = self
            .inner
            .devices
            .iter()
            .map(|item| {
                (
                    item.value().seq,
                    DeviceSummary {
                        id: item.key().clone(),
                        friendly_name: item.value().friendly_name.clone(),
                    },
                )
            })
            .collect();
        devices.sort_by_key(|(seq, _)| *seq);
        devices.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Snapshot of device `id`, if known.
    pub fn lookup(&self, id: &DeviceId) -> Option<DeviceInfo> {
        self.inner.devices.get(id).map(|entry| entry.info(id))
    }

    /// Record `name` as the device's friendly name unless one was already
    /// captured.  Returns whether the name was applied.
    pub fn capture_friendly_name(&self, id: &DeviceId, name: String) -> bool {
        self.with_entry(id, |entry| {
            if entry.name_captured {
                return false;
            }
            debug!(device_id = %id, name = %name, "friendly name captured");
            entry.friendly_name = name;
            entry.name_captured = true;
            true
        })
        .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.devices.is_empty()
    }

    /// Run `f` on the entry for `id` under its shard lock.
    ///
    /// `f` must not call back into the registry.
    pub(crate) fn with_entry<R>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&mut DeviceEntry) -> R,
    ) -> Option<R> {
        self.inner
            .devices
            .get_mut(id)
            .map(|mut entry| f(entry.value_mut()))
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Delete `id` if removal task `generation` is still the one scheduled
    /// for it and the device has not come back.
    pub(crate) fn expire(&self, id: &DeviceId, generation: u64) -> bool {
        let expired = self
            .inner
            .devices
            .remove_if(id, |_, entry| entry.removal_due(generation))
            .is_some();
        if expired {
            info!(device_id = %id, "grace period elapsed; device removed");
        } else {
            debug!(device_id = %id, generation, "stale removal task ignored");
        }
        expired
    }

    pub(crate) fn route(&self, id: &DeviceId) -> Option<Route> {
        self.inner.devices.get(id).map(|entry| {
            if entry.is_connected() {
                Route::Live(entry.connection.clone())
            } else {
                Route::Waiting(entry.connected.subscribe())
            }
        })
    }

    /// The connection for `id`, only if it is currently connected.
    pub(crate) fn live_connection(&self, id: &DeviceId) -> Option<DeviceConnection> {
        self.inner
            .devices
            .get(id)
            .filter(|entry| entry.is_connected())
            .map(|entry| entry.connection.clone())
    }
}
