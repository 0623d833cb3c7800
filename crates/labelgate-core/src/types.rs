// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Labelgate printer gateway.

use serde::Serialize;
use uuid::Uuid;

/// Name of the raw command channel a device opens after discovery.
pub const RAW_CHANNEL_NAME: &str = "v1.raw.zebra.com";

/// Friendly name shown until the device answers the name query.
pub const PLACEHOLDER_FRIENDLY_NAME: &str = "fetching from printer...";

/// Printer-language query asking the device for its display name.
pub const FRIENDLY_NAME_QUERY: &[u8] = b"! U1 getvar \"device.friendly_name\" \r\n";

/// Channel identifier a device supplies as `unique_id` when it opens the raw
/// channel.  Opaque to the gateway; used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Identifies one accepted device socket.
///
/// A device that reconnects gets a fresh socket and therefore a fresh
/// `ConnectionId`; the registry uses it to ignore close events from sockets
/// that have already been superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public view of a known device, as returned by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub friendly_name: String,
}

/// Full snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub friendly_name: String,
    /// Whether the transport is live right now.
    pub connected: bool,
    /// Whether a grace-period removal is scheduled.
    pub pending_removal: bool,
    /// The socket currently attached to the device.
    pub connection_id: ConnectionId,
}

/// Result of relaying a command to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Bytes were handed to the live transport.
    Delivered,
    /// No device with that id is known.
    NotFound,
    /// The device was disconnected and did not come back within the grace
    /// period.
    Unreachable,
}

/// How a raw-channel registration was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this id has been seen.
    New,
    /// The id was already known (connected or in its grace period).
    Reconnected,
}

/// Status of the device listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
}
