// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labelgate Gateway — device registry, handshake state machine, reconnection
// supervisor, command relay, and the TLS WebSocket listener printers connect
// to.  The control surface in `labelgate-app` only ever calls
// `DeviceRegistry::list` and `CommandRelay::send_command`.

pub mod handshake;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod supervisor;

pub use handshake::{Handshake, HandshakeState};
pub use listener::{DeviceListener, serve_device};
pub use registry::{DeviceConnection, DeviceRegistry};
pub use relay::CommandRelay;
pub use supervisor::ReconnectionSupervisor;
