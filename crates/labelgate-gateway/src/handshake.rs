// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device handshake: drives one socket from "unknown" to a registered raw
// command channel.
//
// # Message flow
//
// ```text
//   device                                   gateway
//     | { "discovery_b64": "..." }             |
//     |--------------------------------------->|  DiscoveryReplied
//     |          { "open": "v1.raw.zebra.com" }|
//     |<---------------------------------------|
//
//   (device opens a second socket)
//     | { "channel_name": "v1.raw.zebra.com",  |
//     |   "unique_id": "XXRBJ..." }            |
//     |--------------------------------------->|  register
//     |  ! U1 getvar "device.friendly_name"    |  (new devices only)
//     |<---------------------------------------|  RawChannelOpened
//     | "Shipping Desk"                        |
//     |--------------------------------------->|  Ready
// ```
//
// # Malformed input
//
// The policy is permissive: a first message that is not JSON is logged and
// dropped, and the socket stays open waiting for a usable one.  The gateway
// never closes a socket because of what a device said.

use serde_json::Value;
use tracing::{debug, info, warn};

use labelgate_core::error::{GatewayError, Result};
use labelgate_core::types::{DeviceId, FRIENDLY_NAME_QUERY, RAW_CHANNEL_NAME, Registration};

use crate::registry::{DeviceConnection, DeviceRegistry};
use crate::supervisor::ReconnectionSupervisor;

// ---------------------------------------------------------------------------
// First-message classification
// ---------------------------------------------------------------------------

/// What a device's first message asks for.
///
/// A message may carry both a discovery request and a raw channel
/// declaration; each is acted on.  Neither means the message is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstMessage {
    /// `discovery_b64` present with a truthy value.
    pub discovery: bool,
    /// Raw channel declared with this device id.
    pub raw_channel: Option<DeviceId>,
}

impl FirstMessage {
    pub fn is_ignored(&self) -> bool {
        !self.discovery && self.raw_channel.is_none()
    }
}

/// Classify a first message.
///
/// # Errors
///
/// `GatewayError::MalformedHandshakeMessage` if `payload` is not JSON.
pub fn parse_first_message(payload: &[u8]) -> Result<FirstMessage> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::MalformedHandshakeMessage(e.to_string()))?;

    let discovery = value.get("discovery_b64").is_some_and(is_truthy);

    let raw_channel = if value.get("channel_name").and_then(Value::as_str) == Some(RAW_CHANNEL_NAME)
    {
        match value.get("unique_id").and_then(Value::as_str) {
            Some(unique_id) if !unique_id.is_empty() => Some(DeviceId::new(unique_id)),
            _ => {
                warn!("raw channel opened without a unique_id; ignoring");
                None
            }
        }
    } else {
        None
    };

    Ok(FirstMessage {
        discovery,
        raw_channel,
    })
}

/// Devices send `discovery_b64` as a base64 string, but any non-empty,
/// non-zero, non-false value counts.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Directive telling a discovered device to open the raw channel.
pub fn open_raw_channel_directive() -> Vec<u8> {
    serde_json::json!({ "open": RAW_CHANNEL_NAME })
        .to_string()
        .into_bytes()
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Handshake progress for one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing usable received yet.
    AwaitingFirstMessage,
    /// Discovery answered; this socket has no further role.
    DiscoveryReplied,
    /// New device registered; the next message is its friendly name.
    RawChannelOpened { device_id: DeviceId },
    /// Registered; further messages are printer output.
    Ready { device_id: DeviceId },
}

/// Per-socket handshake driver.
///
/// Fed every inbound frame in arrival order by the socket's read loop, and
/// told once when the socket closes.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    connection: DeviceConnection,
    registry: DeviceRegistry,
}

impl Handshake {
    pub fn new(registry: DeviceRegistry, connection: DeviceConnection) -> Self {
        Self {
            state: HandshakeState::AwaitingFirstMessage,
            connection,
            registry,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// The device this socket belongs to, once the raw channel is open.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match &self.state {
            HandshakeState::RawChannelOpened { device_id } | HandshakeState::Ready { device_id } => {
                Some(device_id)
            }
            _ => None,
        }
    }

    /// Process one inbound frame.
    ///
    /// # Errors
    ///
    /// - `MalformedHandshakeMessage`: the frame was dropped; keep reading.
    /// - `DeviceSocket`: a reply could not be queued; the socket is gone.
    pub fn on_message(&mut self, payload: &[u8]) -> Result<()> {
        match &self.state {
            HandshakeState::AwaitingFirstMessage => self.on_first_message(payload),
            HandshakeState::DiscoveryReplied => {
                debug!(bytes = payload.len(), "message on discovery socket ignored");
                Ok(())
            }
            HandshakeState::RawChannelOpened { device_id } => {
                let device_id = device_id.clone();
                let name = String::from_utf8_lossy(payload).into_owned();
                self.registry.capture_friendly_name(&device_id, name);
                self.state = HandshakeState::Ready { device_id };
                Ok(())
            }
            HandshakeState::Ready { device_id } => {
                debug!(device_id = %device_id, bytes = payload.len(), "printer output");
                Ok(())
            }
        }
    }

    fn on_first_message(&mut self, payload: &[u8]) -> Result<()> {
        let first = parse_first_message(payload)?;
        if first.is_ignored() {
            debug!("first message of unknown shape ignored");
            return Ok(());
        }

        if first.discovery {
            self.reply(open_raw_channel_directive())?;
            debug!(connection = %self.connection.id(), "discovery answered");
            self.state = HandshakeState::DiscoveryReplied;
        }

        if let Some(unique_id) = first.raw_channel {
            self.open_raw_channel(unique_id)?;
        }
        Ok(())
    }

    fn open_raw_channel(&mut self, unique_id: DeviceId) -> Result<()> {
        info!(device_id = %unique_id, "raw channel opened");
        let registration = self
            .registry
            .register(unique_id.clone(), self.connection.clone());
        // State first: if the query cannot be written, close must still find
        // the device.
        match registration {
            Registration::New => {
                self.state = HandshakeState::RawChannelOpened {
                    device_id: unique_id,
                };
                self.reply(FRIENDLY_NAME_QUERY.to_vec())
            }
            Registration::Reconnected => {
                self.state = HandshakeState::Ready {
                    device_id: unique_id,
                };
                Ok(())
            }
        }
    }

    fn reply(&self, bytes: Vec<u8>) -> Result<()> {
        if self.connection.send(bytes) {
            Ok(())
        } else {
            Err(GatewayError::DeviceSocket(format!(
                "connection {} closed during handshake",
                self.connection.id()
            )))
        }
    }

    /// The socket closed.  Registered devices enter their grace period.
    pub fn on_close(self, supervisor: &ReconnectionSupervisor) {
        match self.device_id() {
            Some(device_id) => {
                supervisor.connection_closed(device_id, self.connection.id());
            }
            None => debug!(connection = %self.connection.id(), "unregistered socket closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelgate_core::types::PLACEHOLDER_FRIENDLY_NAME;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn open_channel(id: &str) -> Vec<u8> {
        serde_json::json!({ "channel_name": RAW_CHANNEL_NAME, "unique_id": id })
            .to_string()
            .into_bytes()
    }

    fn socket(registry: &DeviceRegistry) -> (Handshake, UnboundedReceiver<Vec<u8>>) {
        let (conn, rx) = DeviceConnection::channel();
        (Handshake::new(registry.clone(), conn), rx)
    }

    #[test]
    fn classifies_discovery() {
        let msg = br#"{"discovery_b64":"UFJJTlRFUg=="}"#;
        let first = parse_first_message(msg).unwrap();
        assert!(first.discovery);
        assert_eq!(first.raw_channel, None);
    }

    #[test]
    fn any_truthy_discovery_value_counts() {
        let cases: [&[u8]; 4] = [
            br#"{"discovery_b64":true}"#,
            br#"{"discovery_b64":1}"#,
            br#"{"discovery_b64":{}}"#,
            br#"{"discovery_b64":[]}"#,
        ];
        for msg in cases {
            assert!(parse_first_message(msg).unwrap().discovery);
        }
    }

    #[test]
    fn classifies_raw_channel() {
        assert_eq!(
            parse_first_message(&open_channel("XXRBJ")).unwrap(),
            FirstMessage {
                discovery: false,
                raw_channel: Some(DeviceId::new("XXRBJ")),
            }
        );
    }

    #[test]
    fn other_channels_and_shapes_are_ignored() {
        let cases: [&[u8]; 10] = [
            br#"{"channel_name":"v1.config.zebra.com","unique_id":"a"}"#,
            br#"{"channel_name":"v1.raw.zebra.com"}"#,
            br#"{"discovery_b64":""}"#,
            br#"{"discovery_b64":0}"#,
            br#"{"discovery_b64":false}"#,
            br#"{"discovery_b64":null}"#,
            br#"{"hello":"world"}"#,
            b"[1,2,3]",
            b"42",
            b"null",
        ];
        for msg in cases {
            assert!(parse_first_message(msg).unwrap().is_ignored(), "{msg:?}");
        }
    }

    #[test]
    fn discovery_and_channel_in_one_message_are_both_handled() {
        let registry = DeviceRegistry::new();
        let (mut handshake, mut rx) = socket(&registry);
        let msg = br#"{"discovery_b64":"abc","channel_name":"v1.raw.zebra.com","unique_id":"XXRBJ"}"#;

        handshake.on_message(msg).unwrap();

        let reply: Value = serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply, serde_json::json!({ "open": "v1.raw.zebra.com" }));
        assert_eq!(rx.try_recv().unwrap(), FRIENDLY_NAME_QUERY);
        assert_eq!(
            handshake.state(),
            &HandshakeState::RawChannelOpened {
                device_id: DeviceId::new("XXRBJ")
            }
        );
        assert!(registry.lookup(&DeviceId::new("XXRBJ")).is_some());
    }

    #[test]
    fn non_json_is_malformed() {
        let err = parse_first_message(b"! U1 getvar").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedHandshakeMessage(_)));
    }

    #[test]
    fn discovery_gets_open_directive_without_registration() {
        let registry = DeviceRegistry::new();
        let (mut handshake, mut rx) = socket(&registry);

        handshake.on_message(br#"{"discovery_b64":"abc"}"#).unwrap();

        let reply: Value = serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply, serde_json::json!({ "open": "v1.raw.zebra.com" }));
        assert_eq!(handshake.state(), &HandshakeState::DiscoveryReplied);
        assert!(registry.is_empty());
    }

    #[test]
    fn new_channel_queries_name_and_captures_first_reply() {
        let registry = DeviceRegistry::new();
        let (mut handshake, mut rx) = socket(&registry);
        let id = DeviceId::new("XXRBJ");

        handshake.on_message(&open_channel("XXRBJ")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), FRIENDLY_NAME_QUERY);
        assert_eq!(registry.list()[0].friendly_name, PLACEHOLDER_FRIENDLY_NAME);

        handshake.on_message(b"\"Shipping Desk\"").unwrap();
        handshake.on_message(b"\"Something else\"").unwrap();

        assert_eq!(registry.list()[0].friendly_name, "\"Shipping Desk\"");
        assert_eq!(handshake.state(), &HandshakeState::Ready { device_id: id });
    }

    #[test]
    fn reconnect_skips_name_query() {
        let registry = DeviceRegistry::new();
        let (mut first, _rx1) = socket(&registry);
        first.on_message(&open_channel("a")).unwrap();
        first.on_message(b"Dock 2").unwrap();

        let (mut second, mut rx2) = socket(&registry);
        second.on_message(&open_channel("a")).unwrap();
        assert!(rx2.try_recv().is_err());

        second.on_message(b"not a name").unwrap();
        assert_eq!(registry.list()[0].friendly_name, "Dock 2");
    }

    #[test]
    fn malformed_first_message_keeps_waiting() {
        let registry = DeviceRegistry::new();
        let (mut handshake, mut rx) = socket(&registry);

        assert!(handshake.on_message(b"{not json").is_err());
        assert_eq!(handshake.state(), &HandshakeState::AwaitingFirstMessage);
        assert!(rx.try_recv().is_err());

        handshake.on_message(&open_channel("late")).unwrap();
        assert!(registry.lookup(&DeviceId::new("late")).is_some());
    }

    #[test]
    fn unknown_first_message_registers_nothing() {
        let registry = DeviceRegistry::new();
        let (mut handshake, mut rx) = socket(&registry);

        handshake.on_message(br#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(handshake.state(), &HandshakeState::AwaitingFirstMessage);
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn reply_to_dead_socket_is_an_error() {
        let registry = DeviceRegistry::new();
        let (mut handshake, rx) = socket(&registry);
        drop(rx);

        let err = handshake.on_message(br#"{"discovery_b64":"abc"}"#).unwrap_err();
        assert!(matches!(err, GatewayError::DeviceSocket(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_starts_grace_period_for_registered_device() {
        let registry = DeviceRegistry::new();
        let supervisor = ReconnectionSupervisor::new(registry.clone(), Duration::from_secs(5));
        let (mut handshake, _rx) = socket(&registry);
        handshake.on_message(&open_channel("a")).unwrap();

        handshake.on_close(&supervisor);

        let info = registry.lookup(&DeviceId::new("a")).unwrap();
        assert!(!info.connected);
        assert!(info.pending_removal);
    }

    #[tokio::test(start_paused = true)]
    async fn close_before_registration_touches_nothing() {
        let registry = DeviceRegistry::new();
        let supervisor = ReconnectionSupervisor::new(registry.clone(), Duration::from_secs(5));
        let (mut handshake, _rx) = socket(&registry);
        handshake.on_message(br#"{"discovery_b64":"abc"}"#).unwrap();

        handshake.on_close(&supervisor);
        assert!(registry.is_empty());
    }
}
