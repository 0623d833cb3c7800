// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Labelgate.

use thiserror::Error;

use crate::types::DeviceId;

/// Top-level error type for all Labelgate operations.
///
/// Device-scoped errors (handshake, transport) never take the process down;
/// only startup errors (config, certificates, bind) are fatal, and only in
/// `main`.
#[derive(Debug, Error)]
pub enum GatewayError {
    // -- Device transport --
    #[error("malformed handshake message: {0}")]
    MalformedHandshakeMessage(String),

    #[error("write to device {0} failed: transport closed")]
    TransportWrite(DeviceId),

    #[error("device socket error: {0}")]
    DeviceSocket(String),

    // -- Startup --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("server error: {0}")]
    Server(String),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_write_names_the_device() {
        let err = GatewayError::TransportWrite(DeviceId::new("ZT411-7"));
        assert_eq!(err.to_string(), "write to device ZT411-7 failed: transport closed");
    }

    #[test]
    fn startup_errors_keep_their_context() {
        let err = GatewayError::Certificate("no certificates found in chain.pem".into());
        assert_eq!(err.to_string(), "certificate error: no certificates found in chain.pem");
        let err = GatewayError::Config("CERT_PATH is not set".into());
        assert_eq!(err.to_string(), "configuration error: CERT_PATH is not set");
    }
}
