// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// labelgate-security — TLS identity for the device listener.
//
// Printers only connect to the gateway over a secure WebSocket, so the
// listener cannot start without a certificate chain and its private key.
// This crate turns the PEM files named in the configuration into a rustls
// `ServerConfig`.

pub mod certificates;

pub use certificates::TlsIdentity;
