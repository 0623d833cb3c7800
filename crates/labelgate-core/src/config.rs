// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Gateway configuration.
//
// Sources, lowest to highest priority: built-in defaults, `labelgate.toml` in
// the working directory (optional), then the raw environment variables the
// deployment already uses (`API_PORT`, `WEBSOCKET_PORT`, `PRINTER_TIMEOUT`,
// `CERT_PATH`, `CERT_KEY_PATH`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Optional config file read from the working directory.
pub const CONFIG_FILE: &str = "labelgate.toml";

/// Environment variables consulted by [`GatewayConfig::load`].
const ENV_KEYS: [&str; 5] = [
    "api_port",
    "websocket_port",
    "printer_timeout",
    "cert_path",
    "cert_key_path",
];

/// Process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port for the HTTP control surface (default 3000).
    pub api_port: u16,
    /// Port for the device TLS WebSocket listener (default 3001).
    pub websocket_port: u16,
    /// Grace period in milliseconds before a disconnected device is
    /// forgotten, and the longest a relay waits for it to come back.
    pub printer_timeout: u64,
    /// PEM certificate chain presented to devices.
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`.
    pub cert_key_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_port: 3000,
            websocket_port: 3001,
            printer_timeout: 5000,
            cert_path: None,
            cert_key_path: None,
        }
    }
}

impl GatewayConfig {
    /// Load from defaults, `labelgate.toml`, and the process environment.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// The layered figment used by [`load`](Self::load).
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(&ENV_KEYS))
    }

    /// Extract a config from any figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| GatewayError::Config(format!("failed to load configuration: {e}")))
    }

    /// Grace period as a `Duration`.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.printer_timeout)
    }

    /// Certificate and key paths, both required to start the device listener.
    pub fn tls_paths(&self) -> Result<(&Path, &Path)> {
        let cert = non_empty(self.cert_path.as_deref())
            .ok_or_else(|| GatewayError::Config("CERT_PATH is not set".into()))?;
        let key = non_empty(self.cert_key_path.as_deref())
            .ok_or_else(|| GatewayError::Config("CERT_KEY_PATH is not set".into()))?;
        Ok((cert, key))
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}
