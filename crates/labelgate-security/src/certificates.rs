// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TLS identity loading: PEM certificate chain plus private key for the
// device-facing WebSocket listener.
//
// # Design note
//
// rustls re-exports the `pki-types` PEM decoder, so no separate PEM crate is
// needed.  The key may be PKCS#8, PKCS#1 (RSA) or SEC1 (EC); the first key
// block in the file wins.  The crypto provider is pinned to `ring` so the
// config does not depend on a process-wide default provider being installed.

use std::path::Path;
use std::sync::Arc;

use labelgate_core::error::{GatewayError, Result};
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info, instrument};

/// A certificate chain and the private key for its leaf.
pub struct TlsIdentity {
    /// DER certificates, leaf first.
    chain: Vec<CertificateDer<'static>>,
    /// DER private key for `chain[0]`.
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Read a PEM certificate chain and a PEM private key from disk.
    ///
    /// # Errors
    ///
    /// `GatewayError::Certificate` if either file is unreadable, the chain
    /// file holds no certificates, or the key file holds no private key.
    #[instrument(fields(cert = %cert_path.display(), key = %key_path.display()))]
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let chain = CertificateDer::pem_file_iter(cert_path)
            .map_err(|e| {
                GatewayError::Certificate(format!("read {}: {e:?}", cert_path.display()))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                GatewayError::Certificate(format!("parse {}: {e:?}", cert_path.display()))
            })?;

        if chain.is_empty() {
            return Err(GatewayError::Certificate(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
            GatewayError::Certificate(format!(
                "no usable private key in {}: {e:?}",
                key_path.display()
            ))
        })?;

        debug!(certificates = chain.len(), "TLS identity loaded");

        Ok(Self { chain, key })
    }

    /// Number of certificates in the chain.
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Build a server config presenting this identity, no client auth.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Certificate(format!("protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| GatewayError::Certificate(format!("server config: {e}")))?;

        info!(certificates = self.chain.len(), "TLS server config ready");
        Ok(Arc::new(config))
    }
}
