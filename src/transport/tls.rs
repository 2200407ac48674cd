//! TLS settings for device transports.
//!
//! Recording devices typically present self-signed certificates on their
//! embedded web players, so verification is disabled outright: trust on first
//! use, with no pinning.

use anyhow::{Context, Result};
use native_tls::TlsConnector;

/// A TLS connector that accepts any certificate and hostname.
pub fn insecure_tls_connector() -> Result<TlsConnector> {
    TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .context("failed to build TLS connector")
}
