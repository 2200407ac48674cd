//! Device transport abstractions.
//!
//! The ingestion session only sees `Connector` and `Connection`. The
//! production implementation is a TLS WebSocket client (`ws`) that skips
//! certificate verification for devices shipping self-signed certificates
//! (`tls`).

mod tls;
mod ws;

pub use tls::insecure_tls_connector;
pub use ws::{WsConnection, WsConnector};

use anyhow::Result;

/// Opens fresh connections to one device endpoint.
pub trait Connector: Send {
    type Conn: Connection;

    fn connect(&mut self) -> Result<Self::Conn>;
}

/// An open, exclusively owned device connection.
pub trait Connection: Send {
    /// Send one text frame.
    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Block until the next frame arrives and return its payload.
    ///
    /// Control frames (ping/pong) are returned as empty payloads so callers
    /// can apply one length-based filter to everything.
    fn read_frame(&mut self) -> Result<Vec<u8>>;

    /// Best-effort shutdown of the underlying transport.
    fn close(&mut self);
}
