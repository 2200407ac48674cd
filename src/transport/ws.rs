//! Blocking TLS WebSocket client for device live endpoints.

use anyhow::{anyhow, Context, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Connector as TlsMode, Message, WebSocket};
use url::Url;

use super::{insecure_tls_connector, Connection, Connector};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Devices push continuously; this much silence means the peer is gone.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct WsConnector {
    url: Url,
    tls: native_tls::TlsConnector,
}

impl WsConnector {
    pub fn new(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint).with_context(|| format!("invalid endpoint '{endpoint}'"))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(anyhow!("unsupported endpoint scheme '{}'", other)),
        }
        if url.host_str().is_none() {
            return Err(anyhow!("endpoint '{}' has no host", endpoint));
        }
        Ok(Self {
            url,
            tls: insecure_tls_connector()?,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    fn open_tcp(&self) -> Result<TcpStream> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| anyhow!("endpoint has no host"))?;
        let port = self
            .url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("endpoint has no port"))?;
        let mut last_err = None;
        for addr in (host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {host}:{port}"))?
        {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(READ_TIMEOUT))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => anyhow!("failed to connect to {host}:{port}: {err}"),
            None => anyhow!("{host}:{port} resolved to no addresses"),
        })
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    fn connect(&mut self) -> Result<WsConnection> {
        let tcp = self.open_tcp()?;
        let mode = if self.url.scheme() == "wss" {
            TlsMode::NativeTls(self.tls.clone())
        } else {
            TlsMode::Plain
        };
        let (socket, response) =
            tungstenite::client_tls_with_config(self.url.as_str(), tcp, None, Some(mode))
                .map_err(|e| anyhow!("websocket handshake with {} failed: {}", self.url, e))?;
        log::debug!("{}: handshake status {}", self.url, response.status());
        Ok(WsConnection { socket })
    }
}

pub struct WsConnection {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    fn send_text(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::Text(text.to_string()))
            .context("websocket send failed")
    }

    fn read_frame(&mut self) -> Result<Vec<u8>> {
        match self.socket.read().context("websocket read failed")? {
            Message::Binary(data) => Ok(data),
            Message::Text(text) => Ok(text.into_bytes()),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(Vec::new()),
            Message::Close(frame) => Err(anyhow!("websocket closed by peer: {:?}", frame)),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_endpoints() {
        assert!(WsConnector::new("https://camera.local/h5player/live").is_err());
        assert!(WsConnector::new("not a url").is_err());
    }

    #[test]
    fn keeps_device_path() -> Result<()> {
        let connector = WsConnector::new("wss://10.0.0.7:8443/h5player/live")?;
        assert_eq!(connector.url(), "wss://10.0.0.7:8443/h5player/live");
        Ok(())
    }

    #[test]
    fn refused_tcp_surfaces_as_error() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        let mut connector = WsConnector::new(&format!("ws://127.0.0.1:{port}/h5player/live"))?;
        assert!(connector.connect().is_err());
        Ok(())
    }
}
