//! Read-only status API and raw live attach points.
//!
//! Routes:
//! - `GET /health`
//! - `GET /status`: `{stream_id: {consumerCount, active, published, dropped, consumers}}`
//! - `GET /sessions`: per-device ingestion counters
//! - `GET /live/{id}/raw` and `GET /live/{id}.flv`: attach the connection as
//!   a hub consumer. The socket is handed to the consumer's forwarder and is
//!   detached when a write fails (client gone).

use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::hub::{ConsumerKind, DistributionHub};
use crate::ingest::SessionStatus;
use crate::shutdown::StopSignal;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const LIVE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    hub: Arc<DistributionHub>,
    sessions: Vec<Arc<SessionStatus>>,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        hub: Arc<DistributionHub>,
        sessions: Vec<Arc<SessionStatus>>,
    ) -> Self {
        Self { cfg, hub, sessions }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let stop = StopSignal::new();
        let stop_thread = stop.clone();
        let join = std::thread::Builder::new()
            .name("status-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &self.hub, &self.sessions, &stop_thread) {
                    log::error!("status api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            stop,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    hub: &DistributionHub,
    sessions: &[Arc<SessionStatus>],
    stop: &StopSignal,
) -> Result<()> {
    let consumer_seq = AtomicU64::new(0);
    loop {
        if stop.is_stopped() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, hub, sessions, &consumer_seq) {
                    log::warn!("status api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if stop.wait_timeout(ACCEPT_POLL) {
                    break;
                }
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    hub: &DistributionHub,
    sessions: &[Arc<SessionStatus>],
    consumer_seq: &AtomicU64,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match Route::parse(&request.path) {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::Status => {
            let payload = serde_json::to_vec(&hub.status())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        Route::Sessions => {
            let snapshots: Vec<_> = sessions.iter().map(|s| s.snapshot()).collect();
            let payload = serde_json::to_vec(&snapshots)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        Route::Live { stream_id, kind } => {
            let Some(live) = hub.get_stream(&stream_id) else {
                return write_json_response(&mut stream, 404, r#"{"error":"stream_not_found"}"#);
            };
            let content_type = match kind {
                ConsumerKind::HttpFlv => "video/x-flv",
                _ => "application/octet-stream",
            };
            write_stream_header(&mut stream, content_type)?;
            stream.set_write_timeout(Some(LIVE_WRITE_TIMEOUT))?;
            let consumer_id = format!(
                "{}-{}-{}-{}",
                kind,
                stream_id,
                peer,
                consumer_seq.fetch_add(1, Ordering::Relaxed)
            );
            live.attach(consumer_id, kind, Box::new(stream))?;
            Ok(())
        }
        Route::NotFound => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Status,
    Sessions,
    Live { stream_id: String, kind: ConsumerKind },
    NotFound,
}

impl Route {
    fn parse(path: &str) -> Self {
        match path {
            "/health" => return Self::Health,
            "/status" => return Self::Status,
            "/sessions" => return Self::Sessions,
            _ => {}
        }
        let Some(rest) = path.strip_prefix("/live/") else {
            return Self::NotFound;
        };
        let (stream_id, kind) = if let Some(id) = rest.strip_suffix("/raw") {
            (id, ConsumerKind::Raw)
        } else if let Some(id) = rest.strip_suffix(".flv") {
            (id, ConsumerKind::HttpFlv)
        } else {
            return Self::NotFound;
        };
        if stream_id.is_empty() || stream_id.contains('/') {
            return Self::NotFound;
        }
        Self::Live {
            stream_id: stream_id.to_string(),
            kind,
        }
    }
}

/// Read up to the end of the request head and parse the request line.
fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    }
    let head = String::from_utf8_lossy(&data);
    let request_line = head
        .lines()
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let target = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

/// Open-ended response: no length, body runs until either side closes.
fn write_stream_header(stream: &mut TcpStream, content_type: &str) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nCache-Control: no-cache\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        status_line = status_line(200),
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_parse_live_endpoints() {
        assert_eq!(
            Route::parse("/live/gate/raw"),
            Route::Live {
                stream_id: "gate".into(),
                kind: ConsumerKind::Raw
            }
        );
        assert_eq!(
            Route::parse("/live/gate.flv"),
            Route::Live {
                stream_id: "gate".into(),
                kind: ConsumerKind::HttpFlv
            }
        );
        assert_eq!(Route::parse("/live//raw"), Route::NotFound);
        assert_eq!(Route::parse("/live/a/b/raw"), Route::NotFound);
        assert_eq!(Route::parse("/live/gate.m3u8"), Route::NotFound);
        assert_eq!(Route::parse("/status"), Route::Status);
    }
}
