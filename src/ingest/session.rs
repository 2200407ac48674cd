//! Per-device ingestion session.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> Reconnecting -> Disconnected ...
//!                     |                          ^
//!                     +--------------------------+   (connect/auth failure)
//! ```
//!
//! `Closed` is entered only when the stop signal fires; the daemon never
//! fires it before process exit.
//!
//! While Streaming, a read failure first goes through the read-retry
//! sub-loop: up to `RetryPolicy::max_retries` in-place reconnects with
//! exponential delays, each producing a fresh connection that replaces the
//! broken one. The open segment survives a successful resume, so bytes from
//! before and after a reconnect land in the same file with no gap marker.
//! Storage errors skip the sub-loop and go straight to Reconnecting.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::RetryPolicy;
use crate::config::DeviceSource;
use crate::hub::DistributionHub;
use crate::shutdown::StopSignal;
use crate::storage::SegmentStore;
use crate::transport::{Connection, Connector};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

/// Live view of one session, shared with status readers.
#[derive(Debug)]
pub struct SessionStatus {
    device: String,
    state: RwLock<SessionState>,
    connect_attempts: AtomicU64,
    resumes: AtomicU64,
    outer_reconnects: AtomicU64,
    payload_frames: AtomicU64,
    payload_bytes: AtomicU64,
    control_frames: AtomicU64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub device: String,
    pub state: SessionState,
    pub connect_attempts: u64,
    pub resumes: u64,
    pub outer_reconnects: u64,
    pub payload_frames: u64,
    pub payload_bytes: u64,
    pub control_frames: u64,
}

impl SessionStatus {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            state: RwLock::new(SessionState::Disconnected),
            connect_attempts: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
            outer_reconnects: AtomicU64::new(0),
            payload_frames: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
            control_frames: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes.load(Ordering::Relaxed)
    }

    pub fn outer_reconnects(&self) -> u64 {
        self.outer_reconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device: self.device.clone(),
            state: self.state(),
            connect_attempts: self.connect_attempts(),
            resumes: self.resumes(),
            outer_reconnects: self.outer_reconnects(),
            payload_frames: self.payload_frames.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            control_frames: self.control_frames.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut guard = self.state.write();
        if *guard != state {
            log::debug!("{}: {:?} -> {:?}", self.device, *guard, state);
            *guard = state;
        }
    }
}

pub struct IngestionSession<C: Connector> {
    device: DeviceSource,
    connector: C,
    store: Option<SegmentStore>,
    hub: Option<Arc<DistributionHub>>,
    retry: RetryPolicy,
    reconnect_delay: Duration,
    consecutive_failures: u32,
    status: Arc<SessionStatus>,
}

impl<C: Connector> IngestionSession<C> {
    pub fn new(
        device: DeviceSource,
        connector: C,
        retry: RetryPolicy,
        reconnect_delay: Duration,
    ) -> Self {
        let status = Arc::new(SessionStatus::new(device.name.clone()));
        Self {
            device,
            connector,
            store: None,
            hub: None,
            retry,
            reconnect_delay,
            consecutive_failures: 0,
            status,
        }
    }

    /// Persist payload through `store`.
    pub fn with_store(mut self, store: SegmentStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish payload to the hub stream named after the device. The stream
    /// is resolved per packet, so one removed and recreated later is fed too.
    pub fn with_hub(mut self, hub: Arc<DistributionHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn status(&self) -> Arc<SessionStatus> {
        self.status.clone()
    }

    /// Connect, stream and reconnect until `stop` fires.
    pub fn run(&mut self, stop: &StopSignal) {
        let name = self.device.name.clone();
        log::info!("{}: ingesting from {}", name, self.device.endpoint());

        while !stop.is_stopped() {
            self.status.set_state(SessionState::Connecting);
            match self.open_connection() {
                Ok(conn) => {
                    log::info!("{}: connected", name);
                    self.consecutive_failures = 0;
                    self.status.set_state(SessionState::Streaming);
                    if let Err(err) = self.stream_until_failure(conn, stop) {
                        if !stop.is_stopped() {
                            log::warn!("{}: streaming stopped: {:#}", name, err);
                        }
                    }
                    self.close_segment();
                }
                Err(err) => log::warn!("{}: connection failed: {:#}", name, err),
            }

            if stop.is_stopped() {
                break;
            }
            self.status.set_state(SessionState::Reconnecting);
            self.status.outer_reconnects.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "{}: reconnecting in {}s",
                name,
                self.reconnect_delay.as_secs_f32()
            );
            if stop.wait_timeout(self.reconnect_delay) {
                break;
            }
            self.status.set_state(SessionState::Disconnected);
        }

        self.close_segment();
        self.status.set_state(SessionState::Closed);
        log::info!("{}: session closed", name);
    }

    /// Open the transport and send the authentication frame.
    fn open_connection(&mut self) -> Result<C::Conn> {
        self.status.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.connector.connect()?;
        if let Err(err) = conn.send_text(&self.device.auth_message()) {
            conn.close();
            return Err(err.context("failed to send authentication frame"));
        }
        Ok(conn)
    }

    fn stream_until_failure(&mut self, mut conn: C::Conn, stop: &StopSignal) -> Result<()> {
        loop {
            if stop.is_stopped() {
                conn.close();
                return Err(anyhow!("stop requested"));
            }
            let frame = match conn.read_frame() {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    frame
                }
                Err(err) => {
                    log::warn!("{}: read failed: {:#}", self.device.name, err);
                    conn = self.resume(conn, stop)?;
                    continue;
                }
            };
            if frame.len() <= 1 {
                self.status.control_frames.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Err(err) = self.handle_payload(frame) {
                conn.close();
                return Err(err);
            }
        }
    }

    fn handle_payload(&mut self, frame: Vec<u8>) -> Result<()> {
        if let Some(store) = self.store.as_mut() {
            store.write(&frame)?;
        }
        self.status.payload_frames.fetch_add(1, Ordering::Relaxed);
        self.status
            .payload_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        if let Some(hub) = &self.hub {
            if let Err(err) = hub.publish(&self.device.name, Bytes::from(frame)) {
                log::debug!("{}: live publish skipped: {:#}", self.device.name, err);
            }
        }
        Ok(())
    }

    /// Read-retry sub-loop. Consumes the broken connection and hands back a
    /// fresh, authenticated one, or fails once the retry budget is spent.
    fn resume(&mut self, broken: C::Conn, stop: &StopSignal) -> Result<C::Conn> {
        let mut broken = Some(broken);
        let mut last_err = None;
        loop {
            let attempt = self.consecutive_failures;
            if attempt >= self.retry.max_retries {
                if let Some(mut conn) = broken.take() {
                    conn.close();
                }
                let reason = last_err
                    .map(|err: anyhow::Error| format!(": {err:#}"))
                    .unwrap_or_default();
                return Err(anyhow!(
                    "read retries exhausted after {} attempt(s){}",
                    attempt,
                    reason
                ));
            }
            self.consecutive_failures += 1;

            let delay = self.retry.delay_for(attempt);
            log::info!(
                "{}: resuming (attempt {}/{}) in {:.1}s",
                self.device.name,
                attempt + 1,
                self.retry.max_retries,
                delay.as_secs_f32()
            );
            if stop.wait_timeout(delay) {
                if let Some(mut conn) = broken.take() {
                    conn.close();
                }
                return Err(anyhow!("stop requested"));
            }
            if let Some(mut conn) = broken.take() {
                conn.close();
            }

            match self.open_connection() {
                Ok(conn) => {
                    self.status.resumes.fetch_add(1, Ordering::Relaxed);
                    log::info!("{}: resumed", self.device.name);
                    return Ok(conn);
                }
                Err(err) => {
                    log::warn!("{}: resume failed: {:#}", self.device.name, err);
                    last_err = Some(err);
                }
            }
        }
    }

    fn close_segment(&mut self) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        match store.close() {
            Ok(Some(segment)) => log::info!(
                "{}: finished segment {} ({} bytes)",
                self.device.name,
                segment.path.display(),
                segment.bytes
            ),
            Ok(None) => {}
            Err(err) => log::warn!("{}: {:#}", self.device.name, err),
        }
    }
}
