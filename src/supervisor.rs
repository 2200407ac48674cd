//! Process wiring: one ingestion thread per device, the retention sweeper,
//! the distribution hub and the optional status API.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::api::{ApiConfig, ApiHandle, ApiServer};
use crate::config::RecorderConfig;
use crate::hub::DistributionHub;
use crate::ingest::{IngestionSession, SessionStatus};
use crate::shutdown::StopSignal;
use crate::storage::{RetentionSweeper, SegmentStore};
use crate::transport::WsConnector;

/// How long `stop` waits for ingestion threads blocked in a socket read.
const SESSION_JOIN_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor;

impl Supervisor {
    /// Start every configured device plus the sweeper and API.
    ///
    /// Device failures never surface here: sessions retry forever. Only
    /// setup errors (bad endpoint, thread spawn, API bind) are returned.
    pub fn start(cfg: RecorderConfig) -> Result<SupervisorHandle> {
        let stop = StopSignal::new();
        let hub = Arc::new(DistributionHub::new(cfg.hub));
        let mut sessions = Vec::with_capacity(cfg.devices.len());
        let mut statuses = Vec::with_capacity(cfg.devices.len());

        for device in &cfg.devices {
            let connector = WsConnector::new(&device.endpoint())
                .with_context(|| format!("device {}", device.name))?;
            let mut session =
                IngestionSession::new(device.clone(), connector, cfg.retry, cfg.sleep);
            if !device.stream_only {
                let store = SegmentStore::new(&cfg.storage_root, device, cfg.encoder.clone());
                session = session.with_store(store);
            }
            if device.distribute {
                session = session.with_hub(hub.clone());
            }
            statuses.push(session.status());

            let stop_session = stop.clone();
            let join = std::thread::Builder::new()
                .name(format!("ingest-{}", device.name))
                .spawn(move || session.run(&stop_session))
                .with_context(|| format!("failed to spawn session for {}", device.name))?;
            sessions.push(join);
        }

        let sweeper = RetentionSweeper::new(
            &cfg.storage_root,
            &cfg.devices,
            cfg.retention_layout,
            cfg.sleep,
        );
        let stop_sweeper = stop.clone();
        let sweeper = std::thread::Builder::new()
            .name("retention".to_string())
            .spawn(move || sweeper.run(&stop_sweeper))
            .context("failed to spawn retention sweeper")?;

        let api = match &cfg.api_addr {
            Some(addr) => {
                let handle = ApiServer::new(
                    ApiConfig { addr: addr.clone() },
                    hub.clone(),
                    statuses.clone(),
                )
                .spawn()?;
                log::info!("status api listening on {}", handle.addr);
                Some(handle)
            }
            None => None,
        };

        log::info!(
            "recorder running: {} device(s), storage at {}",
            cfg.devices.len(),
            cfg.storage_root.display()
        );

        Ok(SupervisorHandle {
            stop,
            hub,
            statuses,
            sessions,
            sweeper: Some(sweeper),
            api,
        })
    }
}

pub struct SupervisorHandle {
    stop: StopSignal,
    hub: Arc<DistributionHub>,
    statuses: Vec<Arc<SessionStatus>>,
    sessions: Vec<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    api: Option<ApiHandle>,
}

impl SupervisorHandle {
    pub fn hub(&self) -> &Arc<DistributionHub> {
        &self.hub
    }

    pub fn statuses(&self) -> &[Arc<SessionStatus>] {
        &self.statuses
    }

    /// Bound address of the status API, when enabled.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api.as_ref().map(|api| api.addr)
    }

    /// Stop everything. Sessions blocked in a device read are given a short
    /// grace period and then left to exit with the process.
    pub fn stop(mut self) -> Result<()> {
        self.stop.stop();
        if let Some(api) = self.api.take() {
            api.stop()?;
        }
        if let Some(sweeper) = self.sweeper.take() {
            if sweeper.join().is_err() {
                log::error!("retention sweeper panicked");
            }
        }
        self.hub.shutdown();

        let deadline = Instant::now() + SESSION_JOIN_GRACE;
        let mut pending = std::mem::take(&mut self.sessions);
        while !pending.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|join| join.is_finished());
            for join in finished {
                if join.join().is_err() {
                    log::error!("ingestion session panicked");
                }
            }
            pending = running;
            if !pending.is_empty() {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        if !pending.is_empty() {
            log::warn!(
                "{} session(s) still blocked on device reads at shutdown",
                pending.len()
            );
        }
        Ok(())
    }
}
