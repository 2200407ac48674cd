//! recorderd - live recorder daemon
//!
//! This daemon:
//! 1. Loads the JSON config named by `RECORDER_CONFIG` (default `config.json`)
//! 2. Runs one ingestion session per configured device, forever
//! 3. Rotates segments under the storage root and sweeps old ones
//! 4. Fans live payload out to attached consumers when distribution is enabled

use anyhow::Result;
use std::sync::mpsc;

use live_recorder::{RecorderConfig, Supervisor};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = RecorderConfig::load()?;
    log::info!(
        "recorderd {} starting: sleep={}s retries={} base_delay={}ms",
        env!("CARGO_PKG_VERSION"),
        cfg.sleep.as_secs(),
        cfg.retry.max_retries,
        cfg.retry.base_delay.as_millis()
    );
    for device in &cfg.devices {
        log::info!(
            "device {}: size={}MB keep={} transcode={} stream_only={} distribute={}",
            device.name,
            device.size_mb,
            device.count,
            device.transcode,
            device.stream_only,
            device.distribute
        );
    }

    let handle = Supervisor::start(cfg)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("recorderd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping sessions...");
    handle.stop()?;

    Ok(())
}
