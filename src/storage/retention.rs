//! Per-device retention of recorded artifacts.
//!
//! Each sweep keeps the `count` most recently modified entries for a device
//! and removes the rest. Entries with equal modification times keep their
//! directory-listing order (the sort is stable), so which of two tied
//! entries survives depends on the filesystem. Between sweeps the set may
//! exceed `count`.

use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::config::DeviceSource;
use crate::shutdown::StopSignal;

/// Which entries under a device directory count as retention artifacts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetentionLayout {
    /// Date-bucket directories directly under the device directory.
    #[default]
    Folders,
    /// Segment files, either flat in the device directory or one level down
    /// inside date buckets.
    Files,
}

impl FromStr for RetentionLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "folders" | "folder" | "dirs" | "days" => Ok(Self::Folders),
            "files" | "file" | "segments" => Ok(Self::Files),
            other => Err(anyhow!(
                "unknown retention layout '{}': expected 'folders' or 'files'",
                other
            )),
        }
    }
}

/// Outcome of sweeping one device directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub device: String,
    pub kept: usize,
    pub removed: Vec<PathBuf>,
    pub failed: usize,
}

/// Trim `device_dir` to its `keep` most recently modified artifacts.
///
/// Best effort: unreadable entries are skipped and failed deletions are
/// logged and counted, never propagated.
pub fn sweep_device(device_dir: &Path, keep: usize, layout: RetentionLayout) -> SweepReport {
    let device = device_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut report = SweepReport {
        device,
        ..SweepReport::default()
    };

    let mut entries = match list_artifacts(device_dir, layout) {
        Ok(entries) => entries,
        Err(err) => {
            log::debug!("retention: skipping {}: {}", device_dir.display(), err);
            return report;
        }
    };
    if entries.len() <= keep {
        report.kept = entries.len();
        return report;
    }

    entries.sort_by(|a, b| b.1.cmp(&a.1));
    report.kept = keep;
    for (path, _) in entries.into_iter().skip(keep) {
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                log::info!("retention: removed {}", path.display());
                report.removed.push(path);
            }
            Err(err) => {
                log::warn!("retention: failed to remove {}: {}", path.display(), err);
                report.failed += 1;
            }
        }
    }
    if layout == RetentionLayout::Files {
        remove_emptied_buckets(device_dir, &report.removed);
    }
    report
}

/// Drop date buckets whose last segment this sweep removed.
fn remove_emptied_buckets(device_dir: &Path, removed: &[PathBuf]) {
    let mut buckets: Vec<&Path> = removed
        .iter()
        .filter_map(|path| path.parent())
        .filter(|parent| *parent != device_dir)
        .collect();
    buckets.sort();
    buckets.dedup();
    for bucket in buckets {
        let empty = fs::read_dir(bucket).is_ok_and(|mut entries| entries.next().is_none());
        if !empty {
            continue;
        }
        match fs::remove_dir(bucket) {
            Ok(()) => log::info!("retention: removed empty bucket {}", bucket.display()),
            Err(err) => log::warn!("retention: failed to remove {}: {}", bucket.display(), err),
        }
    }
}

fn list_artifacts(device_dir: &Path, layout: RetentionLayout) -> Result<Vec<(PathBuf, SystemTime)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(device_dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        match layout {
            RetentionLayout::Folders => {
                if meta.is_dir() {
                    if let Ok(modified) = meta.modified() {
                        out.push((entry.path(), modified));
                    }
                }
            }
            RetentionLayout::Files => {
                if meta.is_file() {
                    if let Ok(modified) = meta.modified() {
                        out.push((entry.path(), modified));
                    }
                } else if meta.is_dir() {
                    let Ok(children) = fs::read_dir(entry.path()) else {
                        continue;
                    };
                    for child in children.flatten() {
                        let Ok(child_meta) = child.metadata() else { continue };
                        if !child_meta.is_file() {
                            continue;
                        }
                        if let Ok(modified) = child_meta.modified() {
                            out.push((child.path(), modified));
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Periodic retention over every configured device.
pub struct RetentionSweeper {
    root: PathBuf,
    devices: Vec<(String, usize)>,
    layout: RetentionLayout,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        root: impl Into<PathBuf>,
        devices: &[DeviceSource],
        layout: RetentionLayout,
        interval: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            devices: devices
                .iter()
                .filter(|device| !device.stream_only)
                .map(|device| (device.name.clone(), device.count))
                .collect(),
            layout,
            interval,
        }
    }

    /// Sweep every device once.
    pub fn sweep_all(&self) -> Vec<SweepReport> {
        self.devices
            .iter()
            .map(|(name, count)| sweep_device(&self.root.join(name), *count, self.layout))
            .collect()
    }

    /// Sleep, sweep, repeat until `stop` fires.
    pub fn run(&self, stop: &StopSignal) {
        log::info!(
            "retention: sweeping {} device(s) every {}s",
            self.devices.len(),
            self.interval.as_secs()
        );
        while !stop.wait_timeout(self.interval) {
            for report in self.sweep_all() {
                if !report.removed.is_empty() || report.failed > 0 {
                    log::info!(
                        "retention: {} kept={} removed={} failed={}",
                        report.device,
                        report.kept,
                        report.removed.len(),
                        report.failed
                    );
                }
            }
        }
        log::debug!("retention: stopped");
    }
}
