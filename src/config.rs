use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::HubSettings;
use crate::ingest::RetryPolicy;
use crate::storage::{EncodeMode, EncoderSettings, RetentionLayout};

const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_STORAGE_PATH: &str = "./";
const DEFAULT_SLEEP_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_STREAM_CAPACITY: usize = 100;
const DEFAULT_CONSUMER_CAPACITY: usize = 100;
const DEFAULT_FFMPEG_EXEC: &str = "ffmpeg";

#[derive(Debug, Deserialize, Default)]
struct RecorderConfigFile {
    path: Option<String>,
    sleep: Option<u64>,
    api: Option<ApiConfigFile>,
    distribution: Option<DistributionConfigFile>,
    retry: Option<RetryConfigFile>,
    retention: Option<RetentionConfigFile>,
    ffmpeg: Option<FfmpegConfigFile>,
    #[serde(default)]
    video: Vec<DeviceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DistributionConfigFile {
    enabled: Option<bool>,
    stream_capacity: Option<usize>,
    consumer_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    layout: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FfmpegConfigFile {
    exec: Option<String>,
    #[serde(rename = "type")]
    mode: Option<String>,
    gpu: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceConfigFile {
    #[serde(alias = "ws_host")]
    ws_host: String,
    #[serde(alias = "param_msg", default)]
    param_msg: String,
    name: String,
    size: u64,
    count: usize,
    #[serde(default)]
    transcode: bool,
    #[serde(alias = "stream_only", default)]
    stream_only: bool,
    distribute: Option<bool>,
}

/// Process-wide recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub storage_root: PathBuf,
    /// Outer reconnect delay and retention sweep interval.
    pub sleep: Duration,
    pub api_addr: Option<String>,
    pub hub: HubSettings,
    pub retry: RetryPolicy,
    pub retention_layout: RetentionLayout,
    pub encoder: EncoderSettings,
    pub devices: Vec<DeviceSource>,
}

/// One configured remote video source. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSource {
    pub ws_host: String,
    pub param_msg: String,
    pub name: String,
    /// Segment size threshold in megabytes.
    pub size_mb: u64,
    /// Number of most recent artifacts kept by the retention sweeper.
    pub count: usize,
    pub transcode: bool,
    pub stream_only: bool,
    pub distribute: bool,
}

impl DeviceSource {
    /// Endpoint URL for the device's live transport.
    pub fn endpoint(&self) -> String {
        format!("wss://{}/h5player/live", self.ws_host)
    }

    /// The single text frame sent right after the transport opens.
    pub fn auth_message(&self) -> String {
        format!("_paramStr_={}", self.param_msg)
    }

    /// Rotation boundary in bytes.
    pub fn segment_threshold(&self) -> u64 {
        self.size_mb.saturating_mul(1024 * 1024)
    }
}

impl RecorderConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RECORDER_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let file_cfg = read_config_file(Path::new(&config_path))?;
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file_cfg: RecorderConfigFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RecorderConfigFile) -> Result<Self> {
        let storage_root = PathBuf::from(
            file.path
                .filter(|path| !path.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STORAGE_PATH.to_string()),
        );
        let sleep = Duration::from_secs(file.sleep.unwrap_or(DEFAULT_SLEEP_SECS));
        let api_addr = file.api.and_then(|api| api.addr);

        let distribution = file.distribution.unwrap_or_default();
        let distribution_enabled = distribution.enabled.unwrap_or(false);
        let hub = HubSettings {
            stream_capacity: distribution
                .stream_capacity
                .unwrap_or(DEFAULT_STREAM_CAPACITY),
            consumer_capacity: distribution
                .consumer_capacity
                .unwrap_or(DEFAULT_CONSUMER_CAPACITY),
        };

        let retry = RetryPolicy {
            max_retries: file
                .retry
                .as_ref()
                .and_then(|retry| retry.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay: Duration::from_millis(
                file.retry
                    .as_ref()
                    .and_then(|retry| retry.base_delay_ms)
                    .unwrap_or(DEFAULT_BASE_DELAY_MS),
            ),
        };

        let retention_layout = match file.retention.and_then(|retention| retention.layout) {
            Some(layout) => layout.parse()?,
            None => RetentionLayout::default(),
        };

        let ffmpeg = file.ffmpeg.unwrap_or_default();
        let mode = match ffmpeg.mode.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("") | Some("copy") => EncodeMode::Copy,
            Some("cpu") => EncodeMode::Cpu,
            Some("gpu") => EncodeMode::Gpu(ffmpeg.gpu.clone().unwrap_or_default()),
            Some(other) => {
                return Err(anyhow!(
                    "unknown ffmpeg type '{}': expected 'copy', 'cpu' or 'gpu'",
                    other
                ))
            }
        };
        let encoder = EncoderSettings {
            exec: ffmpeg
                .exec
                .filter(|exec| !exec.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FFMPEG_EXEC.to_string()),
            mode,
        };

        let devices = file
            .video
            .into_iter()
            .map(|device| DeviceSource {
                ws_host: device.ws_host.trim().to_string(),
                param_msg: device.param_msg,
                name: device.name.trim().to_string(),
                size_mb: device.size,
                count: device.count,
                transcode: device.transcode,
                stream_only: device.stream_only,
                distribute: device.distribute.unwrap_or(distribution_enabled),
            })
            .collect();

        Ok(Self {
            storage_root,
            sleep,
            api_addr,
            hub,
            retry,
            retention_layout,
            encoder,
            devices,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("RECORDER_STORAGE_PATH") {
            if !path.trim().is_empty() {
                self.storage_root = PathBuf::from(path);
            }
        }
        if let Ok(sleep) = std::env::var("RECORDER_SLEEP_SECS") {
            let seconds: u64 = sleep.trim().parse().map_err(|_| {
                anyhow!("RECORDER_SLEEP_SECS must be an integer number of seconds")
            })?;
            self.sleep = Duration::from_secs(seconds);
        }
        if let Ok(addr) = std::env::var("RECORDER_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = Some(addr);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.sleep.is_zero() {
            return Err(anyhow!("sleep must be greater than zero"));
        }
        if self.devices.is_empty() {
            return Err(anyhow!("at least one video device must be configured"));
        }
        if self.hub.stream_capacity == 0 || self.hub.consumer_capacity == 0 {
            return Err(anyhow!("distribution capacities must be greater than zero"));
        }
        if let EncodeMode::Gpu(codec) = &self.encoder.mode {
            if codec.trim().is_empty() && self.devices.iter().any(|d| d.transcode) {
                return Err(anyhow!("ffmpeg type 'gpu' requires a 'gpu' codec name"));
            }
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            validate_device_name(&device.name)?;
            if !seen.insert(device.name.as_str()) {
                return Err(anyhow!("duplicate device name '{}'", device.name));
            }
            if device.ws_host.is_empty() {
                return Err(anyhow!("device '{}' has an empty wsHost", device.name));
            }
            if device.size_mb == 0 && !device.stream_only {
                return Err(anyhow!(
                    "device '{}' must have a segment size greater than zero",
                    device.name
                ));
            }
        }
        Ok(())
    }
}

fn validate_device_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("device name must not be empty"));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(anyhow!(
            "device name '{}' must be a single path component",
            name
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<RecorderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "video": [
            { "wsHost": "10.0.0.5:8443", "paramMsg": "abc", "name": "gate", "size": 64, "count": 7 }
        ]
    }"#;

    #[test]
    fn defaults_fill_missing_sections() -> Result<()> {
        let cfg = RecorderConfig::from_json(MINIMAL)?;
        assert_eq!(cfg.storage_root, PathBuf::from("./"));
        assert_eq!(cfg.sleep, Duration::from_secs(30));
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(2));
        assert_eq!(cfg.hub.stream_capacity, 100);
        assert_eq!(cfg.encoder.exec, "ffmpeg");
        assert_eq!(cfg.encoder.mode, EncodeMode::Copy);
        assert_eq!(cfg.retention_layout, RetentionLayout::Folders);
        assert!(cfg.api_addr.is_none());

        let device = &cfg.devices[0];
        assert!(!device.distribute);
        assert_eq!(device.endpoint(), "wss://10.0.0.5:8443/h5player/live");
        assert_eq!(device.auth_message(), "_paramStr_=abc");
        assert_eq!(device.segment_threshold(), 64 * 1_048_576);
        Ok(())
    }

    #[test]
    fn device_distribute_overrides_global_flag() -> Result<()> {
        let cfg = RecorderConfig::from_json(
            r#"{
                "distribution": { "enabled": true },
                "video": [
                    { "wsHost": "a", "name": "one", "size": 1, "count": 1 },
                    { "wsHost": "b", "name": "two", "size": 1, "count": 1, "distribute": false }
                ]
            }"#,
        )?;
        assert!(cfg.devices[0].distribute);
        assert!(!cfg.devices[1].distribute);
        Ok(())
    }

    #[test]
    fn rejects_duplicate_and_unsafe_names() {
        let dup = r#"{ "video": [
            { "wsHost": "a", "name": "cam", "size": 1, "count": 1 },
            { "wsHost": "b", "name": "cam", "size": 1, "count": 1 }
        ] }"#;
        assert!(RecorderConfig::from_json(dup).is_err());

        let traversal = r#"{ "video": [
            { "wsHost": "a", "name": "../etc", "size": 1, "count": 1 }
        ] }"#;
        assert!(RecorderConfig::from_json(traversal).is_err());
    }

    #[test]
    fn rejects_zero_sleep_and_unknown_ffmpeg_type() {
        let zero_sleep = r#"{ "sleep": 0, "video": [
            { "wsHost": "a", "name": "cam", "size": 1, "count": 1 }
        ] }"#;
        assert!(RecorderConfig::from_json(zero_sleep).is_err());

        let bad_mode = r#"{ "ffmpeg": { "type": "quantum" }, "video": [
            { "wsHost": "a", "name": "cam", "size": 1, "count": 1 }
        ] }"#;
        assert!(RecorderConfig::from_json(bad_mode).is_err());
    }

    #[test]
    fn gpu_mode_requires_codec_for_transcoding_devices() {
        let raw = r#"{ "ffmpeg": { "type": "gpu" }, "video": [
            { "wsHost": "a", "name": "cam", "size": 1, "count": 1, "transcode": true }
        ] }"#;
        assert!(RecorderConfig::from_json(raw).is_err());
    }
}
