//! Offline conversion of recorded `.hevc` segments into playable containers.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use walkdir::WalkDir;

/// Output quality. `Copy` re-muxes without re-encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Quality {
    #[default]
    Copy,
    High,
    Medium,
    Low,
}

impl Quality {
    fn codec_args(self) -> &'static [&'static str] {
        match self {
            Self::Copy => &["-c", "copy"],
            Self::High => &["-c:v", "libx264", "-crf", "18", "-preset", "slow"],
            Self::Medium => &["-c:v", "libx264", "-crf", "23", "-preset", "medium"],
            Self::Low => &["-c:v", "libx264", "-crf", "28", "-preset", "fast"],
        }
    }
}

impl FromStr for Quality {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "copy" => Ok(Self::Copy),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(anyhow!(
                "unknown quality '{}': expected copy, high, medium or low",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub exec: String,
    pub quality: Quality,
    /// Output container extension, without the dot.
    pub output_ext: String,
    pub delete_original: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            exec: "ffmpeg".to_string(),
            quality: Quality::Copy,
            output_ext: "mp4".to_string(),
            delete_original: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConvertReport {
    pub converted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// First line of `{exec} -version`. Fails when the encoder cannot be run.
pub fn encoder_version(exec: &str) -> Result<String> {
    let output = Command::new(exec)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("encoder '{exec}' not found"))?;
    if !output.status.success() {
        return Err(anyhow!("encoder '{}' exited with {}", exec, output.status));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

/// Every `.hevc` file under `dir`, sorted by path.
pub fn find_hevc_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("hevc"))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

pub fn output_path(input: &Path, opts: &ConvertOptions) -> PathBuf {
    input.with_extension(&opts.output_ext)
}

pub fn convert_args(input: &Path, output: &Path, quality: Quality) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-y".to_string(),
    ];
    args.extend(quality.codec_args().iter().map(|arg| arg.to_string()));
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Convert one file, returning the output path.
pub fn convert_file(input: &Path, opts: &ConvertOptions) -> Result<PathBuf> {
    let output = output_path(input, opts);
    let result = Command::new(&opts.exec)
        .args(convert_args(input, &output, opts.quality))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to run '{}'", opts.exec))?;
    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(anyhow!(
            "{} exited with {}: {}",
            opts.exec,
            result.status,
            stderr.trim()
        ));
    }
    if opts.delete_original {
        match std::fs::remove_file(input) {
            Ok(()) => log::info!("deleted original {}", input.display()),
            Err(err) => log::warn!("failed to delete {}: {}", input.display(), err),
        }
    }
    Ok(output)
}

/// Convert every `.hevc` file under `dir`. A failed file is logged and
/// counted; the batch continues.
pub fn batch_convert(dir: &Path, opts: &ConvertOptions) -> Result<ConvertReport> {
    if !dir.is_dir() {
        return Err(anyhow!("{} is not a directory", dir.display()));
    }
    let version = encoder_version(&opts.exec)?;
    log::info!("converting .hevc files under {} with {}", dir.display(), version);

    let mut report = ConvertReport::default();
    for input in find_hevc_files(dir) {
        match convert_file(&input, opts) {
            Ok(output) => {
                log::info!("converted {} -> {}", input.display(), output.display());
                report.converted.push(output);
            }
            Err(err) => {
                log::warn!("conversion of {} failed: {:#}", input.display(), err);
                report.failed.push(input);
            }
        }
    }
    log::info!(
        "conversion finished: {} converted, {} failed",
        report.converted.len(),
        report.failed.len()
    );
    Ok(report)
}
