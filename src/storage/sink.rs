//! Segment sinks: a raw append file, or an external encoder fed over a pipe.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

/// How a segment's bytes reach disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Elementary stream appended verbatim to a `.hevc` file.
    Raw,
    /// Elementary stream piped to an encoder that writes a `.mp4` container.
    Encoder,
}

impl SinkKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Raw => "hevc",
            Self::Encoder => "mp4",
        }
    }
}

/// Codec selection for the piped encoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EncodeMode {
    /// Re-mux only.
    #[default]
    Copy,
    /// Software H.264 encode.
    Cpu,
    /// Hardware encode with the named codec (e.g. `h264_nvenc`).
    Gpu(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderSettings {
    pub exec: String,
    pub mode: EncodeMode,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            exec: "ffmpeg".to_string(),
            mode: EncodeMode::Copy,
        }
    }
}

impl EncoderSettings {
    /// Arguments for an encoder reading HEVC on stdin and writing `output`.
    pub fn pipe_args(&self, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "hevc",
            "-i",
            "pipe:0",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        match &self.mode {
            EncodeMode::Copy => args.extend(["-c".to_string(), "copy".to_string()]),
            EncodeMode::Cpu => args.extend(["-c:v".to_string(), "libx264".to_string()]),
            EncodeMode::Gpu(codec) => args.extend(["-c:v".to_string(), codec.clone()]),
        }
        args.push("-y".to_string());
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

pub(crate) enum SegmentSink {
    File(File),
    Encoder {
        child: Child,
        stdin: Option<ChildStdin>,
    },
}

impl SegmentSink {
    pub(crate) fn open(kind: SinkKind, path: &Path, encoder: &EncoderSettings) -> Result<Self> {
        match kind {
            SinkKind::Raw => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open segment {}", path.display()))?;
                Ok(Self::File(file))
            }
            SinkKind::Encoder => {
                let mut child = Command::new(&encoder.exec)
                    .args(encoder.pipe_args(path))
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::inherit())
                    .spawn()
                    .with_context(|| {
                        format!(
                            "failed to spawn encoder '{}' for {}",
                            encoder.exec,
                            path.display()
                        )
                    })?;
                let stdin = child.stdin.take();
                if stdin.is_none() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(anyhow!("encoder for {} has no stdin pipe", path.display()));
                }
                Ok(Self::Encoder { child, stdin })
            }
        }
    }

    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::File(file) => file.write_all(bytes).context("segment write failed"),
            Self::Encoder { stdin, .. } => stdin
                .as_mut()
                .ok_or_else(|| anyhow!("encoder pipe already closed"))?
                .write_all(bytes)
                .context("encoder pipe write failed"),
        }
    }

    /// Flush and release the sink. For the encoder this closes its stdin and
    /// waits for the process to exit.
    pub(crate) fn finish(self) -> Result<()> {
        match self {
            Self::File(mut file) => file.flush().context("segment flush failed"),
            Self::Encoder { mut child, stdin } => {
                drop(stdin);
                let status = child.wait().context("failed to wait for encoder")?;
                if !status.success() {
                    return Err(anyhow!("encoder exited with {}", status));
                }
                Ok(())
            }
        }
    }
}
