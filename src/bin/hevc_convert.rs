//! hevc_convert - convert recorded `.hevc` segments into playable containers.
//!
//! Walks a directory recursively and runs the encoder once per file. Files
//! that fail are reported and left in place.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use live_recorder::convert::{batch_convert, ConvertOptions, Quality};

#[derive(Parser, Debug)]
#[command(
    name = "hevc_convert",
    about = "Convert recorded .hevc segments into a playable container"
)]
struct Args {
    /// Directory to scan recursively
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Output quality (copy|high|medium|low)
    #[arg(long, default_value = "copy", value_name = "QUALITY")]
    quality: Quality,

    /// Output container extension
    #[arg(long, default_value = "mp4", value_name = "EXT")]
    format: String,

    /// Delete each original after a successful conversion
    #[arg(long)]
    delete_original: bool,

    /// Encoder executable
    #[arg(long, env = "RECORDER_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let opts = ConvertOptions {
        exec: args.ffmpeg,
        quality: args.quality,
        output_ext: args.format.trim_start_matches('.').to_string(),
        delete_original: args.delete_original,
    };
    let report = batch_convert(&args.dir, &opts)?;
    println!(
        "converted: {}, failed: {}",
        report.converted.len(),
        report.failed.len()
    );
    for path in &report.failed {
        println!("  failed: {}", path.display());
    }
    if !report.failed.is_empty() {
        return Err(anyhow!("{} file(s) failed to convert", report.failed.len()));
    }
    Ok(())
}
