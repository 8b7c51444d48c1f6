use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use super::{path_arg, run_ffmpeg, MediaTools, StderrTarget};
use crate::config::EncodingConfig;
use crate::error::SlomoError;

/// Zero-padded pattern of extracted frames; numbering starts at 1.
pub const DECODE_PATTERN_WIDTH: usize = 6;

pub fn decode_args(video: &Path, input_dir: &Path, encoding: &EncodingConfig) -> Vec<String> {
    let pattern = input_dir.join(format!(
        "%0{DECODE_PATTERN_WIDTH}d.{}",
        encoding.frame_extension
    ));
    let mut args = vec![
        "-nostdin".to_string(),
        "-hide_banner".to_string(),
        "-i".to_string(),
        path_arg(video),
        "-vsync".to_string(),
        "0".to_string(),
    ];
    if is_jpeg(&encoding.frame_extension) {
        args.push("-qscale:v".to_string());
        args.push(encoding.jpeg_qscale.to_string());
    }
    args.push(path_arg(&pattern));
    args
}

pub(crate) fn is_jpeg(extension: &str) -> bool {
    matches!(extension.to_ascii_lowercase().as_str(), "jpg" | "jpeg")
}

/// Extract every frame of `video` into `input_dir` and return how many were written.
///
/// Fewer than two frames leave nothing to interpolate and count as a decoding failure.
pub fn extract_frames(
    tools: &MediaTools,
    video: &Path,
    input_dir: &Path,
    encoding: &EncodingConfig,
) -> Result<usize> {
    let started = Instant::now();
    let run = run_ffmpeg(tools, &decode_args(video, input_dir, encoding), StderrTarget::Decode)
        .map_err(|e| SlomoError::decoding(video, format!("{e:#}")))?;
    if !run.status.success() {
        return Err(SlomoError::decoding(video, run.failure_reason()).into());
    }

    let extracted = fs::read_dir(input_dir)
        .map_err(|e| SlomoError::decoding(video, format!("cannot list frames: {e}")))?
        .flatten()
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&encoding.frame_extension))
        })
        .count();
    if extracted < 2 {
        return Err(SlomoError::decoding(
            video,
            format!("extracted {extracted} frame(s), at least 2 are needed"),
        )
        .into());
    }

    info!(
        frames = extracted,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "extracted frames"
    );
    Ok(extracted)
}
