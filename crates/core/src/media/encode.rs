use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use super::{path_arg, run_ffmpeg, MediaTools, StderrTarget};
use crate::config::EncodingConfig;
use crate::error::SlomoError;

/// ffmpeg arguments that assemble `output_dir/{1,2,...}.{ext}` into `output` at `fps`.
pub fn encode_args(
    output_dir: &Path,
    fps: f64,
    encoding: &EncodingConfig,
    output: &Path,
) -> Vec<String> {
    let pattern = output_dir.join(format!("%d.{}", encoding.frame_extension));
    vec![
        "-nostdin".to_string(),
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-framerate".to_string(),
        fps.to_string(),
        "-start_number".to_string(),
        "1".to_string(),
        "-i".to_string(),
        path_arg(&pattern),
        "-c:v".to_string(),
        encoding.codec.clone(),
        "-crf".to_string(),
        encoding.crf.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        path_arg(output),
    ]
}

/// Encode the sequenced frames into `output`; failures are [`SlomoError::EncodingFailure`].
pub fn encode_video(
    tools: &MediaTools,
    output_dir: &Path,
    fps: f64,
    encoding: &EncodingConfig,
    output: &Path,
) -> Result<()> {
    let started = Instant::now();
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| SlomoError::encoding(output, format!("cannot create directory: {e}")))?;
    }

    let run = run_ffmpeg(
        tools,
        &encode_args(output_dir, fps, encoding, output),
        StderrTarget::Encode,
    )
    .map_err(|e| SlomoError::encoding(output, format!("{e:#}")))?;
    if !run.status.success() {
        return Err(SlomoError::encoding(output, run.failure_reason()).into());
    }

    info!(
        output = %output.display(),
        fps,
        codec = %encoding.codec,
        crf = encoding.crf,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "encoded output video"
    );
    Ok(())
}
