use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::MediaTools;
use crate::error::SlomoError;
use crate::types::FrameDims;

const FALLBACK_FPS: f64 = 23.976;

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

/// What the job needs to know about the input before decoding it.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub dims: FrameDims,
    pub fps: f64,
    pub codec: String,
    /// Container-reported frame count; many formats omit it.
    pub frame_count: Option<u64>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => s.parse().ok(),
    }
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

/// The default, non-cover-art video stream with the lowest index.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            (
                disposition_flag(stream, "attached_pic"),
                !disposition_flag(stream, "default"),
                stream.index,
            )
        })
}

/// Interpret ffprobe's JSON for `video`.
pub fn parse_probe(json: &[u8], video: &Path) -> Result<VideoProbe> {
    let probe: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| SlomoError::decoding(video, format!("unreadable ffprobe output: {e}")))?;

    let stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| SlomoError::decoding(video, "no video stream found"))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(SlomoError::decoding(video, "video stream has no dimensions").into());
    };
    if width == 0 || height == 0 {
        return Err(SlomoError::decoding(video, format!("video stream is {width}x{height}")).into());
    }

    let fps_str = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = match parse_frame_rate(fps_str) {
        Some(fps) if fps > 0.0 => fps,
        _ => {
            warn!("could not determine frame rate (got {fps_str}), assuming {FALLBACK_FPS}");
            FALLBACK_FPS
        }
    };

    Ok(VideoProbe {
        dims: FrameDims::new(width, height),
        fps,
        codec: stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        frame_count: stream.nb_frames.as_deref().and_then(|n| n.parse().ok()),
    })
}

/// Run ffprobe on `video`. Any failure is a [`SlomoError::DecodingFailure`].
pub fn probe_video(tools: &MediaTools, video: &Path) -> Result<VideoProbe> {
    if !video.is_file() {
        return Err(SlomoError::decoding(video, "no such file").into());
    }

    let output = tools
        .command("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
        ])
        .arg(video)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")
        .map_err(|e| SlomoError::decoding(video, format!("{e:#}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SlomoError::decoding(
            video,
            format!("ffprobe exited with {}: {}", output.status, stderr.trim()),
        )
        .into());
    }

    let probe = parse_probe(&output.stdout, video)?;
    debug!(
        video = %video.display(),
        dims = %probe.dims,
        fps = probe.fps,
        codec = %probe.codec,
        frames = ?probe.frame_count,
        "probed input"
    );
    Ok(probe)
}
