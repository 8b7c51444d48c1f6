//! One video conversion, end to end: validate, probe, load weights, decode,
//! interpolate, encode, clean up.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AppConfig, EncodingConfig};
use crate::error::SlomoError;
use crate::inference::{load_checkpoint, InferenceSettings, LoadedCheckpoint};
use crate::media::{self, MediaTools, NumberedFrames, NumberedImageSink, VideoProbe};
use crate::pipeline::{
    Capabilities, PipelineDriver, PipelineOptions, RunSummary, MAX_SLOMO_FACTOR,
};
use crate::scratch::{with_scratch, ScratchWorkspace};
use crate::tensor::working_dims;
use crate::warp::BackWarp;

#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub video: PathBuf,
    pub checkpoint: PathBuf,
    pub output: PathBuf,
    /// Frame rate of the encoded output.
    pub fps: f64,
    pub slomo_factor: u32,
    pub batch_size: usize,
}

impl JobConfig {
    /// Reject the first invalid setting, checking sf, batch size, fps, then paths.
    pub fn validate(&self) -> Result<(), SlomoError> {
        let invalid = |msg: String| -> Result<(), SlomoError> {
            Err(SlomoError::InvalidConfiguration(msg))
        };
        if self.slomo_factor < 2 {
            return invalid(format!("sf must be >= 2, got {}", self.slomo_factor));
        }
        if self.slomo_factor > MAX_SLOMO_FACTOR {
            return invalid(format!(
                "sf must be <= {MAX_SLOMO_FACTOR}, got {}",
                self.slomo_factor
            ));
        }
        if self.batch_size < 1 {
            return invalid(format!("batch size must be >= 1, got {}", self.batch_size));
        }
        if !self.fps.is_finite() || self.fps < 1.0 {
            return invalid(format!("fps must be >= 1, got {}", self.fps));
        }
        for (name, path) in [
            ("video", &self.video),
            ("checkpoint", &self.checkpoint),
            ("output", &self.output),
        ] {
            if path.as_os_str().is_empty() {
                return invalid(format!("{name} path is empty"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub probe: VideoProbe,
    pub summary: RunSummary,
    pub output: PathBuf,
}

/// Convert `job.video` into a slowed-down `job.output`.
///
/// Nothing touches the filesystem before the job and `config` validate, and the checkpoint is
/// loaded before any scratch state exists. The scratch workspace is removed on every
/// exit path.
pub fn run_job(
    job: &JobConfig,
    config: &AppConfig,
    cancel: Option<CancellationToken>,
) -> Result<JobReport> {
    job.validate()?;
    config.validate()?;
    let started = Instant::now();
    let tools = MediaTools::new(config.paths.ffmpeg_dir.clone());

    let probe = media::probe_video(&tools, &job.video)?;
    let working = working_dims(probe.dims, config.inference.working_align);
    info!(
        video = %job.video.display(),
        dims = %probe.dims,
        working = %working,
        source_fps = probe.fps,
        frames = ?probe.frame_count,
        "input probed"
    );

    let settings = InferenceSettings {
        backend: config.inference.backend,
        trt_cache_dir: config.paths.trt_cache_dir.clone(),
    };
    let checkpoint = load_checkpoint(&job.checkpoint, &settings, working)?;

    let summary = with_scratch(&config.paths.scratch_root, |workspace| {
        convert_in(job, config, &tools, workspace, &checkpoint, cancel)
    })?;

    info!(
        output = %job.output.display(),
        frames = summary.output_frames,
        total_ms = started.elapsed().as_millis() as u64,
        "conversion finished"
    );
    Ok(JobReport {
        probe,
        summary,
        output: job.output.clone(),
    })
}

fn convert_in(
    job: &JobConfig,
    config: &AppConfig,
    tools: &MediaTools,
    workspace: &ScratchWorkspace,
    checkpoint: &LoadedCheckpoint,
    cancel: Option<CancellationToken>,
) -> Result<RunSummary> {
    let encoding = &config.encoding;
    let (source, sink) = decode_into(job, encoding, tools, workspace)?;

    let options = PipelineOptions {
        slomo_factor: job.slomo_factor,
        batch_size: job.batch_size,
        channel_mean: config.inference.channel_mean,
        working_align: config.inference.working_align,
    };
    let capabilities = Capabilities {
        flow: &checkpoint.flow,
        warp: &BackWarp,
        refinement: &checkpoint.refinement,
    };
    let mut driver = PipelineDriver::new(capabilities, options);
    if let Some(cancel) = cancel {
        driver = driver.with_cancellation(cancel);
    }
    let (summary, _sink) = driver.run(&source, sink)?;

    media::encode_video(tools, workspace.output_dir(), job.fps, encoding, &job.output)?;
    Ok(summary)
}

/// Decode the video into `input/` and open the numbered frames plus the `output/` sink.
fn decode_into(
    job: &JobConfig,
    encoding: &EncodingConfig,
    tools: &MediaTools,
    workspace: &ScratchWorkspace,
) -> Result<(NumberedFrames, NumberedImageSink)> {
    media::extract_frames(tools, &job.video, workspace.input_dir(), encoding)?;
    let source = NumberedFrames::open(workspace.input_dir(), &encoding.frame_extension)?;
    let sink = NumberedImageSink::new(
        workspace.output_dir(),
        &encoding.frame_extension,
        encoding.jpeg_quality,
    )?;
    Ok((source, sink))
}
