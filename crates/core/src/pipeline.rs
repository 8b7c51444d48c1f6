//! Batch driver: walks frame pairs in order, estimates flow once per batch, synthesizes every
//! intermediate timestep and hands all frames to the [`OutputSequencer`].

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array3, ArrayView3};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capability::{FlowEstimator, RefinementEstimator, WarpOperator};
use crate::error::SlomoError;
use crate::interpolation::{timesteps, InterpolationEngine};
use crate::sequencer::{total_output_frames, FrameSink, OutputSequencer};
use crate::tensor::{TensorLayout, DEFAULT_CHANNEL_MEAN, DEFAULT_WORKING_ALIGN};
use crate::types::{Frame, FrameDims};

/// Densely numbered original frames `1..=frame_count`, loaded on demand.
pub trait FrameSource {
    fn frame_count(&self) -> usize;

    fn dims(&self) -> FrameDims;

    fn load(&self, number: usize) -> Result<Frame>;

    /// File the frame was decoded from, if it lives on disk.
    fn origin(&self, _number: usize) -> Option<&Path> {
        None
    }
}

impl FrameSource for Vec<Frame> {
    fn frame_count(&self) -> usize {
        self.len()
    }

    fn dims(&self) -> FrameDims {
        self.first()
            .map(Frame::dims)
            .unwrap_or(FrameDims::new(0, 0))
    }

    fn load(&self, number: usize) -> Result<Frame> {
        number
            .checked_sub(1)
            .and_then(|i| self.get(i))
            .cloned()
            .ok_or_else(|| anyhow!("frame {number} out of range 1..={}", self.len()))
    }
}

/// The three network capabilities, borrowed for the duration of a run.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub flow: &'a dyn FlowEstimator,
    pub warp: &'a dyn WarpOperator,
    pub refinement: &'a dyn RefinementEstimator,
}

/// Largest accepted slomo factor. Keeps every `k / sf` strictly below 1.0 in `f32`.
pub const MAX_SLOMO_FACTOR: u32 = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub slomo_factor: u32,
    pub batch_size: usize,
    pub channel_mean: [f32; 3],
    pub working_align: u32,
}

impl PipelineOptions {
    pub fn new(slomo_factor: u32, batch_size: usize) -> Self {
        Self {
            slomo_factor,
            batch_size,
            channel_mean: DEFAULT_CHANNEL_MEAN,
            working_align: DEFAULT_WORKING_ALIGN,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_SLOMO_FACTOR).contains(&self.slomo_factor) {
            return Err(SlomoError::InvalidConfiguration(format!(
                "slomo factor must be in 2..={MAX_SLOMO_FACTOR}, got {}",
                self.slomo_factor
            ))
            .into());
        }
        if self.batch_size < 1 {
            return Err(SlomoError::InvalidConfiguration(format!(
                "batch size must be >= 1, got {}",
                self.batch_size
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub input_frames: usize,
    pub output_frames: u64,
    pub pairs: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

pub struct PipelineDriver<'a> {
    capabilities: Capabilities<'a>,
    options: PipelineOptions,
    cancel: Option<CancellationToken>,
}

impl<'a> PipelineDriver<'a> {
    pub fn new(capabilities: Capabilities<'a>, options: PipelineOptions) -> Self {
        Self {
            capabilities,
            options,
            cancel: None,
        }
    }

    /// Stop between batches once `cancel` is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                return Err(SlomoError::Cancelled.into());
            }
        }
        Ok(())
    }

    /// Run every pair of `source` through the engine and sequence the results into `sink`.
    pub fn run<Src, S>(&self, source: &Src, sink: S) -> Result<(RunSummary, S)>
    where
        Src: FrameSource + ?Sized,
        S: FrameSink,
    {
        self.options.validate()?;
        let sf = self.options.slomo_factor;
        let batch_size = self.options.batch_size;
        let frame_count = source.frame_count();
        if frame_count < 2 {
            bail!("need at least 2 frames to interpolate, got {frame_count}");
        }

        let layout = TensorLayout::new(
            source.dims(),
            self.options.working_align,
            self.options.channel_mean,
        );
        let engine =
            InterpolationEngine::new(self.capabilities.warp, self.capabilities.refinement);
        let mut sequencer = OutputSequencer::new(sink, frame_count, sf)?;
        let pairs = frame_count - 1;

        info!(
            frames = frame_count,
            pairs,
            sf,
            batch_size,
            original = %layout.original,
            working = %layout.working,
            output_frames = total_output_frames(frame_count, sf),
            "starting interpolation"
        );

        let started = Instant::now();
        let mut carried: Option<(Frame, Array3<f32>)> = None;
        let mut pair = 1usize;
        let mut batches = 0usize;

        while pair <= pairs {
            self.check_cancelled()?;
            let batch_started = Instant::now();
            let in_batch = batch_size.min(pairs - pair + 1);

            // Frames `pair ..= pair + in_batch`; the first one is usually carried over.
            let mut frames = Vec::with_capacity(in_batch + 1);
            let mut tensors = Vec::with_capacity(in_batch + 1);
            if let Some((frame, tensor)) = carried.take() {
                frames.push(frame);
                tensors.push(tensor);
            }
            for number in pair + frames.len()..=pair + in_batch {
                let frame = source
                    .load(number)
                    .with_context(|| format!("failed to load frame {number}"))?;
                tensors.push(
                    layout
                        .frame_to_chw(&frame)
                        .with_context(|| format!("frame {number}"))?,
                );
                frames.push(frame);
            }

            let views: Vec<ArrayView3<'_, f32>> = tensors.iter().map(|t| t.view()).collect();
            let batch0 = layout.stack_batch(&views[..in_batch])?;
            let batch1 = layout.stack_batch(&views[1..])?;

            let flows = self
                .capabilities
                .flow
                .estimate(batch0.view(), batch1.view())
                .with_context(|| format!("flow estimation failed for pairs {pair}..{}", pair + in_batch - 1))?;

            for (slot, frame) in frames[..in_batch].iter().enumerate() {
                let number = pair + slot;
                sequencer.emit_endpoint(number, source.origin(number), frame)?;
            }

            for (step, t) in timesteps(sf) {
                let synthesized = engine
                    .interpolate_frames(&layout, batch0.view(), batch1.view(), &flows, t)
                    .with_context(|| format!("interpolation failed at t={t} for pairs starting at {pair}"))?;
                for (slot, frame) in synthesized.iter().enumerate() {
                    sequencer.emit_synthesized(pair + slot, step, frame)?;
                }
            }

            drop(views);
            carried = frames.pop().zip(tensors.pop());
            pair += in_batch;
            batches += 1;

            info!(
                pairs_done = pair - 1,
                pairs_total = pairs,
                written = sequencer.written(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch {batches} complete"
            );
            debug!(
                batch = batches,
                size = in_batch,
                batch_ms = batch_started.elapsed().as_millis() as u64,
                "batch timing"
            );
        }

        let (last, _) = carried.ok_or_else(|| anyhow!("no frames were processed"))?;
        sequencer.emit_closing(source.origin(frame_count), &last)?;
        let output_frames = sequencer.written();
        let sink = sequencer.finish()?;

        let summary = RunSummary {
            input_frames: frame_count,
            output_frames,
            pairs,
            batches,
            elapsed: started.elapsed(),
        };
        info!(
            output_frames,
            batches,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "interpolation complete"
        );
        Ok((summary, sink))
    }
}
