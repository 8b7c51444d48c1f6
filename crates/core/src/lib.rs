//! Core crate for slow-motion video conversion: flow-based frame interpolation,
//! gap-free output sequencing, and the ffmpeg/ONNX adapters around them.

pub mod capability;
pub mod config;
pub mod error;
pub mod inference;
pub mod interpolation;
pub mod job;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod runtime;
pub mod scratch;
pub mod sequencer;
pub mod tensor;
pub mod types;
pub mod warp;

pub use error::SlomoError;
pub use job::{run_job, JobConfig, JobReport};
