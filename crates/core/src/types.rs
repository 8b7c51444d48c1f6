use std::path::Path;

use anyhow::{bail, Result};
use ndarray::Array4;

/// Spatial size shared by every frame of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for FrameDims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Packed 8-bit RGB image at its original resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            bail!(
                "Data length mismatch: expected {} ({}x{}x3), got {}",
                expected,
                width,
                height,
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Single-colour frame, mostly for tests and padding.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = vec![0u8; width as usize * height as usize * 3];
        for pixel in data.chunks_exact_mut(3) {
            pixel.copy_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn dims(&self) -> FrameDims {
        FrameDims::new(self.width, self.height)
    }
}

/// Forward (`F_0_1`) and backward (`F_1_0`) flow fields of a batch of frame pairs,
/// each shaped `[B, 2, H, W]` at working resolution.
///
/// Computed once per pair and shared read-only by every intermediate timestep.
#[derive(Debug, Clone)]
pub struct FlowPair {
    pub forward: Array4<f32>,
    pub backward: Array4<f32>,
}

/// Where a sequenced frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind<'a> {
    /// Copy of original frame `number` (1-based); `origin` is its decoded file, when known.
    Original {
        number: usize,
        origin: Option<&'a Path>,
    },
    /// Frame synthesized for pair `pair` at timestep `step / sf`.
    Synthesized { pair: usize, step: u32 },
}

/// A finished frame together with its final, globally unique sequence index.
#[derive(Debug, Clone, Copy)]
pub struct OutputFrame<'a> {
    pub index: u64,
    pub kind: OutputKind<'a>,
    pub frame: &'a Frame,
}
