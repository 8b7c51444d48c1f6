//! Network capabilities used by the interpolation engine.
//!
//! Flow estimation, backward warping and refinement are modelled as stateless
//! calls over NCHW tensors. Weight loading happens once, up front, in
//! [`checkpoint`](crate::inference::checkpoint); the engine never sees a model.
//!
//! Closures implement every trait, so tests can drive the pipeline with
//! deterministic stand-ins instead of ONNX sessions.

use anyhow::{ensure, Result};
use ndarray::{Array4, ArrayView4};

use crate::types::FlowPair;

/// Estimates forward and backward flow between two batches of frames.
pub trait FlowEstimator: Send {
    fn estimate(&self, frame0: ArrayView4<'_, f32>, frame1: ArrayView4<'_, f32>)
        -> Result<FlowPair>;
}

impl<F> FlowEstimator for F
where
    F: Fn(ArrayView4<'_, f32>, ArrayView4<'_, f32>) -> Result<FlowPair> + Send,
{
    fn estimate(
        &self,
        frame0: ArrayView4<'_, f32>,
        frame1: ArrayView4<'_, f32>,
    ) -> Result<FlowPair> {
        self(frame0, frame1)
    }
}

/// Resamples `image` (`[B, C, H, W]`) along `flow` (`[B, 2, H, W]`).
pub trait WarpOperator: Send {
    fn warp(&self, image: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

impl<F> WarpOperator for F
where
    F: Fn(ArrayView4<'_, f32>, ArrayView4<'_, f32>) -> Result<Array4<f32>> + Send,
{
    fn warp(&self, image: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        self(image, flow)
    }
}

/// Everything the refinement network looks at for one timestep.
pub struct RefinementInputs<'a> {
    pub frame0: ArrayView4<'a, f32>,
    pub frame1: ArrayView4<'a, f32>,
    pub flow_0_1: ArrayView4<'a, f32>,
    pub flow_1_0: ArrayView4<'a, f32>,
    pub flow_t_0: ArrayView4<'a, f32>,
    pub flow_t_1: ArrayView4<'a, f32>,
    /// `frame0` warped along `flow_t_0`.
    pub warped0: ArrayView4<'a, f32>,
    /// `frame1` warped along `flow_t_1`.
    pub warped1: ArrayView4<'a, f32>,
}

/// Flow corrections and visibility map for one timestep.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub delta_t_0: Array4<f32>,
    pub delta_t_1: Array4<f32>,
    /// `V_t_0` in `[0, 1]`, shaped `[B, 1, H, W]`. `V_t_1` is `1 - V_t_0`.
    pub visibility_t_0: Array4<f32>,
}

impl Refinement {
    /// Checks the result against the batch/spatial shape `[B, _, H, W]` of the inputs.
    pub fn validate(&self, batch: usize, height: usize, width: usize) -> Result<()> {
        let flow_shape = [batch, 2, height, width];
        ensure!(
            self.delta_t_0.shape() == flow_shape,
            "refinement delta_t_0 has shape {:?}, expected {:?}",
            self.delta_t_0.shape(),
            flow_shape
        );
        ensure!(
            self.delta_t_1.shape() == flow_shape,
            "refinement delta_t_1 has shape {:?}, expected {:?}",
            self.delta_t_1.shape(),
            flow_shape
        );
        let vis_shape = [batch, 1, height, width];
        ensure!(
            self.visibility_t_0.shape() == vis_shape,
            "refinement visibility has shape {:?}, expected {:?}",
            self.visibility_t_0.shape(),
            vis_shape
        );
        Ok(())
    }
}

/// Predicts flow corrections and a visibility map from the first-pass estimates.
pub trait RefinementEstimator: Send {
    fn refine(&self, inputs: &RefinementInputs<'_>) -> Result<Refinement>;
}

impl<F> RefinementEstimator for F
where
    F: Fn(&RefinementInputs<'_>) -> Result<Refinement> + Send,
{
    fn refine(&self, inputs: &RefinementInputs<'_>) -> Result<Refinement> {
        self(inputs)
    }
}

impl FlowPair {
    /// Checks both fields are `[B, 2, H, W]`.
    pub fn validate(&self, batch: usize, height: usize, width: usize) -> Result<()> {
        let expected = [batch, 2, height, width];
        ensure!(
            self.forward.shape() == expected,
            "forward flow has shape {:?}, expected {:?}",
            self.forward.shape(),
            expected
        );
        ensure!(
            self.backward.shape() == expected,
            "backward flow has shape {:?}, expected {:?}",
            self.backward.shape(),
            expected
        );
        Ok(())
    }
}
