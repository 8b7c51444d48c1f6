//! Time-indexed frame synthesis between two endpoint batches.
//!
//! For a timestep `t` the endpoint flows are blended into flows from `t` back to
//! each endpoint, both endpoints are warped to `t`, the refinement network
//! corrects the flows and predicts visibility, and the re-warped endpoints are
//! combined with an occlusion-aware weighted average.

use anyhow::{anyhow, ensure, Result};
use ndarray::{Array4, ArrayView4, Zip};
use tracing::trace;

use crate::capability::{RefinementEstimator, RefinementInputs, WarpOperator};
use crate::tensor::TensorLayout;
use crate::types::{FlowPair, Frame};

/// Below this, the visibility-weighted denominator falls back to the plain temporal average.
pub const DENOMINATOR_EPSILON: f32 = 1e-6;

/// Quadratic flow coefficients for one timestep.
///
/// `F_t_0 = c0 * F_0_1 + c1 * F_1_0` and `F_t_1 = c2 * F_0_1 + c3 * F_1_0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub t: f32,
    pub c0: f32,
    pub c1: f32,
    pub c2: f32,
    pub c3: f32,
}

impl BlendWeights {
    pub fn at(t: f32) -> Self {
        let temp = -t * (1.0 - t);
        Self {
            t,
            c0: temp,
            c1: t * t,
            c2: (1.0 - t) * (1.0 - t),
            c3: temp,
        }
    }

    /// `(w0, w1)`: bias toward the nearer endpoint.
    pub fn temporal(&self) -> (f32, f32) {
        (1.0 - self.t, self.t)
    }

    pub fn flow_t_0(&self, flows: &FlowPair) -> Array4<f32> {
        &flows.forward * self.c0 + &flows.backward * self.c1
    }

    pub fn flow_t_1(&self, flows: &FlowPair) -> Array4<f32> {
        &flows.forward * self.c2 + &flows.backward * self.c3
    }
}

/// Intermediate positions for slomo factor `sf`: `(k, k / sf)` for `k = 1..sf-1`.
pub fn timesteps(slomo_factor: u32) -> impl Iterator<Item = (u32, f32)> {
    (1..slomo_factor).map(move |k| (k, (f64::from(k) / f64::from(slomo_factor)) as f32))
}

/// Occlusion-aware average of two warped samples.
pub fn blend_pixel(w0: f32, w1: f32, visibility_t_0: f32, warped0: f32, warped1: f32) -> f32 {
    let visibility_t_1 = 1.0 - visibility_t_0;
    let denominator = w0 * visibility_t_0 + w1 * visibility_t_1;
    // Also catches NaN visibility.
    if denominator >= DENOMINATOR_EPSILON {
        (w0 * visibility_t_0 * warped0 + w1 * visibility_t_1 * warped1) / denominator
    } else {
        w0 * warped0 + w1 * warped1
    }
}

pub struct InterpolationEngine<'a> {
    warp: &'a dyn WarpOperator,
    refinement: &'a dyn RefinementEstimator,
}

impl<'a> InterpolationEngine<'a> {
    pub fn new(warp: &'a dyn WarpOperator, refinement: &'a dyn RefinementEstimator) -> Self {
        Self { warp, refinement }
    }

    /// Synthesize the batch of frames at time `t` in working-resolution tensor space.
    pub fn interpolate(
        &self,
        frame0: ArrayView4<'_, f32>,
        frame1: ArrayView4<'_, f32>,
        flows: &FlowPair,
        t: f32,
    ) -> Result<Array4<f32>> {
        ensure!(t > 0.0 && t < 1.0, "timestep {t} is outside (0, 1)");
        ensure!(
            frame0.shape() == frame1.shape(),
            "endpoint shapes differ: {:?} vs {:?}",
            frame0.shape(),
            frame1.shape()
        );
        let (batch, _, height, width) = frame0.dim();
        flows.validate(batch, height, width)?;

        let weights = BlendWeights::at(t);
        let flow_t_0 = weights.flow_t_0(flows);
        let flow_t_1 = weights.flow_t_1(flows);

        let warped0 = self.warp.warp(frame0, flow_t_0.view())?;
        let warped1 = self.warp.warp(frame1, flow_t_1.view())?;

        let refinement = self.refinement.refine(&RefinementInputs {
            frame0,
            frame1,
            flow_0_1: flows.forward.view(),
            flow_1_0: flows.backward.view(),
            flow_t_0: flow_t_0.view(),
            flow_t_1: flow_t_1.view(),
            warped0: warped0.view(),
            warped1: warped1.view(),
        })?;
        refinement.validate(batch, height, width)?;

        let refined_t_0 = flow_t_0 + &refinement.delta_t_0;
        let refined_t_1 = flow_t_1 + &refinement.delta_t_1;
        let warped0 = self.warp.warp(frame0, refined_t_0.view())?;
        let warped1 = self.warp.warp(frame1, refined_t_1.view())?;

        let visibility = refinement
            .visibility_t_0
            .broadcast(warped0.raw_dim())
            .ok_or_else(|| anyhow!("visibility map does not broadcast over {:?}", warped0.shape()))?;

        let (w0, w1) = weights.temporal();
        let mut blended = Array4::<f32>::zeros(warped0.raw_dim());
        Zip::from(&mut blended)
            .and(&warped0)
            .and(&warped1)
            .and(&visibility)
            .for_each(|out, &g0, &g1, &v| *out = blend_pixel(w0, w1, v, g0, g1));

        trace!(t, batch, "synthesized intermediate batch");
        Ok(blended)
    }

    /// [`interpolate`](Self::interpolate), then convert back to frames at the original resolution.
    pub fn interpolate_frames(
        &self,
        layout: &TensorLayout,
        frame0: ArrayView4<'_, f32>,
        frame1: ArrayView4<'_, f32>,
        flows: &FlowPair,
        t: f32,
    ) -> Result<Vec<Frame>> {
        let blended = self.interpolate(frame0, frame1, flows, t)?;
        layout.batch_to_frames(blended.view())
    }
}
