//! Native backward warp: each output pixel samples its source at `(x + u, y + v)`.
//!
//! Sampling is bilinear with zero padding, which matches `grid_sample` defaults the
//! flow networks were trained with. A zero flow reproduces the input exactly.

use anyhow::{ensure, Result};
use ndarray::{s, Array4, ArrayView2, ArrayView4};

use crate::capability::WarpOperator;

#[derive(Debug, Clone, Copy, Default)]
pub struct BackWarp;

impl WarpOperator for BackWarp {
    fn warp(&self, image: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        backward_warp(image, flow)
    }
}

pub fn backward_warp(image: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
    let (batch, channels, height, width) = image.dim();
    ensure!(
        flow.shape() == [batch, 2, height, width],
        "flow shape {:?} does not match image shape {:?}",
        flow.shape(),
        image.shape()
    );

    let mut output = Array4::<f32>::zeros((batch, channels, height, width));

    for b in 0..batch {
        let u = flow.slice(s![b, 0, .., ..]);
        let v = flow.slice(s![b, 1, .., ..]);
        for c in 0..channels {
            let plane = image.slice(s![b, c, .., ..]);
            let mut out_plane = output.slice_mut(s![b, c, .., ..]);
            for y in 0..height {
                for x in 0..width {
                    let sample_x = x as f32 + u[[y, x]];
                    let sample_y = y as f32 + v[[y, x]];
                    out_plane[[y, x]] = bilinear_sample(&plane, sample_y, sample_x);
                }
            }
        }
    }

    Ok(output)
}

fn bilinear_sample(plane: &ArrayView2<'_, f32>, y: f32, x: f32) -> f32 {
    if !x.is_finite() || !y.is_finite() {
        return 0.0;
    }

    let y0 = y.floor();
    let x0 = x.floor();
    let fy = y - y0;
    let fx = x - x0;
    let y0 = y0 as i64;
    let x0 = x0 as i64;

    let w00 = (1.0 - fx) * (1.0 - fy);
    let w01 = fx * (1.0 - fy);
    let w10 = (1.0 - fx) * fy;
    let w11 = fx * fy;

    let mut value = 0.0;
    for (dy, dx, weight) in [(0, 0, w00), (0, 1, w01), (1, 0, w10), (1, 1, w11)] {
        if weight == 0.0 {
            continue;
        }
        value += weight * pixel_or_zero(plane, y0 + dy, x0 + dx);
    }
    value
}

fn pixel_or_zero(plane: &ArrayView2<'_, f32>, y: i64, x: i64) -> f32 {
    let (height, width) = plane.dim();
    if y < 0 || x < 0 || y >= height as i64 || x >= width as i64 {
        0.0
    } else {
        plane[[y as usize, x as usize]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(height: usize, width: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
            (c * 100 + y * width + x) as f32
        })
    }

    #[test]
    fn test_zero_flow_is_identity() {
        let image = gradient_image(5, 7);
        let flow = Array4::<f32>::zeros((1, 2, 5, 7));
        let warped = BackWarp.warp(image.view(), flow.view()).unwrap();
        assert_eq!(warped, image);
    }

    #[test]
    fn test_integer_shift_samples_neighbour() {
        let image = gradient_image(4, 4);
        let mut flow = Array4::<f32>::zeros((1, 2, 4, 4));
        flow.slice_mut(s![0, 0, .., ..]).fill(1.0);

        let warped = backward_warp(image.view(), flow.view()).unwrap();
        assert_eq!(warped[[0, 0, 2, 1]], image[[0, 0, 2, 2]]);
        assert_eq!(warped[[0, 1, 0, 0]], image[[0, 1, 0, 1]]);
        // Sampling past the right edge reads zeros.
        assert_eq!(warped[[0, 0, 2, 3]], 0.0);
    }

    #[test]
    fn test_half_pixel_shift_averages() {
        let image = gradient_image(2, 4);
        let mut flow = Array4::<f32>::zeros((1, 2, 2, 4));
        flow.slice_mut(s![0, 0, .., ..]).fill(0.5);

        let warped = backward_warp(image.view(), flow.view()).unwrap();
        let expected = (image[[0, 2, 1, 1]] + image[[0, 2, 1, 2]]) / 2.0;
        assert!((warped[[0, 2, 1, 1]] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_vertical_flow_uses_second_channel() {
        let image = gradient_image(4, 3);
        let mut flow = Array4::<f32>::zeros((1, 2, 4, 3));
        flow.slice_mut(s![0, 1, .., ..]).fill(-1.0);

        let warped = backward_warp(image.view(), flow.view()).unwrap();
        assert_eq!(warped[[0, 0, 3, 1]], image[[0, 0, 2, 1]]);
        assert_eq!(warped[[0, 0, 0, 1]], 0.0);
    }

    #[test]
    fn test_non_finite_flow_samples_zero() {
        let image = gradient_image(2, 2);
        let mut flow = Array4::<f32>::zeros((1, 2, 2, 2));
        flow[[0, 0, 0, 0]] = f32::NAN;
        let warped = backward_warp(image.view(), flow.view()).unwrap();
        assert_eq!(warped[[0, 0, 0, 0]], 0.0);
        assert_eq!(warped[[0, 0, 1, 1]], image[[0, 0, 1, 1]]);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let image = gradient_image(4, 4);
        let flow = Array4::<f32>::zeros((1, 2, 4, 5));
        let err = backward_warp(image.view(), flow.view()).unwrap_err();
        assert!(err.to_string().contains("does not match image shape"));
    }
}
