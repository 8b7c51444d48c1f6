//! RGB8 frames ↔ NCHW `f32` tensors at the networks' working resolution.
//!
//! The networks need sides that are multiples of the alignment (32 for the
//! UNet checkpoints), so frames are bilinearly resized down to the nearest
//! aligned size on the way in and back up to the original size on the way out.

use anyhow::{bail, ensure, Result};
use ndarray::{s, stack, Array3, Array4, ArrayView3, ArrayView4, Axis};

use crate::types::{Frame, FrameDims};

pub const DEFAULT_WORKING_ALIGN: u32 = 32;
pub const DEFAULT_CHANNEL_MEAN: [f32; 3] = [0.429, 0.431, 0.397];

/// Resolution and normalization shared by every tensor of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLayout {
    pub original: FrameDims,
    pub working: FrameDims,
    pub channel_mean: [f32; 3],
}

impl TensorLayout {
    pub fn new(original: FrameDims, align: u32, channel_mean: [f32; 3]) -> Self {
        Self {
            original,
            working: working_dims(original, align),
            channel_mean,
        }
    }

    /// Resize to working resolution, scale to `[0,1]`, subtract the channel mean.
    pub fn frame_to_chw(&self, frame: &Frame) -> Result<Array3<f32>> {
        if frame.dims() != self.original {
            bail!(
                "frame is {} but the run was configured for {}",
                frame.dims(),
                self.original
            );
        }
        ensure!(
            frame.data.len() == self.original.pixel_count() * 3,
            "Data length mismatch: expected {}, got {}",
            self.original.pixel_count() * 3,
            frame.data.len()
        );

        let w = self.working.width as usize;
        let h = self.working.height as usize;
        let resized;
        let rgb: &[u8] = if self.working == self.original {
            &frame.data
        } else {
            resized = resize_bilinear(
                &frame.data,
                self.original.width as usize,
                self.original.height as usize,
                w,
                h,
            );
            &resized
        };

        let hw = h * w;
        let mut planes = vec![0.0f32; 3 * hw];
        for (i, pixel) in rgb.chunks_exact(3).enumerate() {
            planes[i] = pixel[0] as f32 / 255.0 - self.channel_mean[0];
            planes[hw + i] = pixel[1] as f32 / 255.0 - self.channel_mean[1];
            planes[2 * hw + i] = pixel[2] as f32 / 255.0 - self.channel_mean[2];
        }

        Ok(Array3::from_shape_vec((3, h, w), planes)?)
    }

    /// Stack per-frame CHW tensors into one `[B, 3, H, W]` batch.
    pub fn stack_batch(&self, frames: &[ArrayView3<'_, f32>]) -> Result<Array4<f32>> {
        ensure!(!frames.is_empty(), "cannot build an empty batch");
        Ok(stack(Axis(0), frames)?)
    }

    /// Restore the channel mean, quantize to RGB8 and resize back to the original size.
    pub fn batch_to_frames(&self, batch: ArrayView4<'_, f32>) -> Result<Vec<Frame>> {
        let (n, c, h, w) = batch.dim();
        ensure!(
            c == 3 && h == self.working.height as usize && w == self.working.width as usize,
            "batch shape {:?} does not match working layout 3x{}",
            batch.shape(),
            self.working
        );

        let mut frames = Vec::with_capacity(n);
        for b in 0..n {
            let rgb = chw_to_rgb(batch.slice(s![b, .., .., ..]), self.channel_mean);
            let data = if self.working == self.original {
                rgb
            } else {
                resize_bilinear(
                    &rgb,
                    w,
                    h,
                    self.original.width as usize,
                    self.original.height as usize,
                )
            };
            frames.push(Frame::new(
                data,
                self.original.width,
                self.original.height,
            )?);
        }
        Ok(frames)
    }
}

/// Round each side down to a multiple of `align`, never below one alignment unit.
pub fn working_dims(original: FrameDims, align: u32) -> FrameDims {
    let align = align.max(1);
    let round = |side: u32| ((side / align) * align).max(align);
    FrameDims::new(round(original.width), round(original.height))
}

fn chw_to_rgb(chw: ArrayView3<'_, f32>, mean: [f32; 3]) -> Vec<u8> {
    let (_, h, w) = chw.dim();
    let mut rgb = vec![0u8; h * w * 3];
    for y in 0..h {
        for x in 0..w {
            let dst = (y * w + x) * 3;
            for c in 0..3 {
                let value = chw[[c, y, x]] + mean[c];
                rgb[dst + c] = (value * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
            }
        }
    }
    rgb
}

/// Bilinear interpolation resize for 8-bit RGB24 data.
pub(crate) fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y0 = src_y0.min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x0 = src_x0.min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * 3;

            for c in 0..3 {
                let p00 = src[(src_y0 * src_w + src_x0) * 3 + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * 3 + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * 3 + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * 3 + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_mean_layout(w: u32, h: u32) -> TensorLayout {
        TensorLayout::new(FrameDims::new(w, h), 32, [0.0; 3])
    }

    #[test]
    fn test_working_dims_rounds_down_to_alignment() {
        assert_eq!(
            working_dims(FrameDims::new(1920, 1080), 32),
            FrameDims::new(1920, 1056)
        );
        assert_eq!(
            working_dims(FrameDims::new(1280, 720), 32),
            FrameDims::new(1280, 704)
        );
        assert_eq!(
            working_dims(FrameDims::new(64, 64), 32),
            FrameDims::new(64, 64)
        );
    }

    #[test]
    fn test_working_dims_never_below_one_unit() {
        assert_eq!(
            working_dims(FrameDims::new(20, 10), 32),
            FrameDims::new(32, 32)
        );
        assert_eq!(working_dims(FrameDims::new(5, 7), 0), FrameDims::new(5, 7));
    }

    #[test]
    fn test_frame_to_chw_normalises_and_subtracts_mean() {
        let layout = TensorLayout::new(FrameDims::new(32, 32), 32, DEFAULT_CHANNEL_MEAN);
        let frame = Frame::solid(32, 32, [255, 0, 128]);
        let chw = layout.frame_to_chw(&frame).unwrap();
        assert_eq!(chw.shape(), &[3, 32, 32]);
        assert!((chw[[0, 0, 0]] - (1.0 - 0.429)).abs() < 1e-6);
        assert!((chw[[1, 5, 5]] - (0.0 - 0.431)).abs() < 1e-6);
        assert!((chw[[2, 31, 31]] - (128.0 / 255.0 - 0.397)).abs() < 1e-6);
    }

    #[test]
    fn test_frame_to_chw_resizes_to_working_resolution() {
        let layout = zero_mean_layout(50, 40);
        let frame = Frame::solid(50, 40, [200, 100, 50]);
        let chw = layout.frame_to_chw(&frame).unwrap();
        assert_eq!(chw.shape(), &[3, 32, 32]);
        assert!((chw[[0, 10, 10]] - 200.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_frame_to_chw_rejects_other_sizes() {
        let layout = zero_mean_layout(32, 32);
        let err = layout
            .frame_to_chw(&Frame::solid(64, 32, [0, 0, 0]))
            .unwrap_err();
        assert!(err.to_string().contains("configured for 32x32"));
    }

    #[test]
    fn test_batch_round_trip_restores_original_size() {
        let layout = TensorLayout::new(FrameDims::new(48, 40), 32, DEFAULT_CHANNEL_MEAN);
        let frames = [
            Frame::solid(48, 40, [10, 20, 30]),
            Frame::solid(48, 40, [240, 128, 0]),
        ];
        let tensors: Vec<_> = frames
            .iter()
            .map(|f| layout.frame_to_chw(f).unwrap())
            .collect();
        let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
        let batch = layout.stack_batch(&views).unwrap();
        assert_eq!(batch.shape(), &[2, 3, 32, 32]);

        let restored = layout.batch_to_frames(batch.view()).unwrap();
        assert_eq!(restored.len(), 2);
        for (original, restored) in frames.iter().zip(&restored) {
            assert_eq!(restored.dims(), original.dims());
            for (a, b) in original.data.iter().zip(&restored.data) {
                assert!((*a as i32 - *b as i32).abs() <= 1, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_batch_to_frames_clamps_out_of_range_values() {
        let layout = zero_mean_layout(32, 32);
        let mut batch = Array4::<f32>::zeros((1, 3, 32, 32));
        batch.slice_mut(s![0, 0, .., ..]).fill(1.7);
        batch.slice_mut(s![0, 1, .., ..]).fill(-0.3);
        let frames = layout.batch_to_frames(batch.view()).unwrap();
        assert_eq!(&frames[0].data[..3], &[255, 0, 0]);
    }

    #[test]
    fn test_stack_batch_rejects_empty() {
        let layout = zero_mean_layout(32, 32);
        assert!(layout.stack_batch(&[]).is_err());
    }

    #[test]
    fn test_resize_bilinear_solid_colour_is_preserved() {
        let src = Frame::solid(7, 5, [12, 34, 56]);
        let dst = resize_bilinear(&src.data, 7, 5, 16, 9);
        assert_eq!(dst.len(), 16 * 9 * 3);
        for pixel in dst.chunks_exact(3) {
            assert_eq!(pixel, &[12, 34, 56]);
        }
    }

    #[test]
    fn test_resize_bilinear_identity() {
        let data: Vec<u8> = (0..4 * 4 * 3).map(|i| (i * 5) as u8).collect();
        assert_eq!(resize_bilinear(&data, 4, 4, 4, 4), data);
    }
}
