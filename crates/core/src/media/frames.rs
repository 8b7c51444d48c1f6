//! Reading the extracted originals and writing the sequenced output, one image per frame.

use std::collections::BTreeMap;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tracing::debug;

use super::decode::is_jpeg;
use crate::error::SlomoError;
use crate::pipeline::FrameSource;
use crate::sequencer::FrameSink;
use crate::types::{Frame, FrameDims, OutputFrame, OutputKind};

/// Images named `1..=N` (any zero padding) in one directory, all the same size.
#[derive(Debug)]
pub struct NumberedFrames {
    paths: Vec<PathBuf>,
    dims: FrameDims,
}

impl NumberedFrames {
    /// Index `dir`, keeping files with `extension` whose stem is a frame number.
    ///
    /// The numbering must be dense from 1 and every image must share the first one's size.
    pub fn open(dir: &Path, extension: &str) -> Result<Self> {
        let mut numbered = BTreeMap::new();
        let entries = fs::read_dir(dir)
            .map_err(|e| SlomoError::decoding(dir, format!("cannot list frames: {e}")))?;
        for path in entries.flatten().map(|entry| entry.path()) {
            let matches_ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
            let number = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<usize>().ok());
            if let (true, Some(number)) = (matches_ext, number) {
                if numbered.insert(number, path).is_some() {
                    return Err(SlomoError::decoding(dir, format!("frame {number} appears twice")).into());
                }
            }
        }

        for (expected, number) in (1..).zip(numbered.keys()) {
            if *number != expected {
                return Err(SlomoError::decoding(
                    dir,
                    format!("frame numbering has a gap: expected {expected}, found {number}"),
                )
                .into());
            }
        }
        let paths: Vec<PathBuf> = numbered.into_values().collect();

        let Some(first) = paths.first() else {
            return Err(SlomoError::decoding(dir, format!("no .{extension} frames found")).into());
        };
        let (width, height) = image::image_dimensions(first)
            .map_err(|e| SlomoError::decoding(first, e.to_string()))?;
        let dims = FrameDims::new(width, height);
        for path in &paths[1..] {
            let (w, h) = image::image_dimensions(path)
                .map_err(|e| SlomoError::decoding(path, e.to_string()))?;
            if (w, h) != (width, height) {
                return Err(SlomoError::decoding(
                    path,
                    format!("frame is {w}x{h}, expected {dims}"),
                )
                .into());
            }
        }

        debug!(dir = %dir.display(), frames = paths.len(), dims = %dims, "indexed frames");
        Ok(Self { paths, dims })
    }
}

impl FrameSource for NumberedFrames {
    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn dims(&self) -> FrameDims {
        self.dims
    }

    fn load(&self, number: usize) -> Result<Frame> {
        let Some(path) = self.origin(number) else {
            bail!("frame {number} out of range 1..={}", self.paths.len());
        };
        let rgb = image::open(path)
            .map_err(|e| SlomoError::decoding(path, e.to_string()))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        Frame::new(rgb.into_raw(), width, height)
    }

    fn origin(&self, number: usize) -> Option<&Path> {
        number
            .checked_sub(1)
            .and_then(|i| self.paths.get(i))
            .map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    Jpeg { quality: u8 },
    Png,
}

/// Writes every sequenced frame to `dir/{index}.{extension}`.
///
/// Originals are copied byte-for-byte from their decoded file when it has the same
/// extension; everything else is encoded from pixels.
#[derive(Debug)]
pub struct NumberedImageSink {
    dir: PathBuf,
    extension: String,
    format: ImageFormat,
    copied: u64,
    encoded: u64,
}

impl NumberedImageSink {
    pub fn new(dir: &Path, extension: &str, jpeg_quality: u8) -> Result<Self> {
        let format = if is_jpeg(extension) {
            ImageFormat::Jpeg {
                quality: jpeg_quality.clamp(1, 100),
            }
        } else if extension.eq_ignore_ascii_case("png") {
            ImageFormat::Png
        } else {
            return Err(SlomoError::InvalidConfiguration(format!(
                "unsupported frame extension '{extension}' (expected jpg or png)"
            ))
            .into());
        };
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output frame directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
            format,
            copied: 0,
            encoded: 0,
        })
    }

    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{index}.{}", self.extension))
    }

    fn encode(&self, path: &Path, frame: &Frame) -> Result<()> {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let writer = BufWriter::new(file);
        match self.format {
            ImageFormat::Jpeg { quality } => JpegEncoder::new_with_quality(writer, quality)
                .write_image(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8),
            ImageFormat::Png => PngEncoder::new(writer).write_image(
                &frame.data,
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            ),
        }
        .with_context(|| format!("failed to write {}", path.display()))
    }
}

impl FrameSink for NumberedImageSink {
    fn write_frame(&mut self, out: &OutputFrame<'_>) -> Result<()> {
        let path = self.frame_path(out.index);
        let copy_from = match out.kind {
            OutputKind::Original {
                origin: Some(origin),
                ..
            } => origin
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
                .then_some(origin),
            _ => None,
        };

        match copy_from {
            Some(origin) => {
                fs::copy(origin, &path).with_context(|| {
                    format!("failed to copy {} to {}", origin.display(), path.display())
                })?;
                self.copied += 1;
            }
            None => {
                self.encode(&path, out.frame)?;
                self.encoded += 1;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        debug!(
            dir = %self.dir.display(),
            copied = self.copied,
            encoded = self.encoded,
            "output frames written"
        );
        Ok(())
    }
}
