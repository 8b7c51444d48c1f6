use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use image::ExtendedColorType;
use ndarray::{Array4, ArrayView4};

use slomo_core::capability::{Refinement, RefinementInputs};
use slomo_core::config::AppConfig;
use slomo_core::media::{NumberedFrames, NumberedImageSink};
use slomo_core::pipeline::{Capabilities, FrameSource, PipelineDriver, PipelineOptions};
use slomo_core::types::FlowPair;
use slomo_core::warp::BackWarp;
use slomo_core::{run_job, JobConfig, SlomoError};

fn diagonal_flow(f0: ArrayView4<'_, f32>, _f1: ArrayView4<'_, f32>) -> Result<FlowPair> {
    let (b, _, h, w) = f0.dim();
    Ok(FlowPair {
        forward: Array4::from_elem((b, 2, h, w), 0.75),
        backward: Array4::from_elem((b, 2, h, w), -0.75),
    })
}

fn gradient_visibility(inputs: &RefinementInputs<'_>) -> Result<Refinement> {
    let (b, _, h, w) = inputs.frame0.dim();
    Ok(Refinement {
        delta_t_0: Array4::from_elem((b, 2, h, w), 0.1),
        delta_t_1: Array4::from_elem((b, 2, h, w), -0.1),
        visibility_t_0: Array4::from_shape_fn((b, 1, h, w), |(_, _, y, x)| {
            (x + y) as f32 / (w + h) as f32
        }),
    })
}

/// Decoded-frame layout: `000001.png`, `000002.png`, ... in `dir`.
fn write_originals(dir: &Path, count: usize) {
    for n in 1..=count {
        let mut data = Vec::with_capacity(40 * 24 * 3);
        for y in 0..24u32 {
            for x in 0..40u32 {
                data.extend_from_slice(&[
                    (x * 6 + n as u32 * 9) as u8,
                    (y * 10) as u8,
                    (n * 50) as u8,
                ]);
            }
        }
        image::save_buffer(
            dir.join(format!("{n:06}.png")),
            &data,
            40,
            24,
            ExtendedColorType::Rgb8,
        )
        .expect("write original frame");
    }
}

fn convert(input: &Path, output: &Path, sf: u32, batch_size: usize) -> u64 {
    let source = NumberedFrames::open(input, "png").expect("open frames");
    let sink = NumberedImageSink::new(output, "png", 95).expect("sink");
    let capabilities = Capabilities {
        flow: &diagonal_flow,
        warp: &BackWarp,
        refinement: &gradient_visibility,
    };
    let driver = PipelineDriver::new(capabilities, PipelineOptions::new(sf, batch_size));
    let (summary, _) = driver.run(&source, sink).expect("conversion");
    summary.output_frames
}

fn sorted_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read output dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    files.sort();
    files
}

#[test]
fn output_directory_holds_dense_numbered_frames() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = temp.path().join("input");
    let output = temp.path().join("output");
    fs::create_dir_all(&input).expect("input dir");
    write_originals(&input, 4);

    let written = convert(&input, &output, 3, 2);
    assert_eq!(written, 10);

    let reopened = NumberedFrames::open(&output, "png").expect("output is a dense sequence");
    assert_eq!(reopened.frame_count(), 10);
    // Originals land on 1, 4, 7 and 10 and are byte-for-byte copies.
    for (index, original) in [(1, 1), (4, 2), (7, 3), (10, 4)] {
        assert_eq!(
            fs::read(output.join(format!("{index}.png"))).expect("read output"),
            fs::read(input.join(format!("{original:06}.png"))).expect("read original"),
        );
    }
}

#[test]
fn rerunning_produces_identical_bytes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = temp.path().join("input");
    fs::create_dir_all(&input).expect("input dir");
    write_originals(&input, 3);

    let first = temp.path().join("first");
    let second = temp.path().join("second");
    convert(&input, &first, 4, 1);
    convert(&input, &second, 4, 2);

    let first_files = sorted_files(&first);
    let second_files = sorted_files(&second);
    assert_eq!(first_files.len(), 9);
    assert_eq!(first_files.len(), second_files.len());
    for (a, b) in first_files.iter().zip(&second_files) {
        assert_eq!(a.file_name(), b.file_name());
        assert_eq!(
            fs::read(a).expect("read first"),
            fs::read(b).expect("read second"),
            "{} differs between runs",
            a.display()
        );
    }
}

#[test]
fn sf_one_is_rejected_before_anything_is_created() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig::default();
    config.paths.scratch_root = temp.path().join("scratch");
    config.paths.trt_cache_dir = temp.path().join("trt");
    let job = JobConfig {
        video: temp.path().join("missing.mp4"),
        checkpoint: temp.path().join("weights"),
        output: temp.path().join("out.mp4"),
        fps: 30.0,
        slomo_factor: 1,
        batch_size: 1,
    };

    let err = run_job(&job, &config, None).expect_err("sf=1 must be rejected");
    assert!(matches!(
        err.downcast_ref::<SlomoError>(),
        Some(SlomoError::InvalidConfiguration(_))
    ));
    assert_eq!(fs::read_dir(temp.path()).expect("list temp").count(), 0);
}

#[test]
#[ignore = "requires ffmpeg and an exported checkpoint in SLOMO_TEST_CHECKPOINT / SLOMO_TEST_VIDEO"]
fn end_to_end_conversion() {
    let (Ok(checkpoint), Ok(video)) = (
        std::env::var("SLOMO_TEST_CHECKPOINT"),
        std::env::var("SLOMO_TEST_VIDEO"),
    ) else {
        return;
    };
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig::default();
    config.paths.scratch_root = temp.path().to_path_buf();
    config.paths.trt_cache_dir = temp.path().join("trt");
    config.inference.backend = slomo_core::inference::InferenceBackend::Cpu;
    let job = JobConfig {
        video: PathBuf::from(video),
        checkpoint: PathBuf::from(checkpoint),
        output: temp.path().join("slow.mp4"),
        fps: 30.0,
        slomo_factor: 2,
        batch_size: 2,
    };

    let report = run_job(&job, &config, None).expect("conversion");
    assert!(report.output.is_file());
    assert_eq!(
        report.summary.output_frames,
        (report.summary.input_frames as u64 - 1) * 2 + 1
    );
    let leftovers = fs::read_dir(temp.path())
        .expect("list temp")
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(slomo_core::scratch::SCRATCH_PREFIX))
        .count();
    assert_eq!(leftovers, 0);
}
