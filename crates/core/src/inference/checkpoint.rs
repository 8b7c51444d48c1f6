//! Checkpoint resolution and the ONNX-backed flow / refinement estimators.
//!
//! A checkpoint is a pair of exported UNets: the flow network (`I0 ‖ I1`, 6 channels in,
//! `F_0_1 ‖ F_1_0`, 4 channels out) and the arbitrary-time refinement network
//! (20 channels in, `ΔF_t_0 ‖ ΔF_t_1 ‖ V_t_0` logits out).

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, ensure, Context, Result};
use ndarray::{concatenate, s, Array4, ArrayView4, Axis, Ix4};
use ort::{session::Session, value::TensorRef};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::backend::{build_session, resolve_trt_cache_dir, trt_cache_key, InferenceBackend, SessionConfig};
use crate::capability::{FlowEstimator, Refinement, RefinementEstimator, RefinementInputs};
use crate::error::SlomoError;
use crate::types::{FlowPair, FrameDims};

pub const FLOW_MODEL_FILE: &str = "flow_comp.onnx";
pub const REFINEMENT_MODEL_FILE: &str = "arb_time_flow_intrp.onnx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    pub flow: PathBuf,
    pub refinement: PathBuf,
}

/// Accepts the checkpoint directory, or the flow model with the refinement model next to it.
pub fn resolve_checkpoint(path: &Path) -> Result<CheckpointFiles, SlomoError> {
    let dir = if path.is_dir() {
        path.to_path_buf()
    } else if path.is_file() {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        return Err(SlomoError::checkpoint(path, "no such file or directory"));
    };

    let flow = if path.is_file() {
        path.to_path_buf()
    } else {
        dir.join(FLOW_MODEL_FILE)
    };
    let refinement = dir.join(REFINEMENT_MODEL_FILE);

    for required in [&flow, &refinement] {
        if !required.is_file() {
            return Err(SlomoError::checkpoint(
                path,
                format!("missing model file {}", required.display()),
            ));
        }
    }

    Ok(CheckpointFiles { flow, refinement })
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Session settings shared by both networks.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
}

struct OnnxModel {
    session: Mutex<Session>,
    input: String,
    output: String,
    label: &'static str,
}

impl OnnxModel {
    fn load(
        label: &'static str,
        path: &Path,
        hash: &str,
        settings: &InferenceSettings,
        working: FrameDims,
    ) -> Result<Self> {
        let cache_key = trt_cache_key(hash, working.height, working.width);
        let cache_dir = resolve_trt_cache_dir(&settings.trt_cache_dir, Some(&cache_key));
        let session = build_session(&SessionConfig {
            model_path: path,
            backend: settings.backend,
            trt_cache_dir: Some(cache_dir.as_path()),
        })?;

        let input = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| anyhow!("{label} model declares no inputs"))?;
        let output = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| anyhow!("{label} model declares no outputs"))?;
        debug!(model = label, input = %input, output = %output, "session bound");

        Ok(Self {
            session: Mutex::new(session),
            input,
            output,
            label,
        })
    }

    fn run(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let started = Instant::now();
        let tensor = TensorRef::from_array_view(input)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("{} session lock poisoned", self.label))?;
        let outputs = session.run(ort::inputs![self.input.as_str() => tensor])?;
        let output = outputs[self.output.as_str()]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()
            .with_context(|| format!("{} output is not 4-dimensional", self.label))?;
        debug!(
            model = self.label,
            run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "session run"
        );
        Ok(output)
    }
}

pub struct OnnxFlowEstimator {
    model: OnnxModel,
}

impl FlowEstimator for OnnxFlowEstimator {
    fn estimate(&self, frame0: ArrayView4<'_, f32>, frame1: ArrayView4<'_, f32>) -> Result<FlowPair> {
        let input = concatenate(Axis(1), &[frame0, frame1])?;
        let output = self.model.run(input.view())?;
        ensure!(
            output.shape()[1] == 4,
            "flow model returned {} channels, expected 4",
            output.shape()[1]
        );
        Ok(FlowPair {
            forward: output.slice(s![.., 0..2, .., ..]).to_owned(),
            backward: output.slice(s![.., 2..4, .., ..]).to_owned(),
        })
    }
}

pub struct OnnxRefinementEstimator {
    model: OnnxModel,
}

impl RefinementEstimator for OnnxRefinementEstimator {
    fn refine(&self, inputs: &RefinementInputs<'_>) -> Result<Refinement> {
        let input = concatenate(
            Axis(1),
            &[
                inputs.frame0,
                inputs.frame1,
                inputs.flow_0_1,
                inputs.flow_1_0,
                inputs.flow_t_1,
                inputs.flow_t_0,
                inputs.warped1,
                inputs.warped0,
            ],
        )?;
        let output = self.model.run(input.view())?;
        ensure!(
            output.shape()[1] == 5,
            "refinement model returned {} channels, expected 5",
            output.shape()[1]
        );
        Ok(Refinement {
            delta_t_0: output.slice(s![.., 0..2, .., ..]).to_owned(),
            delta_t_1: output.slice(s![.., 2..4, .., ..]).to_owned(),
            visibility_t_0: output
                .slice(s![.., 4..5, .., ..])
                .mapv(|x| 1.0 / (1.0 + (-x).exp())),
        })
    }
}

pub struct LoadedCheckpoint {
    pub flow: OnnxFlowEstimator,
    pub refinement: OnnxRefinementEstimator,
    pub files: CheckpointFiles,
    pub flow_sha256: String,
    pub refinement_sha256: String,
}

/// Build both sessions for frames at `working` resolution.
///
/// Every failure is reported as [`SlomoError::CheckpointLoadFailure`] naming `path`.
pub fn load_checkpoint(
    path: &Path,
    settings: &InferenceSettings,
    working: FrameDims,
) -> Result<LoadedCheckpoint> {
    let files = resolve_checkpoint(path)?;
    let fail = |stage: &str, error: anyhow::Error| -> anyhow::Error {
        SlomoError::checkpoint(path, format!("{stage}: {error:#}")).into()
    };

    let flow_sha256 = sha256_file(&files.flow).map_err(|e| fail("hashing flow model", e))?;
    let refinement_sha256 =
        sha256_file(&files.refinement).map_err(|e| fail("hashing refinement model", e))?;
    info!(
        flow = %files.flow.display(),
        flow_sha256 = %flow_sha256,
        refinement = %files.refinement.display(),
        refinement_sha256 = %refinement_sha256,
        backend = %settings.backend,
        "loading checkpoint"
    );

    let flow = OnnxModel::load("flow", &files.flow, &flow_sha256, settings, working)
        .map_err(|e| fail("flow model", e))?;
    let refinement = OnnxModel::load(
        "refinement",
        &files.refinement,
        &refinement_sha256,
        settings,
        working,
    )
    .map_err(|e| fail("refinement model", e))?;

    Ok(LoadedCheckpoint {
        flow: OnnxFlowEstimator { model: flow },
        refinement: OnnxRefinementEstimator { model: refinement },
        files,
        flow_sha256,
        refinement_sha256,
    })
}
