//! Execution-provider selection for the flow and refinement sessions.
//!
//! Provides [`InferenceBackend`] and [`build_session`], which creates an
//! `ort::Session` with the requested provider chain and optional TensorRT engine caching.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default is `Cuda`. `Tensorrt` needs the TensorRT runtime (`libnvinfer.so.10` or
/// `nvinfer.dll`); without it the session falls back to CUDA, and without CUDA to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl FromStr for InferenceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            other => bail!("unknown inference backend '{other}' (expected cpu, cuda or tensorrt)"),
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    /// Engine cache directory, only used by TensorRT.
    pub trt_cache_dir: Option<&'a Path>,
}

fn cache_file_count(root: &Path) -> u64 {
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                count += 1;
            }
        }
    }
    count
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", model = %model_path.display(), "building session");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", model = %model_path.display(), "building session");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(model_path)
                .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(dir = %cache_dir.display(), error = %e, "failed to create TRT cache directory");
            }
            let cache_path = cache_dir.to_string_lossy().to_string();
            let cached_before = cache_file_count(cache_dir);
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = cached_before,
                model = %model_path.display(),
                "initializing TensorRT session (first run may take several minutes)"
            );

            // Engine builds are slow and silent; tick so the user knows we are alive.
            let (stop_tx, stop_rx) = channel::<()>();
            let started = Instant::now();
            let ticker = thread::spawn(move || loop {
                match stop_rx.recv_timeout(Duration::from_secs(15)) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => info!(
                        elapsed_secs = started.elapsed().as_secs(),
                        "TensorRT session initialization still in progress"
                    ),
                }
            });

            let session = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("failed to load ONNX model: {}", model_path.display()));

            let _ = stop_tx.send(());
            let _ = ticker.join();

            let session = session?;
            info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                engine_cache_updated = cache_file_count(cache_dir) > cached_before,
                "TensorRT session ready"
            );
            Ok(session)
        }
    }
}

/// Format: `{model_hash_prefix}_{height}x{width}`; engines are specific to both.
pub fn trt_cache_key(model_hash: &str, height: u32, width: u32) -> String {
    let prefix = &model_hash[..model_hash.len().min(16)];
    format!("{prefix}_{height}x{width}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}
