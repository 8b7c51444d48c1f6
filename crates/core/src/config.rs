use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SlomoError;
use crate::inference::InferenceBackend;
use crate::media::decode::is_jpeg;
use crate::tensor::{DEFAULT_CHANNEL_MEAN, DEFAULT_WORKING_ALIGN};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SLOMO_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub encoding: EncodingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent of the per-run `.tmpSlomo*` scratch directory.
    pub scratch_root: PathBuf,
    pub trt_cache_dir: PathBuf,
    /// Directory holding `ffmpeg`/`ffprobe`; unset means bundled `bin/` then `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    /// Per-channel RGB mean subtracted after scaling to `[0, 1]`.
    pub channel_mean: [f32; 3],
    /// Working resolution is floored to a multiple of this.
    pub working_align: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncodingConfig {
    pub codec: String,
    pub crf: u32,
    /// Image format of the scratch frames, `jpg` or `png`.
    pub frame_extension: String,
    /// ffmpeg `-qscale:v` used when extracting JPEG frames.
    pub jpeg_qscale: u32,
    /// Quality of synthesized JPEG frames, 1-100.
    pub jpeg_quality: u8,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("."),
            trt_cache_dir: PathBuf::from("trt_cache"),
            ffmpeg_dir: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::default(),
            channel_mean: DEFAULT_CHANNEL_MEAN,
            working_align: DEFAULT_WORKING_ALIGN,
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            crf: 17,
            frame_extension: "jpg".to_string(),
            jpeg_qscale: 2,
            jpeg_quality: 95,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Reject settings that would only fail after decoding has started.
    pub fn validate(&self) -> Result<(), SlomoError> {
        self.inference.validate()?;
        self.encoding.validate()
    }

    /// Anchor the relative paths of this config at `base` (the data directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        self.paths.trt_cache_dir = resolve_relative_to(base, &self.paths.trt_cache_dir);
        if let Some(dir) = self.paths.ffmpeg_dir.take() {
            self.paths.ffmpeg_dir = Some(resolve_relative_to(base, &dir));
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), SlomoError> {
        if self.working_align < 1 {
            return Err(SlomoError::InvalidConfiguration(
                "inference.working_align must be >= 1".to_string(),
            ));
        }
        if let Some(bad) = self.channel_mean.iter().find(|m| !m.is_finite()) {
            return Err(SlomoError::InvalidConfiguration(format!(
                "inference.channel_mean must be finite, got {bad}"
            )));
        }
        Ok(())
    }
}

impl EncodingConfig {
    pub fn validate(&self) -> Result<(), SlomoError> {
        let invalid = |msg: String| -> Result<(), SlomoError> {
            Err(SlomoError::InvalidConfiguration(msg))
        };
        let ext = &self.frame_extension;
        if !is_jpeg(ext) && !ext.eq_ignore_ascii_case("png") {
            return invalid(format!(
                "encoding.frame_extension '{ext}' is not supported (expected jpg or png)"
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!(
                "encoding.jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            ));
        }
        if !(1..=31).contains(&self.jpeg_qscale) {
            return invalid(format!(
                "encoding.jpeg_qscale must be in 1..=31, got {}",
                self.jpeg_qscale
            ));
        }
        if self.codec.trim().is_empty() {
            return invalid("encoding.codec is empty".to_string());
        }
        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `SLOMO_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default `config.toml` unless one already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
