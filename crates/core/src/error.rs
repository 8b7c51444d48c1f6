use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds that end a conversion run.
///
/// Everything else travels as `anyhow::Error`; these variants are raised at the
/// stage boundaries so callers can tell a bad argument from a broken ffmpeg
/// install with `downcast_ref::<SlomoError>()`.
#[derive(Debug, Error)]
pub enum SlomoError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to decode {}: {reason}", path.display())]
    DecodingFailure { path: PathBuf, reason: String },

    #[error("failed to encode {}: {reason}", path.display())]
    EncodingFailure { path: PathBuf, reason: String },

    #[error("failed to load checkpoint {}: {reason}", path.display())]
    CheckpointLoadFailure { path: PathBuf, reason: String },

    #[error("run cancelled")]
    Cancelled,
}

impl SlomoError {
    pub fn decoding(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DecodingFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn encoding(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::EncodingFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointLoadFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
