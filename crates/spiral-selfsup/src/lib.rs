//! Self-supervised contrastive learning on multi-temporal SAR cubes.
//!
//! The crate wires a lazily evaluated [`dataset::DatasetIndex`] through the
//! [`dataset::SampleBuilder`] preprocessing chain into an [`encoder::Encoder`],
//! trains it with the NT-Xent objective from [`contrastive`] and finally
//! extracts one embedding per sample with [`embed::extract_embeddings`].

pub mod config;
pub mod contrastive;
pub mod dataset;
pub mod embed;
pub mod encoder;
pub mod metrics;
pub mod pipeline;
pub mod trainer;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use spiral_config::ConfigError;
use st_vision::VisionError;
use thiserror::Error;

/// Errors surfaced by the self-supervised pipeline crate.
#[derive(Debug, Error)]
pub enum SelfSupError {
    /// Raised when inputs have mismatched batch, channel or spatial dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised when an invalid parameter (temperature, batch size, etc.) is provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Raised when a filter rejects a frame.
    #[error(transparent)]
    Vision(#[from] VisionError),
    /// Raised when a collection cannot be opened or read.
    #[error("storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },
    /// Raised when a checkpoint does not match the encoder it is loaded into.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SelfSupError>;

impl From<ConfigError> for SelfSupError {
    fn from(err: ConfigError) -> Self {
        SelfSupError::Config(err.to_string())
    }
}

impl SelfSupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SelfSupError::Io {
            path: path.into(),
            source,
        }
    }
}
