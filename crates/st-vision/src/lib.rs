// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Image primitives for multi-temporal radar preprocessing.
//!
//! [`filters`] holds the pure single-channel operations (edge-preserving
//! denoising, local contrast equalisation, gradient magnitude and
//! anti-aliased resampling). [`transforms`] holds the stochastic view
//! augmentations applied to finished `[C, H, W]` sample tensors.

pub mod border;
pub mod filters;
pub mod transforms;

use thiserror::Error;

pub use filters::{
    denoise, downsample_to, edge_magnitude, enhance_contrast, BilateralParams, ClaheParams,
};
pub use transforms::{TransformOperation, TransformPipeline};

/// Errors surfaced by the image filters and transforms.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VisionError {
    /// Raised when a filter receives an image with a zero-length axis.
    #[error("{label}: image must be non-empty, got {rows}x{cols}")]
    EmptyImage {
        label: &'static str,
        rows: usize,
        cols: usize,
    },
    /// Raised when an input pixel is NaN or infinite.
    #[error("{label}: non-finite value {value} at ({row}, {col})")]
    NonFiniteValue {
        label: &'static str,
        value: f32,
        row: usize,
        col: usize,
    },
    /// Raised when a filter or transform parameter is out of range.
    #[error("invalid parameter {label}: {message}")]
    InvalidParameter {
        label: &'static str,
        message: String,
    },
    /// Raised when a buffer cannot be reshaped into the expected image.
    #[error("shape error: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, VisionError>;
