// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Stateless single-channel filters.
//!
//! Every function takes an [`ArrayView2`] and returns a freshly allocated image
//! of the same (or the requested) shape. Rows are processed in parallel with
//! rayon; results do not depend on the thread count.

mod bilateral;
mod clahe;
mod resize;
mod sobel;

pub use bilateral::{bilateral_filter, denoise, BilateralParams};
pub use clahe::{clahe, enhance_contrast, enhance_contrast_with, rescale_to_u8, ClaheParams};
pub use resize::{downsample_to, gaussian_smooth, resize_anti_aliased};
pub use sobel::edge_magnitude;

use ndarray::{Array2, ArrayView2};

use crate::{Result, VisionError};

fn ensure_non_empty<T>(image: &ArrayView2<'_, T>, label: &'static str) -> Result<(usize, usize)> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Err(VisionError::EmptyImage { label, rows, cols });
    }
    Ok((rows, cols))
}

/// Copies the image into a row-major buffer, rejecting NaN/inf pixels.
fn finite_buffer(image: &ArrayView2<'_, f32>, label: &'static str) -> Result<Vec<f32>> {
    let (_, cols) = ensure_non_empty(image, label)?;
    let mut buffer = Vec::with_capacity(image.len());
    for (idx, &value) in image.iter().enumerate() {
        if !value.is_finite() {
            return Err(VisionError::NonFiniteValue {
                label,
                value,
                row: idx / cols,
                col: idx % cols,
            });
        }
        buffer.push(value);
    }
    Ok(buffer)
}

fn into_image<T>(rows: usize, cols: usize, data: Vec<T>) -> Result<Array2<T>> {
    Array2::from_shape_vec((rows, cols), data).map_err(|err| VisionError::Shape(err.to_string()))
}
