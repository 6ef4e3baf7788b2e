// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Anti-aliased resampling of a single channel.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::{finite_buffer, into_image};
use crate::border::reflect101;
use crate::{Result, VisionError};

/// Gaussian support in units of sigma.
const TRUNCATE: f64 = 4.0;

/// Resizes to `target` with Gaussian anti-aliasing and range clipping.
pub fn downsample_to(image: ArrayView2<'_, f32>, target: (usize, usize)) -> Result<Array2<f32>> {
    resize_anti_aliased(image, target, true)
}

/// Bilinear resize on a half-pixel-centred grid with mirrored borders.
///
/// With `anti_aliasing` the input is first smoothed by a Gaussian of
/// `σ = max(0, (in/out - 1) / 2)` per axis, so upsampling is never blurred.
/// The result is clipped to the input's value range.
pub fn resize_anti_aliased(
    image: ArrayView2<'_, f32>,
    target: (usize, usize),
    anti_aliasing: bool,
) -> Result<Array2<f32>> {
    let (out_rows, out_cols) = target;
    if out_rows == 0 || out_cols == 0 {
        return Err(VisionError::InvalidParameter {
            label: "resize.target",
            message: format!("target shape must be non-zero, got {out_rows}x{out_cols}"),
        });
    }
    let source = finite_buffer(&image, "resize")?;
    let (rows, cols) = image.dim();
    let (min, max) = source
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    let mut field: Vec<f64> = source.iter().map(|&v| v as f64).collect();
    if anti_aliasing {
        let sigma_rows = ((rows as f64 / out_rows as f64) - 1.0).max(0.0) / 2.0;
        let sigma_cols = ((cols as f64 / out_cols as f64) - 1.0).max(0.0) / 2.0;
        field = smooth_buffer(field, rows, cols, (sigma_rows, sigma_cols));
    }

    let row_taps = linear_taps(out_rows, rows);
    let col_taps = linear_taps(out_cols, cols);
    let mut out = vec![0.0f32; out_rows * out_cols];
    out.par_chunks_mut(out_cols)
        .zip(row_taps.par_iter())
        .for_each(|(row, &(r0, r1, ty))| {
            for (slot, &(c0, c1, tx)) in row.iter_mut().zip(col_taps.iter()) {
                let top = field[r0 * cols + c0] * (1.0 - tx) + field[r0 * cols + c1] * tx;
                let bottom = field[r1 * cols + c0] * (1.0 - tx) + field[r1 * cols + c1] * tx;
                let value = (top * (1.0 - ty) + bottom * ty) as f32;
                *slot = value.clamp(min, max);
            }
        });
    into_image(out_rows, out_cols, out)
}

/// Separable Gaussian blur with mirrored borders; axes with σ≈0 are skipped.
pub fn gaussian_smooth(image: ArrayView2<'_, f32>, sigma: (f64, f64)) -> Result<Array2<f32>> {
    for value in [sigma.0, sigma.1] {
        if !value.is_finite() || value < 0.0 {
            return Err(VisionError::InvalidParameter {
                label: "gaussian.sigma",
                message: format!("sigma must be >= 0, got {value}"),
            });
        }
    }
    let source = finite_buffer(&image, "gaussian_smooth")?;
    let (rows, cols) = image.dim();
    let field = smooth_buffer(
        source.iter().map(|&v| v as f64).collect(),
        rows,
        cols,
        sigma,
    );
    into_image(rows, cols, field.into_iter().map(|v| v as f32).collect())
}

fn smooth_buffer(mut field: Vec<f64>, rows: usize, cols: usize, sigma: (f64, f64)) -> Vec<f64> {
    if let Some(kernel) = gaussian_kernel(sigma.0) {
        let radius = (kernel.len() / 2) as isize;
        let src = field.clone();
        field.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
            for (c, slot) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let rr = reflect101(r as isize + k as isize - radius, rows);
                    acc += weight * src[rr * cols + c];
                }
                *slot = acc;
            }
        });
    }
    if let Some(kernel) = gaussian_kernel(sigma.1) {
        let radius = (kernel.len() / 2) as isize;
        let src = field.clone();
        field.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
            let line = &src[r * cols..(r + 1) * cols];
            for (c, slot) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    acc += weight * line[reflect101(c as isize + k as isize - radius, cols)];
                }
                *slot = acc;
            }
        });
    }
    field
}

fn gaussian_kernel(sigma: f64) -> Option<Vec<f64>> {
    if sigma <= 1e-15 {
        return None;
    }
    let radius = (TRUNCATE * sigma + 0.5) as isize;
    let denom = -0.5 / (sigma * sigma);
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|x| ((x * x) as f64 * denom).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= total);
    Some(kernel)
}

/// For each output index: the two source indices and the weight of the second.
fn linear_taps(out_len: usize, in_len: usize) -> Vec<(usize, usize, f64)> {
    let scale = in_len as f64 / out_len as f64;
    (0..out_len)
        .map(|o| {
            let coord = (o as f64 + 0.5) * scale - 0.5;
            let base = coord.floor();
            let weight = coord - base;
            let base = base as isize;
            (
                reflect101(base, in_len),
                reflect101(base + 1, in_len),
                weight,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn downsample_hits_target_shape() {
        let image = Array2::from_shape_fn((200, 130), |(r, c)| ((r * c) % 17) as f32);
        let out = downsample_to(image.view(), (64, 64)).unwrap();
        assert_eq!(out.dim(), (64, 64));
    }

    #[test]
    fn upsampling_stays_within_input_range() {
        let image = Array2::from_shape_fn((32, 32), |(r, c)| (r as f32 - c as f32) * 0.5);
        let out = downsample_to(image.view(), (64, 64)).unwrap();
        let lo = image.iter().cloned().fold(f32::INFINITY, f32::min);
        let hi = image.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!(out.iter().all(|&v| v >= lo && v <= hi));
    }

    #[test]
    fn constant_image_stays_constant() {
        let image = Array2::from_elem((90, 70), -2.5f32);
        let out = downsample_to(image.view(), (64, 64)).unwrap();
        assert!(out.iter().all(|&v| v == -2.5));
    }

    #[test]
    fn identity_resize_without_smoothing_is_exact() {
        let image = Array2::from_shape_fn((8, 8), |(r, c)| (r * 8 + c) as f32);
        let out = resize_anti_aliased(image.view(), (8, 8), true).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn gaussian_kernel_is_normalised() {
        let kernel = gaussian_kernel(1.5).unwrap();
        assert_eq!(kernel.len(), 2 * 6 + 1);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(gaussian_kernel(0.0).is_none());
    }

    #[test]
    fn rejects_empty_target() {
        let image = Array2::<f32>::zeros((4, 4));
        assert!(downsample_to(image.view(), (0, 4)).is_err());
    }
}
