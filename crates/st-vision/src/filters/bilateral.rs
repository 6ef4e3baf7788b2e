// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::{finite_buffer, into_image};
use crate::border::reflect101;
use crate::{Result, VisionError};

/// Parameters of the edge-preserving bilateral filter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BilateralParams {
    /// Neighbourhood diameter in pixels; the support is the disc of radius
    /// `diameter / 2`.
    pub diameter: usize,
    /// Intensity-similarity sigma.
    pub sigma_color: f32,
    /// Spatial sigma.
    pub sigma_space: f32,
}

impl Default for BilateralParams {
    fn default() -> Self {
        Self {
            diameter: 9,
            sigma_color: 75.0,
            sigma_space: 75.0,
        }
    }
}

impl BilateralParams {
    pub fn validate(&self) -> Result<()> {
        if self.diameter == 0 {
            return Err(VisionError::InvalidParameter {
                label: "bilateral.diameter",
                message: "diameter must be > 0".to_string(),
            });
        }
        for (label, sigma) in [
            ("bilateral.sigma_color", self.sigma_color),
            ("bilateral.sigma_space", self.sigma_space),
        ] {
            if !sigma.is_finite() || sigma <= 0.0 {
                return Err(VisionError::InvalidParameter {
                    label,
                    message: format!("sigma must be > 0, got {sigma}"),
                });
            }
        }
        Ok(())
    }

    /// Spatial taps `(dr, dc, weight)` inside the circular support.
    fn spatial_taps(&self) -> Vec<(isize, isize, f64)> {
        let radius = (self.diameter / 2) as isize;
        let coeff = -0.5 / (self.sigma_space as f64).powi(2);
        let mut taps = Vec::with_capacity((2 * radius as usize + 1).pow(2));
        for dr in -radius..=radius {
            for dc in -radius..=radius {
                let dist_sq = dr * dr + dc * dc;
                if dist_sq > radius * radius {
                    continue;
                }
                taps.push((dr, dc, (dist_sq as f64 * coeff).exp()));
            }
        }
        taps
    }
}

/// Bilateral smoothing with the default 9 px / σ=75 parameters.
pub fn denoise(image: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
    bilateral_filter(image, &BilateralParams::default())
}

/// Edge-preserving smoothing: each output pixel is the weighted mean of its
/// neighbourhood, weighted by spatial distance and intensity similarity.
pub fn bilateral_filter(image: ArrayView2<'_, f32>, params: &BilateralParams) -> Result<Array2<f32>> {
    params.validate()?;
    let source = finite_buffer(&image, "bilateral")?;
    let (rows, cols) = image.dim();
    let taps = params.spatial_taps();
    let color_coeff = -0.5 / (params.sigma_color as f64).powi(2);

    let mut out = vec![0.0f32; rows * cols];
    out.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
        for (c, slot) in row.iter_mut().enumerate() {
            let center = source[r * cols + c] as f64;
            let mut weighted = 0.0f64;
            let mut total = 0.0f64;
            for &(dr, dc, spatial) in &taps {
                let rr = reflect101(r as isize + dr, rows);
                let cc = reflect101(c as isize + dc, cols);
                let value = source[rr * cols + cc] as f64;
                let diff = value - center;
                let weight = spatial * (diff * diff * color_coeff).exp();
                weighted += weight * value;
                total += weight;
            }
            // The centre tap always contributes weight 1, so `total` > 0.
            *slot = (weighted / total) as f32;
        }
    });
    into_image(rows, cols, out)
}
