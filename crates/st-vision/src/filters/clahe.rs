// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Contrast-limited adaptive histogram equalisation.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::{ensure_non_empty, finite_buffer, into_image};
use crate::border::reflect101;
use crate::{Result, VisionError};

const BINS: usize = 256;

/// Parameters of the CLAHE operator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClaheParams {
    /// Histogram clip limit, relative to a uniform histogram.
    pub clip_limit: f32,
    /// Tile grid as `(tiles_y, tiles_x)`.
    pub tile_grid: (usize, usize),
}

impl Default for ClaheParams {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: (8, 8),
        }
    }
}

impl ClaheParams {
    pub fn validate(&self) -> Result<()> {
        if self.tile_grid.0 == 0 || self.tile_grid.1 == 0 {
            return Err(VisionError::InvalidParameter {
                label: "clahe.tile_grid",
                message: format!("tile grid must be non-zero, got {:?}", self.tile_grid),
            });
        }
        if !self.clip_limit.is_finite() || self.clip_limit < 0.0 {
            return Err(VisionError::InvalidParameter {
                label: "clahe.clip_limit",
                message: format!("clip limit must be >= 0, got {}", self.clip_limit),
            });
        }
        Ok(())
    }
}

/// Min-max rescale into `0..=255`, truncating towards zero.
///
/// Returns `None` when the value range is degenerate (constant image).
pub fn rescale_to_u8(image: ArrayView2<'_, f32>) -> Result<Option<Array2<u8>>> {
    let source = finite_buffer(&image, "rescale_to_u8")?;
    let (rows, cols) = image.dim();
    let (min, max) = source
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v as f64), hi.max(v as f64))
        });
    let span = max - min;
    if span <= f64::EPSILON {
        return Ok(None);
    }
    let scale = 255.0 / span;
    let data = source
        .iter()
        .map(|&v| {
            let scaled = ((v as f64 - min) * scale) as f32;
            scaled.clamp(0.0, 255.0) as u8
        })
        .collect();
    into_image(rows, cols, data).map(Some)
}

/// Rescale to 8 bits and equalise with the default clip 2.0 / 8×8 grid.
pub fn enhance_contrast(image: ArrayView2<'_, f32>) -> Result<Array2<u8>> {
    enhance_contrast_with(image, &ClaheParams::default())
}

/// Rescale to 8 bits and equalise. A constant image passes through as zeros.
pub fn enhance_contrast_with(image: ArrayView2<'_, f32>, params: &ClaheParams) -> Result<Array2<u8>> {
    params.validate()?;
    match rescale_to_u8(image.view())? {
        Some(scaled) => clahe(scaled.view(), params),
        None => Ok(Array2::zeros(image.dim())),
    }
}

/// CLAHE on an 8-bit image.
///
/// Images whose size is not a multiple of the grid are padded on the bottom and
/// right with a reflect-101 border before tiling; the padding only feeds the
/// tile histograms.
pub fn clahe(image: ArrayView2<'_, u8>, params: &ClaheParams) -> Result<Array2<u8>> {
    params.validate()?;
    let (rows, cols) = ensure_non_empty(&image, "clahe")?;
    let (tiles_y, tiles_x) = params.tile_grid;

    let (ext_rows, ext_cols) = if rows % tiles_y == 0 && cols % tiles_x == 0 {
        (rows, cols)
    } else {
        (
            rows + tiles_y - rows % tiles_y,
            cols + tiles_x - cols % tiles_x,
        )
    };
    let tile_h = ext_rows / tiles_y;
    let tile_w = ext_cols / tiles_x;
    let tile_area = tile_h * tile_w;

    let clip = if params.clip_limit > 0.0 {
        ((params.clip_limit as f64 * tile_area as f64 / BINS as f64) as usize).max(1)
    } else {
        0
    };
    let lut_scale = (BINS - 1) as f32 / tile_area as f32;

    let luts: Vec<[u8; BINS]> = (0..tiles_y * tiles_x)
        .into_par_iter()
        .map(|tile| {
            let ty = tile / tiles_x;
            let tx = tile % tiles_x;
            let mut hist = [0usize; BINS];
            for r in ty * tile_h..(ty + 1) * tile_h {
                let sr = reflect101(r as isize, rows);
                for c in tx * tile_w..(tx + 1) * tile_w {
                    let sc = reflect101(c as isize, cols);
                    hist[image[[sr, sc]] as usize] += 1;
                }
            }
            if clip > 0 {
                clip_histogram(&mut hist, clip);
            }
            let mut lut = [0u8; BINS];
            let mut cumulative = 0usize;
            for (bin, slot) in lut.iter_mut().enumerate() {
                cumulative += hist[bin];
                *slot = saturate_u8(cumulative as f32 * lut_scale);
            }
            lut
        })
        .collect();

    let inv_th = 1.0f32 / tile_h as f32;
    let inv_tw = 1.0f32 / tile_w as f32;
    let columns: Vec<(usize, usize, f32)> = (0..cols)
        .map(|c| blend_position(c as f32 * inv_tw - 0.5, tiles_x))
        .collect();

    let mut out = vec![0u8; rows * cols];
    out.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
        let (ty1, ty2, ya) = blend_position(r as f32 * inv_th - 0.5, tiles_y);
        let ya1 = 1.0 - ya;
        let upper = ty1 * tiles_x;
        let lower = ty2 * tiles_x;
        for (c, slot) in row.iter_mut().enumerate() {
            let value = image[[r, c]] as usize;
            let (tx1, tx2, xa) = columns[c];
            let xa1 = 1.0 - xa;
            let top = luts[upper + tx1][value] as f32 * xa1 + luts[upper + tx2][value] as f32 * xa;
            let bottom =
                luts[lower + tx1][value] as f32 * xa1 + luts[lower + tx2][value] as f32 * xa;
            *slot = saturate_u8(top * ya1 + bottom * ya);
        }
    });
    into_image(rows, cols, out)
}

/// Neighbouring tile indices and the blend weight of the second one.
fn blend_position(coord: f32, tiles: usize) -> (usize, usize, f32) {
    let first = coord.floor();
    let weight = coord - first;
    let first = first as isize;
    let lo = first.max(0) as usize;
    let hi = ((first + 1) as usize).min(tiles - 1);
    (lo, hi, weight)
}

/// Clips every bin at `clip` and spreads the excess uniformly, handing the
/// remainder out one count at a time at a fixed stride.
fn clip_histogram(hist: &mut [usize; BINS], clip: usize) {
    let mut clipped = 0usize;
    for bin in hist.iter_mut() {
        if *bin > clip {
            clipped += *bin - clip;
            *bin = clip;
        }
    }
    let batch = clipped / BINS;
    let mut residual = clipped - batch * BINS;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (BINS / residual).max(1);
        let mut idx = 0;
        while idx < BINS && residual > 0 {
            hist[idx] += 1;
            residual -= 1;
            idx += step;
        }
    }
}

fn saturate_u8(value: f32) -> u8 {
    value.round_ties_even().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn constant_image_yields_zero_image() {
        let image = Array2::from_elem((20, 20), 7.25f32);
        let out = enhance_contrast(image.view()).unwrap();
        assert_eq!(out.dim(), (20, 20));
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn rescale_spans_full_range() {
        let image = Array2::from_shape_fn((2, 3), |(r, c)| (r * 3 + c) as f32);
        let scaled = rescale_to_u8(image.view()).unwrap().unwrap();
        assert_eq!(scaled[[0, 0]], 0);
        assert_eq!(scaled[[1, 2]], 255);
        // 51 exactly, truncated.
        assert_eq!(scaled[[0, 1]], 51);
    }

    #[test]
    fn output_keeps_shape_for_sizes_not_divisible_by_grid() {
        let image = Array2::from_shape_fn((37, 29), |(r, c)| ((r * 7 + c * 13) % 97) as f32);
        let out = enhance_contrast(image.view()).unwrap();
        assert_eq!(out.dim(), (37, 29));
    }

    #[test]
    fn equalisation_preserves_intensity_order_within_a_tile_grid_of_one() {
        let image = Array2::from_shape_fn((16, 16), |(r, c)| (r * 16 + c) as u8);
        let params = ClaheParams {
            clip_limit: 0.0,
            tile_grid: (1, 1),
        };
        let out = clahe(image.view(), &params).unwrap();
        let flat: Vec<u8> = out.iter().copied().collect();
        assert!(flat.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(flat[255], 255);
    }

    #[test]
    fn clipped_mass_is_conserved() {
        let mut hist = [0usize; BINS];
        hist[0] = 1000;
        hist[10] = 3;
        clip_histogram(&mut hist, 8);
        assert_eq!(hist.iter().sum::<usize>(), 1003);
        assert!(hist[0] <= 8 + 4);
    }

    #[test]
    fn tiny_images_are_supported() {
        let image = Array2::from_shape_fn((3, 3), |(r, c)| (r + c) as f32);
        let out = enhance_contrast(image.view()).unwrap();
        assert_eq!(out.dim(), (3, 3));
    }
}
