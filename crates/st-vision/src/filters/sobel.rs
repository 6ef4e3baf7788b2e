// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::{ensure_non_empty, into_image};
use crate::border::reflect101;
use crate::Result;

/// Gradient magnitude `sqrt(gx² + gy²)` from 3×3 Sobel derivatives.
pub fn edge_magnitude<T>(image: ArrayView2<'_, T>) -> Result<Array2<f32>>
where
    T: Copy + Into<f32> + Sync,
{
    let (rows, cols) = ensure_non_empty(&image, "edge_magnitude")?;
    let source: Vec<f32> = image.iter().map(|&v| v.into()).collect();

    let mut out = vec![0.0f32; rows * cols];
    out.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
        let up = reflect101(r as isize - 1, rows) * cols;
        let mid = r * cols;
        let down = reflect101(r as isize + 1, rows) * cols;
        for (c, slot) in row.iter_mut().enumerate() {
            let left = reflect101(c as isize - 1, cols);
            let right = reflect101(c as isize + 1, cols);
            let g = |base: usize, col: usize| source[base + col];
            let gx = (g(up, right) - g(up, left))
                + 2.0 * (g(mid, right) - g(mid, left))
                + (g(down, right) - g(down, left));
            let gy = (g(down, left) + 2.0 * g(down, c) + g(down, right))
                - (g(up, left) + 2.0 * g(up, c) + g(up, right));
            *slot = (gx * gx + gy * gy).sqrt();
        }
    });
    into_image(rows, cols, out)
}
