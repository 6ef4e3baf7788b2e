// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Encoder seam between the sample pipeline and the learned model.

pub mod checkpoint;
mod pooled;

pub use pooled::{PooledEncoderConfig, PooledLinearEncoder};

use ndarray::{Array2, ArrayView2, ArrayView4};

use crate::Result;

/// Maps `[B, C, H, W]` samples to `[B, D]` embeddings.
///
/// Gradients flow through [`Encoder::backward`] into internal accumulators and
/// are consumed by [`Encoder::apply_step`].
pub trait Encoder: Send {
    /// Tag stored in checkpoints and checked on load.
    fn architecture(&self) -> &'static str;

    fn input_channels(&self) -> usize;

    fn output_dim(&self) -> usize;

    /// Training mode updates running statistics on every forward pass;
    /// evaluation mode freezes them.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn forward(&mut self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>>;

    /// Accumulates parameter gradients for `grad_output = ∂L/∂forward(input)`.
    fn backward(&mut self, input: ArrayView4<'_, f32>, grad_output: ArrayView2<'_, f32>)
        -> Result<()>;

    /// Applies one SGD step from the accumulated gradients and clears them.
    fn apply_step(&mut self, learning_rate: f32) -> Result<()>;

    fn zero_accumulators(&mut self);

    fn save_state(&self) -> Result<Vec<u8>>;

    fn load_state(&mut self, bytes: &[u8]) -> Result<()>;
}
