// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2, ArrayView2, ArrayView4, Axis, Ix1, Ix2, Zip};
use rand::Rng;
use serde::Deserialize;
use spiral_config::DeterminismConfig;
use tracing::debug;

use super::checkpoint::{EncoderSnapshot, StoredArray};
use super::Encoder;
use crate::{Result, SelfSupError};

const ARCHITECTURE: &str = "pooled-linear-v1";
const NORM_EPS: f32 = 1e-5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PooledEncoderConfig {
    pub input_channels: usize,
    pub output_dim: usize,
    /// Adaptive average pooling grid per channel.
    pub pool_grid: usize,
    /// Weight of the newest batch in the running statistics.
    pub momentum: f32,
    pub seed: Option<u64>,
}

impl Default for PooledEncoderConfig {
    fn default() -> Self {
        Self {
            input_channels: 12,
            output_dim: 1024,
            pool_grid: 8,
            momentum: 0.1,
            seed: None,
        }
    }
}

impl PooledEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 || self.output_dim == 0 || self.pool_grid == 0 {
            return Err(SelfSupError::InvalidArgument(format!(
                "encoder dimensions must be > 0 (channels={}, output={}, grid={})",
                self.input_channels, self.output_dim, self.pool_grid
            )));
        }
        if !(0.0..=1.0).contains(&self.momentum) {
            return Err(SelfSupError::InvalidArgument(format!(
                "momentum must lie in [0, 1], got {}",
                self.momentum
            )));
        }
        Ok(())
    }

    fn features(&self) -> usize {
        self.input_channels * self.pool_grid * self.pool_grid
    }
}

/// Reference encoder: per-channel adaptive average pooling, feature
/// standardisation with running statistics, and a linear projection.
///
/// Only the projection is trained. The statistics are treated as constants
/// when differentiating.
#[derive(Debug, Clone)]
pub struct PooledLinearEncoder {
    config: PooledEncoderConfig,
    weight: Array2<f32>,
    bias: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    grad_weight: Array2<f32>,
    grad_bias: Array1<f32>,
    training: bool,
}

impl PooledLinearEncoder {
    pub fn new(config: PooledEncoderConfig, determinism: &DeterminismConfig) -> Result<Self> {
        config.validate()?;
        let features = config.features();
        let bound = 1.0 / (features as f32).sqrt();
        let mut rng = determinism.rng_from_optional(config.seed, "spiral-selfsup/pooled-encoder");
        let weight = Array2::from_shape_simple_fn((features, config.output_dim), || {
            rng.gen_range(-bound..bound)
        });
        let bias = Array1::from_shape_simple_fn(config.output_dim, || rng.gen_range(-bound..bound));
        Ok(Self {
            weight,
            bias,
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
            grad_weight: Array2::zeros((features, config.output_dim)),
            grad_bias: Array1::zeros(config.output_dim),
            training: true,
            config,
        })
    }

    pub fn config(&self) -> &PooledEncoderConfig {
        &self.config
    }

    pub fn running_mean(&self) -> &Array1<f32> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Array1<f32> {
        &self.running_var
    }

    fn check_input(&self, input: &ArrayView4<'_, f32>) -> Result<()> {
        let (batch, channels, height, width) = input.dim();
        if batch == 0 || height == 0 || width == 0 {
            return Err(SelfSupError::Shape(format!(
                "encoder input must be non-empty, got {:?}",
                input.dim()
            )));
        }
        if channels != self.config.input_channels {
            return Err(SelfSupError::Shape(format!(
                "encoder expects {} channels, got {channels}",
                self.config.input_channels
            )));
        }
        Ok(())
    }

    /// `[B, C, H, W]` → `[B, C·g·g]` block means.
    fn pool(&self, input: ArrayView4<'_, f32>) -> Array2<f32> {
        let (batch, channels, height, width) = input.dim();
        let grid = self.config.pool_grid;
        let rows = adaptive_bins(height, grid);
        let cols = adaptive_bins(width, grid);
        let mut pooled = Array2::<f32>::zeros((batch, channels * grid * grid));
        Zip::from(pooled.outer_iter_mut())
            .and(input.outer_iter())
            .par_for_each(|mut features, sample| {
                for (ch, plane) in sample.outer_iter().enumerate() {
                    for (i, &(r0, r1)) in rows.iter().enumerate() {
                        for (j, &(c0, c1)) in cols.iter().enumerate() {
                            let block = plane.slice(s![r0..r1, c0..c1]);
                            let sum: f64 = block.iter().map(|&v| f64::from(v)).sum();
                            features[ch * grid * grid + i * grid + j] =
                                (sum / block.len() as f64) as f32;
                        }
                    }
                }
            });
        pooled
    }

    fn update_statistics(&mut self, pooled: &Array2<f32>) {
        let batch = pooled.nrows();
        if batch < 2 {
            debug!(batch, "running statistics need at least two samples; skipping update");
            return;
        }
        let momentum = self.config.momentum;
        let count = batch as f64;
        for (feature, column) in pooled.axis_iter(Axis(1)).enumerate() {
            let mean = column.iter().map(|&v| f64::from(v)).sum::<f64>() / count;
            let var = column
                .iter()
                .map(|&v| (f64::from(v) - mean).powi(2))
                .sum::<f64>()
                / (count - 1.0);
            self.running_mean[feature] =
                (1.0 - momentum) * self.running_mean[feature] + momentum * mean as f32;
            self.running_var[feature] =
                (1.0 - momentum) * self.running_var[feature] + momentum * var as f32;
        }
    }

    fn normalise(&self, mut pooled: Array2<f32>) -> Array2<f32> {
        let scale = self.running_var.mapv(|v| 1.0 / (v + NORM_EPS).sqrt());
        pooled -= &self.running_mean;
        pooled *= &scale;
        pooled
    }

    fn snapshot(&self) -> EncoderSnapshot {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "projection.weight".to_string(),
            StoredArray::from_view(self.weight.view().into_dyn()),
        );
        parameters.insert(
            "projection.bias".to_string(),
            StoredArray::from_view(self.bias.view().into_dyn()),
        );
        parameters.insert(
            "norm.running_mean".to_string(),
            StoredArray::from_view(self.running_mean.view().into_dyn()),
        );
        parameters.insert(
            "norm.running_var".to_string(),
            StoredArray::from_view(self.running_var.view().into_dyn()),
        );
        let mut hyper = BTreeMap::new();
        hyper.insert("pool_grid".to_string(), self.config.pool_grid);
        EncoderSnapshot {
            architecture: ARCHITECTURE.to_string(),
            input_channels: self.config.input_channels,
            output_dim: self.config.output_dim,
            hyper,
            parameters,
        }
    }
}

/// `grid` half-open ranges covering `0..len`, as adaptive average pooling
/// splits an axis.
fn adaptive_bins(len: usize, grid: usize) -> Vec<(usize, usize)> {
    (0..grid)
        .map(|i| (i * len / grid, ((i + 1) * len).div_ceil(grid)))
        .collect()
}

fn conversion_error(name: &str, err: impl std::fmt::Display) -> SelfSupError {
    SelfSupError::Checkpoint(format!("parameter `{name}`: {err}"))
}

impl Encoder for PooledLinearEncoder {
    fn architecture(&self) -> &'static str {
        ARCHITECTURE
    }

    fn input_channels(&self) -> usize {
        self.config.input_channels
    }

    fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn forward(&mut self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        self.check_input(&input)?;
        let pooled = self.pool(input);
        if self.training {
            self.update_statistics(&pooled);
        }
        let features = self.normalise(pooled);
        Ok(features.dot(&self.weight) + &self.bias)
    }

    fn backward(
        &mut self,
        input: ArrayView4<'_, f32>,
        grad_output: ArrayView2<'_, f32>,
    ) -> Result<()> {
        self.check_input(&input)?;
        if grad_output.dim() != (input.len_of(Axis(0)), self.config.output_dim) {
            return Err(SelfSupError::Shape(format!(
                "gradient shape {:?} does not match batch {} x output {}",
                grad_output.dim(),
                input.len_of(Axis(0)),
                self.config.output_dim
            )));
        }
        let features = self.normalise(self.pool(input));
        self.grad_weight += &features.t().dot(&grad_output);
        self.grad_bias += &grad_output.sum_axis(Axis(0));
        Ok(())
    }

    fn apply_step(&mut self, learning_rate: f32) -> Result<()> {
        if !learning_rate.is_finite() || learning_rate < 0.0 {
            return Err(SelfSupError::InvalidArgument(format!(
                "learning rate must be >= 0, got {learning_rate}"
            )));
        }
        self.weight.scaled_add(-learning_rate, &self.grad_weight);
        self.bias.scaled_add(-learning_rate, &self.grad_bias);
        self.zero_accumulators();
        Ok(())
    }

    fn zero_accumulators(&mut self) {
        self.grad_weight.fill(0.0);
        self.grad_bias.fill(0.0);
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        self.snapshot().to_bytes()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<()> {
        let mut snapshot = EncoderSnapshot::from_bytes(bytes)?;
        if snapshot.architecture != ARCHITECTURE {
            return Err(SelfSupError::Checkpoint(format!(
                "checkpoint architecture `{}` does not match `{ARCHITECTURE}`",
                snapshot.architecture
            )));
        }
        let grid = snapshot.hyper.get("pool_grid").copied();
        if snapshot.input_channels != self.config.input_channels
            || snapshot.output_dim != self.config.output_dim
            || grid != Some(self.config.pool_grid)
        {
            return Err(SelfSupError::Checkpoint(format!(
                "checkpoint shape (channels={}, output={}, grid={grid:?}) does not match encoder \
                 (channels={}, output={}, grid={})",
                snapshot.input_channels,
                snapshot.output_dim,
                self.config.input_channels,
                self.config.output_dim,
                self.config.pool_grid
            )));
        }
        let features = self.config.features();
        let output = self.config.output_dim;
        let weight = snapshot
            .take("projection.weight", &[features, output])?
            .into_dimensionality::<Ix2>()
            .map_err(|err| conversion_error("projection.weight", err))?;
        let bias = snapshot
            .take("projection.bias", &[output])?
            .into_dimensionality::<Ix1>()
            .map_err(|err| conversion_error("projection.bias", err))?;
        let running_mean = snapshot
            .take("norm.running_mean", &[features])?
            .into_dimensionality::<Ix1>()
            .map_err(|err| conversion_error("norm.running_mean", err))?;
        let running_var = snapshot
            .take("norm.running_var", &[features])?
            .into_dimensionality::<Ix1>()
            .map_err(|err| conversion_error("norm.running_var", err))?;

        self.weight = weight;
        self.bias = bias;
        self.running_mean = running_mean;
        self.running_var = running_var;
        self.zero_accumulators();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn small_config() -> PooledEncoderConfig {
        PooledEncoderConfig {
            input_channels: 2,
            output_dim: 6,
            pool_grid: 2,
            momentum: 0.5,
            seed: Some(3),
        }
    }

    fn inputs(batch: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, 2, 5, 4), |(b, c, h, w)| {
            (b * 3 + c * 5) as f32 + (h * 4 + w) as f32 * 0.25
        })
    }

    #[test]
    fn adaptive_bins_cover_uneven_axes() {
        assert_eq!(adaptive_bins(5, 2), vec![(0, 3), (2, 5)]);
        assert_eq!(adaptive_bins(64, 8)[7], (56, 64));
        assert_eq!(adaptive_bins(2, 4), vec![(0, 1), (0, 1), (1, 2), (1, 2)]);
    }

    #[test]
    fn forward_produces_one_row_per_sample() {
        let mut encoder = PooledLinearEncoder::new(small_config(), &DeterminismConfig::default())
            .unwrap();
        let out = encoder.forward(inputs(3).view()).unwrap();
        assert_eq!(out.dim(), (3, 6));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn eval_mode_freezes_statistics() {
        let mut encoder = PooledLinearEncoder::new(small_config(), &DeterminismConfig::default())
            .unwrap();
        encoder.set_training(false);
        let before = encoder.running_mean().clone();
        encoder.forward(inputs(4).view()).unwrap();
        assert_eq!(encoder.running_mean(), &before);

        encoder.set_training(true);
        encoder.forward(inputs(4).view()).unwrap();
        assert_ne!(encoder.running_mean(), &before);
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let mut encoder = PooledLinearEncoder::new(small_config(), &DeterminismConfig::default())
            .unwrap();
        let bad = Array4::<f32>::zeros((1, 3, 4, 4));
        assert!(matches!(encoder.forward(bad.view()), Err(SelfSupError::Shape(_))));
    }

    #[test]
    fn gradient_step_follows_linear_projection() {
        let mut encoder = PooledLinearEncoder::new(small_config(), &DeterminismConfig::default())
            .unwrap();
        encoder.set_training(false);
        let x = inputs(2);
        let before = encoder.forward(x.view()).unwrap();
        // L = sum(outputs) → ∂L/∂y = 1; one step must lower L.
        let ones = Array2::<f32>::ones(before.dim());
        encoder.backward(x.view(), ones.view()).unwrap();
        encoder.apply_step(0.01).unwrap();
        let after = encoder.forward(x.view()).unwrap();
        assert!(after.sum() < before.sum());
    }

    #[test]
    fn state_round_trip_restores_outputs() {
        let mut trained = PooledLinearEncoder::new(small_config(), &DeterminismConfig::default())
            .unwrap();
        trained.forward(inputs(4).view()).unwrap();
        trained.set_training(false);
        let bytes = trained.save_state().unwrap();

        let mut restored = PooledLinearEncoder::new(
            PooledEncoderConfig {
                seed: Some(99),
                ..small_config()
            },
            &DeterminismConfig::default(),
        )
        .unwrap();
        restored.load_state(&bytes).unwrap();
        restored.set_training(false);
        assert_eq!(
            trained.forward(inputs(2).view()).unwrap(),
            restored.forward(inputs(2).view()).unwrap()
        );

        let mut wider = PooledLinearEncoder::new(
            PooledEncoderConfig {
                output_dim: 7,
                ..small_config()
            },
            &DeterminismConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            wider.load_state(&bytes),
            Err(SelfSupError::Checkpoint(_))
        ));
    }
}
