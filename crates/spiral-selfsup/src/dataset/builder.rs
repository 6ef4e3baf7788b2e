// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Turns a `[T, 2, H, W]` radar cube into a fixed `[12, 64, 64]` sample.
//!
//! Each time step yields four images `[denoised VV, denoised VH, enhanced VV,
//! edges of enhanced VV]`. The stack is summarised over time as per-channel
//! mean, population standard deviation and last-minus-first difference, and
//! every summary channel is resampled to the target grid independently.

use ndarray::{stack, Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};
use rayon::prelude::*;
use st_vision::filters::{bilateral_filter, downsample_to, edge_magnitude, enhance_contrast_with};
use st_vision::{BilateralParams, ClaheParams};

use crate::{Result, SelfSupError};

/// Images produced per time step.
pub const FRAME_CHANNELS: usize = 4;
/// Channels of a finished sample: mean, std and diff of every frame channel.
pub const SUMMARY_CHANNELS: usize = 3 * FRAME_CHANNELS;
/// Polarisations expected per time step (VV, VH).
pub const POLARISATIONS: usize = 2;
/// Smallest spatial extent the 3×3 edge kernel supports.
pub const MIN_SPATIAL: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuilderConfig {
    pub bilateral: BilateralParams,
    pub clahe: ClaheParams,
    /// Output grid `(height, width)`.
    pub target: (usize, usize),
}

impl Default for SampleBuilderConfig {
    fn default() -> Self {
        Self {
            bilateral: BilateralParams::default(),
            clahe: ClaheParams::default(),
            target: (64, 64),
        }
    }
}

/// Deterministic preprocessing chain shared by training and extraction.
#[derive(Clone, Debug, Default)]
pub struct SampleBuilder {
    config: SampleBuilderConfig,
}

impl SampleBuilder {
    pub fn new(config: SampleBuilderConfig) -> Result<Self> {
        config.bilateral.validate()?;
        config.clahe.validate()?;
        if config.target.0 == 0 || config.target.1 == 0 {
            return Err(SelfSupError::InvalidArgument(format!(
                "target shape must be non-zero, got {:?}",
                config.target
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SampleBuilderConfig {
        &self.config
    }

    pub fn output_channels(&self) -> usize {
        SUMMARY_CHANNELS
    }

    /// `(channels, height, width)` of every built sample.
    pub fn output_shape(&self) -> (usize, usize, usize) {
        (SUMMARY_CHANNELS, self.config.target.0, self.config.target.1)
    }

    /// Rejects cubes the chain cannot summarise.
    pub fn check_dims(timesteps: usize, channels: usize, height: usize, width: usize) -> Result<()> {
        if timesteps < 2 {
            return Err(SelfSupError::Shape(format!(
                "need at least 2 time steps, got {timesteps}"
            )));
        }
        if channels != POLARISATIONS {
            return Err(SelfSupError::Shape(format!(
                "expected {POLARISATIONS} polarisation channels (VV, VH), got {channels}"
            )));
        }
        if height < MIN_SPATIAL || width < MIN_SPATIAL {
            return Err(SelfSupError::Shape(format!(
                "spatial extent must be at least {MIN_SPATIAL}x{MIN_SPATIAL}, got {height}x{width}"
            )));
        }
        Ok(())
    }

    pub fn build(&self, cube: ArrayView4<'_, f32>) -> Result<Array3<f32>> {
        let (t, c, h, w) = cube.dim();
        Self::check_dims(t, c, h, w)?;

        let frames = cube
            .outer_iter()
            .map(|step| {
                self.process_frame(
                    step.index_axis(Axis(0), 0),
                    step.index_axis(Axis(0), 1),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<ArrayView3<'_, f32>> = frames.iter().map(|frame| frame.view()).collect();
        let stacked = stack(Axis(0), &views).map_err(|err| SelfSupError::Shape(err.to_string()))?;

        let summary = temporal_summary(stacked.view());
        self.downsample_channels(summary.view())
    }

    /// `[4, H, W]` stack for one time step.
    pub fn process_frame(
        &self,
        vv: ArrayView2<'_, f32>,
        vh: ArrayView2<'_, f32>,
    ) -> Result<Array3<f32>> {
        let denoised_vv = bilateral_filter(vv, &self.config.bilateral)?;
        let denoised_vh = bilateral_filter(vh, &self.config.bilateral)?;
        let enhanced = enhance_contrast_with(denoised_vv.view(), &self.config.clahe)?;
        let edges = edge_magnitude(enhanced.view())?;
        let enhanced = enhanced.mapv(f32::from);
        stack(
            Axis(0),
            &[
                denoised_vv.view(),
                denoised_vh.view(),
                enhanced.view(),
                edges.view(),
            ],
        )
        .map_err(|err| SelfSupError::Shape(err.to_string()))
    }

    fn downsample_channels(&self, summary: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let channels: Vec<ArrayView2<'_, f32>> = summary.outer_iter().collect();
        let resized = channels
            .into_par_iter()
            .map(|channel| downsample_to(channel, self.config.target))
            .collect::<std::result::Result<Vec<Array2<f32>>, _>>()?;
        let views: Vec<ArrayView2<'_, f32>> = resized.iter().map(|image| image.view()).collect();
        stack(Axis(0), &views).map_err(|err| SelfSupError::Shape(err.to_string()))
    }
}

/// `[T, 4, H, W]` → `[12, H, W]` as `[mean, std, last - first]`.
///
/// Statistics accumulate in f64; the standard deviation uses the population
/// (biased) estimator.
pub fn temporal_summary(frames: ArrayView4<'_, f32>) -> Array3<f32> {
    let (t, c, h, w) = frames.dim();
    let mut summary = Array3::<f32>::zeros((3 * c, h, w));
    if t == 0 {
        return summary;
    }
    let count = t as f64;
    for channel in 0..c {
        let series = frames.index_axis(Axis(1), channel);
        let mut mean = Array2::<f64>::zeros((h, w));
        for step in series.outer_iter() {
            Zip::from(&mut mean).and(&step).for_each(|acc, &v| *acc += f64::from(v));
        }
        mean.mapv_inplace(|v| v / count);
        let mut var = Array2::<f64>::zeros((h, w));
        for step in series.outer_iter() {
            Zip::from(&mut var)
                .and(&mean)
                .and(&step)
                .for_each(|acc, &m, &v| {
                    let d = f64::from(v) - m;
                    *acc += d * d;
                });
        }

        summary
            .index_axis_mut(Axis(0), channel)
            .assign(&mean.mapv(|v| v as f32));
        summary
            .index_axis_mut(Axis(0), c + channel)
            .assign(&var.mapv(|v| (v / count).sqrt() as f32));
        let first = series.index_axis(Axis(0), 0);
        let last = series.index_axis(Axis(0), t - 1);
        summary
            .index_axis_mut(Axis(0), 2 * c + channel)
            .assign(&(&last - &first));
    }
    summary
}
