// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Seeded view augmentations over `[C, H, W]` sample tensors.
//!
//! A [`TransformPipeline`] owns its RNG, so two pipelines built with the same
//! seed and operations produce identical views.

use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{Result, VisionError};

fn check_probability(label: &'static str, probability: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&probability) {
        return Err(VisionError::InvalidParameter {
            label,
            message: format!("probability must lie in [0, 1], got {probability}"),
        });
    }
    Ok(probability)
}

/// Mirrors the width axis with probability `p`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RandomHorizontalFlip {
    p: f32,
}

impl RandomHorizontalFlip {
    pub fn new(p: f32) -> Result<Self> {
        Ok(Self {
            p: check_probability("horizontal_flip.p", p)?,
        })
    }
}

/// Mirrors the height axis with probability `p`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RandomVerticalFlip {
    p: f32,
}

impl RandomVerticalFlip {
    pub fn new(p: f32) -> Result<Self> {
        Ok(Self {
            p: check_probability("vertical_flip.p", p)?,
        })
    }
}

/// Rotates by a uniformly drawn multiple of 90° with probability `p`.
///
/// Non-square images are left untouched so the output shape never changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RandomRot90 {
    p: f32,
}

impl RandomRot90 {
    pub fn new(p: f32) -> Result<Self> {
        Ok(Self {
            p: check_probability("rot90.p", p)?,
        })
    }
}

/// Additive zero-mean Gaussian noise whose deviation is `relative_std` times
/// the channel's own standard deviation. Constant channels stay constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianNoise {
    relative_std: f32,
}

impl GaussianNoise {
    pub fn new(relative_std: f32) -> Result<Self> {
        if !relative_std.is_finite() || relative_std < 0.0 {
            return Err(VisionError::InvalidParameter {
                label: "gaussian_noise.relative_std",
                message: format!("deviation must be >= 0, got {relative_std}"),
            });
        }
        Ok(Self { relative_std })
    }
}

/// Single stage of a [`TransformPipeline`].
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    HorizontalFlip(RandomHorizontalFlip),
    VerticalFlip(RandomVerticalFlip),
    Rot90(RandomRot90),
    GaussianNoise(GaussianNoise),
}

impl TransformOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HorizontalFlip(_) => "RandomHorizontalFlip",
            Self::VerticalFlip(_) => "RandomVerticalFlip",
            Self::Rot90(_) => "RandomRot90",
            Self::GaussianNoise(_) => "GaussianNoise",
        }
    }

    fn apply(&self, image: &mut Array3<f32>, rng: &mut StdRng) -> Result<()> {
        match self {
            Self::HorizontalFlip(op) => {
                if rng.gen::<f32>() < op.p {
                    image.invert_axis(Axis(2));
                }
            }
            Self::VerticalFlip(op) => {
                if rng.gen::<f32>() < op.p {
                    image.invert_axis(Axis(1));
                }
            }
            Self::Rot90(op) => {
                let (_, height, width) = image.dim();
                if height == width && rng.gen::<f32>() < op.p {
                    for _ in 0..rng.gen_range(1..4) {
                        image.swap_axes(1, 2);
                        image.invert_axis(Axis(2));
                    }
                }
            }
            Self::GaussianNoise(op) => {
                if op.relative_std == 0.0 {
                    return Ok(());
                }
                for mut channel in image.axis_iter_mut(Axis(0)) {
                    let std = channel.std(0.0) * op.relative_std;
                    if !std.is_finite() || std <= 0.0 {
                        continue;
                    }
                    let normal = Normal::new(0.0f32, std).map_err(|err| {
                        VisionError::InvalidParameter {
                            label: "gaussian_noise.relative_std",
                            message: err.to_string(),
                        }
                    })?;
                    channel.mapv_inplace(|v| v + normal.sample(rng));
                }
            }
        }
        Ok(())
    }
}

/// Ordered list of augmentations driven by a private seeded RNG.
#[derive(Clone, Debug)]
pub struct TransformPipeline {
    seed: u64,
    rng: StdRng,
    operations: Vec<TransformOperation>,
}

impl TransformPipeline {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
            operations: Vec::new(),
        }
    }

    /// Flips, right-angle rotations and mild relative noise.
    pub fn simclr_default(seed: u64) -> Result<Self> {
        let mut pipeline = Self::with_seed(seed);
        pipeline
            .add(TransformOperation::HorizontalFlip(RandomHorizontalFlip::new(0.5)?))
            .add(TransformOperation::VerticalFlip(RandomVerticalFlip::new(0.5)?))
            .add(TransformOperation::Rot90(RandomRot90::new(0.5)?))
            .add(TransformOperation::GaussianNoise(GaussianNoise::new(0.05)?));
        Ok(pipeline)
    }

    pub fn add(&mut self, operation: TransformOperation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn operations(&self) -> &[TransformOperation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Applies every stage in order. The result is always in standard layout.
    pub fn apply(&mut self, image: &mut Array3<f32>) -> Result<()> {
        let (channels, height, width) = image.dim();
        if channels == 0 || height == 0 || width == 0 {
            return Err(VisionError::EmptyImage {
                label: "transform_pipeline",
                rows: height,
                cols: width,
            });
        }
        for operation in &self.operations {
            operation.apply(image, &mut self.rng)?;
        }
        if !image.is_standard_layout() {
            *image = image.as_standard_layout().into_owned();
        }
        Ok(())
    }
}
