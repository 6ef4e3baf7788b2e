// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{concatenate, s, Array4, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use spiral_config::RuntimeConfig;
use st_vision::transforms::TransformPipeline;
use tracing::{debug, info, instrument};

use super::device::{CpuDevice, TrainingDevice};
use crate::config::TrainConfig;
use crate::contrastive::{nt_xent_loss_with_grad, NtXentResult};
use crate::dataset::{CubeSource, DataLoader, DatasetIndex, ViewPairSampler};
use crate::encoder::Encoder;
use crate::metrics::{publish, register_nt_xent_descriptors, NtXentEpochMetrics, NtXentSummary};
use crate::{Result, SelfSupError};

/// SimCLR-style trainer: two augmented views per sample, NT-Xent on their
/// projections, one SGD step per batch.
#[derive(Debug)]
pub struct SimClrTrainer<D: TrainingDevice = CpuDevice> {
    config: TrainConfig,
    sampler: ViewPairSampler,
    shuffle_rng: StdRng,
    workers: usize,
    device: D,
}

impl SimClrTrainer<CpuDevice> {
    pub fn new(
        config: TrainConfig,
        pipeline: &TransformPipeline,
        runtime: &RuntimeConfig,
    ) -> Result<Self> {
        let device = CpuDevice::for_resolved(&runtime.resolve_device());
        Self::with_device(config, pipeline, runtime, device)
    }
}

impl<D: TrainingDevice> SimClrTrainer<D> {
    pub fn with_device(
        config: TrainConfig,
        pipeline: &TransformPipeline,
        runtime: &RuntimeConfig,
        device: D,
    ) -> Result<Self> {
        config.validate()?;
        register_nt_xent_descriptors();
        let determinism = &runtime.determinism;
        let sampler = ViewPairSampler::new(Some(pipeline), config.seed, determinism);
        let shuffle_rng = determinism.rng_from_optional(
            config.seed.map(|seed| seed.wrapping_add(1)),
            "spiral-selfsup/simclr-shuffle",
        );
        Ok(Self {
            config,
            sampler,
            shuffle_rng,
            workers: runtime.workers,
            device,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Runs every configured epoch and returns their metrics in order.
    #[instrument(skip_all, fields(samples = index.len(), epochs = self.config.epochs))]
    pub fn train<S, E>(
        &mut self,
        encoder: &mut E,
        index: &DatasetIndex<S>,
    ) -> Result<Vec<NtXentEpochMetrics>>
    where
        S: CubeSource,
        E: Encoder + ?Sized,
    {
        if index.is_empty() {
            return Err(SelfSupError::InvalidArgument(
                "training index contains no samples".to_string(),
            ));
        }
        if encoder.input_channels() != index.builder().output_channels() {
            return Err(SelfSupError::Shape(format!(
                "encoder expects {} channels but samples carry {}",
                encoder.input_channels(),
                index.builder().output_channels()
            )));
        }
        encoder.set_training(true);
        (0..self.config.epochs)
            .map(|epoch| self.train_epoch(encoder, index, epoch))
            .collect()
    }

    pub fn train_epoch<S, E>(
        &mut self,
        encoder: &mut E,
        index: &DatasetIndex<S>,
        epoch: usize,
    ) -> Result<NtXentEpochMetrics>
    where
        S: CubeSource,
        E: Encoder + ?Sized,
    {
        let loader = DataLoader::new(index)
            .shuffle(self.shuffle_rng.gen())
            .batched(self.config.batch_size)
            .with_workers(self.workers)?;

        let mut loss_sum = 0.0f32;
        let mut top1_sum = 0.0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let batch = batch?;
            let result = self.train_step(encoder, &batch.inputs)?;
            let summary = NtXentSummary::from_result(&result);
            debug!(
                epoch,
                batch = batches,
                loss = summary.loss,
                top1 = summary.top1_accuracy,
                margin = summary.mean_positive_margin
            );
            loss_sum += summary.loss;
            top1_sum += summary.top1_accuracy;
            batches += 1;
        }

        let denom = batches.max(1) as f32;
        let metrics = NtXentEpochMetrics {
            mean_loss: loss_sum / denom,
            batches,
            top1_accuracy: top1_sum / denom,
        };
        info!(
            epoch,
            mean_loss = metrics.mean_loss,
            top1 = metrics.top1_accuracy,
            batches = metrics.batches,
            device = %self.device.device(),
            "epoch finished"
        );
        publish(&metrics.to_values());
        Ok(metrics)
    }

    /// Augments `inputs` twice, evaluates NT-Xent on both projections in one
    /// forward pass and applies a single update.
    pub fn train_step<E: Encoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        inputs: &Array4<f32>,
    ) -> Result<NtXentResult> {
        let batch = inputs.len_of(Axis(0));
        let views = self.sampler.sample_batch(inputs)?;
        let combined = concatenate(Axis(0), &[views.anchor.view(), views.positive.view()])
            .map_err(|err| SelfSupError::Shape(err.to_string()))?;

        let projections = encoder.forward(combined.view())?;
        let (result, grads) = nt_xent_loss_with_grad(
            projections.slice(s![..batch, ..]),
            projections.slice(s![batch.., ..]),
            &self.config.loss(),
        )?;
        let grad = concatenate(Axis(0), &[grads.z_i.view(), grads.z_j.view()])
            .map_err(|err| SelfSupError::Shape(err.to_string()))?;
        encoder.backward(combined.view(), grad.view())?;
        encoder.apply_step(self.config.learning_rate)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AugmentConfig;
    use crate::encoder::{PooledEncoderConfig, PooledLinearEncoder};
    use ndarray::Array4;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use spiral_config::DeterminismConfig;

    fn trainer(seed: u64, augment: AugmentConfig, learning_rate: f32) -> SimClrTrainer {
        let config = TrainConfig {
            epochs: 1,
            batch_size: 4,
            learning_rate,
            seed: Some(seed),
            augment,
            ..TrainConfig::default()
        };
        let pipeline = config.augment.to_pipeline(seed).unwrap();
        SimClrTrainer::new(config, &pipeline, &RuntimeConfig::default()).unwrap()
    }

    fn encoder(momentum: f32) -> PooledLinearEncoder {
        PooledLinearEncoder::new(
            PooledEncoderConfig {
                input_channels: 12,
                output_dim: 16,
                pool_grid: 2,
                momentum,
                seed: Some(1),
            },
            &DeterminismConfig::default(),
        )
        .unwrap()
    }

    fn inputs() -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(17);
        Array4::from_shape_fn((4, 12, 8, 8), |_| rng.gen_range(-1.0f32..1.0))
    }

    #[test]
    fn repeated_steps_reduce_the_loss_on_fixed_views() {
        let no_augmentation = AugmentConfig {
            horizontal_flip: 0.0,
            vertical_flip: 0.0,
            rot90: 0.0,
            noise_std: 0.0,
        };
        let mut trainer = trainer(3, no_augmentation, 0.002);
        let mut encoder = encoder(0.0);
        let x = inputs();
        let first = trainer.train_step(&mut encoder, &x).unwrap();
        let mut last = first.loss;
        for _ in 0..30 {
            last = trainer.train_step(&mut encoder, &x).unwrap().loss;
        }
        assert!(last < first.loss, "{last} >= {}", first.loss);
        assert_eq!(first.batch, 4);
    }

    #[test]
    fn fixed_seeds_make_training_reproducible() {
        let x = inputs();
        let run = || {
            let mut trainer = trainer(11, AugmentConfig::default(), 0.05);
            let mut encoder = encoder(0.1);
            (0..3)
                .map(|_| trainer.train_step(&mut encoder, &x).unwrap().loss)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
