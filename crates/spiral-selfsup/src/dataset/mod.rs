//! Lazily built SAR samples and the augmented view pairs fed to the trainer.

pub mod builder;
pub mod index;
pub mod loader;
pub mod store;

pub use builder::{temporal_summary, SampleBuilder, SampleBuilderConfig, SUMMARY_CHANNELS};
pub use index::{DatasetIndex, SampleEntry, SamplePair};
pub use loader::{Batch, DataLoader};
#[cfg(feature = "zarr")]
pub use store::ZarrCubeSource;
pub use store::{BandsShape, CubeHandle, CubeSource, MemoryCubeSource, RadarCube};

use ndarray::{stack, Array3, Array4, ArrayView3, Axis};
use rand::{rngs::StdRng, Rng};
use spiral_config::DeterminismConfig;
use st_vision::transforms::{TransformOperation, TransformPipeline};
use tracing::warn;

use crate::{Result, SelfSupError};

/// Pair of augmented views of one batch, `[B, C, H, W]` each.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewPair {
    pub anchor: Array4<f32>,
    pub positive: Array4<f32>,
}

fn clone_operations(pipeline: Option<&TransformPipeline>) -> Vec<TransformOperation> {
    pipeline
        .map(|p| p.operations().to_vec())
        .unwrap_or_default()
}

fn reseeded_pipeline(ops: &[TransformOperation], seed: u64) -> TransformPipeline {
    let mut pipeline = TransformPipeline::with_seed(seed);
    for op in ops {
        pipeline.add(op.clone());
    }
    pipeline
}

/// Produces two independently augmented copies of every sample.
///
/// Each copy is transformed by a fresh pipeline reseeded from this sampler's
/// RNG, so the two views of a sample differ while the whole sequence stays
/// reproducible for a fixed seed.
#[derive(Debug)]
pub struct ViewPairSampler {
    rng: StdRng,
    operations: Vec<TransformOperation>,
}

impl ViewPairSampler {
    pub fn new(
        pipeline: Option<&TransformPipeline>,
        seed: Option<u64>,
        determinism: &DeterminismConfig,
    ) -> Self {
        let operations = clone_operations(pipeline);
        if operations.is_empty() {
            warn!("augmentation pipeline is empty; both views of every sample will be identical");
        }
        Self {
            rng: determinism.rng_from_optional(seed, "spiral-selfsup/view_pair_sampler"),
            operations,
        }
    }

    pub fn operations(&self) -> &[TransformOperation] {
        &self.operations
    }

    fn augment(&mut self, sample: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let mut view = sample.to_owned();
        if !self.operations.is_empty() {
            let seed = self.rng.gen();
            reseeded_pipeline(&self.operations, seed).apply(&mut view)?;
        }
        Ok(view)
    }

    pub fn sample_pair(&mut self, sample: ArrayView3<'_, f32>) -> Result<(Array3<f32>, Array3<f32>)> {
        let anchor = self.augment(sample)?;
        let positive = self.augment(sample)?;
        Ok((anchor, positive))
    }

    pub fn sample_batch(&mut self, inputs: &Array4<f32>) -> Result<ViewPair> {
        let mut anchors = Vec::with_capacity(inputs.len_of(Axis(0)));
        let mut positives = Vec::with_capacity(inputs.len_of(Axis(0)));
        for sample in inputs.outer_iter() {
            let (anchor, positive) = self.sample_pair(sample)?;
            anchors.push(anchor);
            positives.push(positive);
        }
        Ok(ViewPair {
            anchor: stack_views(&anchors)?,
            positive: stack_views(&positives)?,
        })
    }
}

fn stack_views(views: &[Array3<f32>]) -> Result<Array4<f32>> {
    let views: Vec<ArrayView3<'_, f32>> = views.iter().map(|view| view.view()).collect();
    stack(Axis(0), &views).map_err(|err| SelfSupError::Shape(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_vision::transforms::RandomHorizontalFlip;

    fn batch() -> Array4<f32> {
        Array4::from_shape_fn((3, 2, 4, 4), |(b, c, h, w)| {
            (b * 100 + c * 16 + h * 4 + w) as f32
        })
    }

    #[test]
    fn empty_pipeline_returns_identical_views() {
        let mut sampler = ViewPairSampler::new(None, Some(1), &DeterminismConfig::default());
        let pair = sampler.sample_batch(&batch()).unwrap();
        assert_eq!(pair.anchor, pair.positive);
        assert_eq!(pair.anchor, batch());
    }

    #[test]
    fn fixed_seed_reproduces_views() {
        let pipeline = TransformPipeline::simclr_default(0).unwrap();
        let config = DeterminismConfig::default();
        let mut a = ViewPairSampler::new(Some(&pipeline), Some(5), &config);
        let mut b = ViewPairSampler::new(Some(&pipeline), Some(5), &config);
        assert_eq!(
            a.sample_batch(&batch()).unwrap(),
            b.sample_batch(&batch()).unwrap()
        );
    }

    #[test]
    fn views_diverge_under_augmentation() {
        let mut pipeline = TransformPipeline::with_seed(0);
        pipeline.add(TransformOperation::HorizontalFlip(
            RandomHorizontalFlip::new(0.5).unwrap(),
        ));
        let mut sampler =
            ViewPairSampler::new(Some(&pipeline), Some(9), &DeterminismConfig::default());
        let inputs = Array4::from_shape_fn((32, 1, 2, 2), |(_, _, h, w)| (h * 2 + w) as f32);
        let pair = sampler.sample_batch(&inputs).unwrap();
        assert_ne!(pair.anchor, pair.positive);
    }
}
