// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::sync::Arc;

use ndarray::{stack, Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::index::DatasetIndex;
use super::store::CubeSource;
use crate::{Result, SelfSupError};

/// Stacked samples with the dataset positions they came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub indices: Vec<usize>,
    /// `[B, C, H, W]`.
    pub inputs: Array4<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn stack_batch(indices: Vec<usize>, samples: &[Array3<f32>]) -> Result<Batch> {
    let views: Vec<ArrayView3<'_, f32>> = samples.iter().map(|sample| sample.view()).collect();
    let inputs = stack(Axis(0), &views).map_err(|err| SelfSupError::Shape(err.to_string()))?;
    Ok(Batch { indices, inputs })
}

/// Batches a [`DatasetIndex`] in a fixed or shuffled order, building each
/// sample on demand.
pub struct DataLoader<'a, S: CubeSource> {
    index: &'a DatasetIndex<S>,
    order: Vec<usize>,
    batch_size: usize,
    pool: Option<Arc<ThreadPool>>,
}

impl<'a, S: CubeSource> DataLoader<'a, S> {
    /// Sequential loader over the index in dataset order, batch size 1.
    pub fn new(index: &'a DatasetIndex<S>) -> Self {
        Self {
            index,
            order: (0..index.len()).collect(),
            batch_size: 1,
            pool: None,
        }
    }

    /// Permutes the visiting order with a seeded RNG.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self
    }

    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fetches the samples of each batch on a dedicated pool of `workers`
    /// threads. `1` keeps fetching on the caller's thread; `0` sizes the pool
    /// to the machine.
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        self.pool = if workers == 1 {
            None
        } else {
            let pool = ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("sample-fetch-{i}"))
                .build()
                .map_err(|err| SelfSupError::InvalidArgument(err.to_string()))?;
            Some(Arc::new(pool))
        };
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Number of batches, counting a trailing partial one.
    pub fn len(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> Batches<'_, 'a, S> {
        Batches {
            loader: self,
            position: 0,
        }
    }

    fn fetch(&self, indices: &[usize]) -> Result<Vec<Array3<f32>>> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&idx| self.index.sample(idx))
                    .collect()
            }),
            None => indices.iter().map(|&idx| self.index.sample(idx)).collect(),
        }
    }
}

/// Iterator over the batches of a [`DataLoader`].
pub struct Batches<'l, 'a, S: CubeSource> {
    loader: &'l DataLoader<'a, S>,
    position: usize,
}

impl<S: CubeSource> Iterator for Batches<'_, '_, S> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let order = &self.loader.order;
        if self.position >= order.len() {
            return None;
        }
        let start = self.position;
        let end = (start + self.loader.batch_size).min(order.len());
        self.position = end;
        let indices = order[start..end].to_vec();
        Some(
            self.loader
                .fetch(&indices)
                .and_then(|samples| stack_batch(indices, &samples)),
        )
    }
}
