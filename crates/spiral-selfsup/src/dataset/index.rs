// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array3;
use tracing::{debug, info, instrument};

use super::builder::SampleBuilder;
use super::store::{CubeHandle, CubeSource};
use crate::{Result, SelfSupError};

/// Extension identifying collections under the dataset root.
pub const COLLECTION_EXTENSION: &str = "zarr";

/// One addressable sample: a collection and the offset inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleEntry {
    pub collection: PathBuf,
    pub offset: usize,
}

/// Two copies of the same built sample.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplePair {
    pub input: Array3<f32>,
    pub target: Array3<f32>,
}

/// Flat, ordered index over every sample of every collection under a root.
///
/// Only shapes are read at construction time. Pixel data is fetched and
/// preprocessed on each [`DatasetIndex::get`].
#[derive(Debug)]
pub struct DatasetIndex<S: CubeSource> {
    source: S,
    builder: SampleBuilder,
    entries: Vec<SampleEntry>,
    collections: usize,
}

impl<S: CubeSource> DatasetIndex<S> {
    /// Lists `root`, sorts entries by name, keeps the first `limit` entries
    /// and indexes those with the collection extension.
    ///
    /// Entries that cannot be opened as a collection are skipped. A collection
    /// that opens but whose samples cannot be built fails the whole build.
    #[instrument(skip(root, source, builder), fields(root = %root.display()))]
    pub fn build(
        root: &Path,
        limit: Option<usize>,
        source: S,
        builder: SampleBuilder,
    ) -> Result<Self> {
        let listing = fs::read_dir(root).map_err(|err| SelfSupError::io(root, err))?;
        let mut names = Vec::new();
        for entry in listing {
            let entry = entry.map_err(|err| SelfSupError::io(root, err))?;
            names.push(entry.file_name());
        }
        names.sort();
        if let Some(limit) = limit {
            names.truncate(limit);
        }

        let mut entries = Vec::new();
        let mut collections = 0usize;
        for name in names {
            let path = root.join(&name);
            if path.extension().and_then(|ext| ext.to_str()) != Some(COLLECTION_EXTENSION) {
                debug!(entry = %path.display(), "skipping non-collection entry");
                continue;
            }
            let shape = match source.open(&path) {
                Ok(handle) => handle.shape(),
                Err(err) => {
                    debug!(entry = %path.display(), error = %err, "skipping unreadable collection");
                    continue;
                }
            };
            let (t, c, h, w) = shape.sample_dims();
            SampleBuilder::check_dims(t, c, h, w).map_err(|err| {
                SelfSupError::Shape(format!("{}: {err}", path.display()))
            })?;
            entries.extend((0..shape.samples).map(|offset| SampleEntry {
                collection: path.clone(),
                offset,
            }));
            collections += 1;
        }

        info!(collections, samples = entries.len(), "dataset index built");
        Ok(Self {
            source,
            builder,
            entries,
            collections,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of collections that contributed samples.
    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn entries(&self) -> &[SampleEntry] {
        &self.entries
    }

    pub fn builder(&self) -> &SampleBuilder {
        &self.builder
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Builds the sample at `index` and returns it twice.
    pub fn get(&self, index: usize) -> Result<SamplePair> {
        let input = self.sample(index)?;
        let target = input.clone();
        Ok(SamplePair { input, target })
    }

    /// Builds the sample at `index`. The collection is open only while its
    /// slice is read.
    pub fn sample(&self, index: usize) -> Result<Array3<f32>> {
        let entry = self.entries.get(index).ok_or_else(|| {
            SelfSupError::InvalidArgument(format!(
                "index {index} out of range for {} samples",
                self.entries.len()
            ))
        })?;
        let cube = {
            let handle = self.source.open(&entry.collection)?;
            handle.read_sample(entry.offset)?
        };
        self.builder.build(cube.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::store::MemoryCubeSource;
    use ndarray::{Array5, ArrayD, IxDyn};
    use tempfile::tempdir;

    fn bands(samples: usize) -> ArrayD<f32> {
        Array5::from_shape_fn((samples, 2, 2, 6, 6), |(n, t, c, h, w)| {
            (n + t + c + h * w) as f32
        })
        .into_dyn()
    }

    #[test]
    fn sorts_limits_then_filters() {
        let root = tempdir().unwrap();
        let mut source = MemoryCubeSource::new();
        for (name, samples) in [("b.zarr", 2), ("a.zarr", 3), ("c.zarr", 4)] {
            std::fs::create_dir(root.path().join(name)).unwrap();
            source.insert(root.path().join(name), bands(samples));
        }
        std::fs::write(root.path().join("0_notes.txt"), "x").unwrap();

        // "0_notes.txt", "a.zarr", "b.zarr" survive the limit; the text file is dropped.
        let index =
            DatasetIndex::build(root.path(), Some(3), source, SampleBuilder::default()).unwrap();
        assert_eq!(index.len(), 5);
        assert_eq!(index.collections(), 2);
        assert!(index.entries()[0].collection.ends_with("a.zarr"));
        assert_eq!(index.entries()[2].offset, 2);
        assert!(index.entries()[3].collection.ends_with("b.zarr"));
    }

    #[test]
    fn unreadable_collections_are_skipped() {
        let root = tempdir().unwrap();
        let mut source = MemoryCubeSource::new();
        std::fs::create_dir(root.path().join("good.zarr")).unwrap();
        std::fs::create_dir(root.path().join("broken.zarr")).unwrap();
        std::fs::create_dir(root.path().join("flat.zarr")).unwrap();
        source.insert(root.path().join("good.zarr"), bands(2));
        source.insert(root.path().join("flat.zarr"), ArrayD::zeros(IxDyn(&[2, 6, 6])));

        let index = DatasetIndex::build(root.path(), None, source, SampleBuilder::default()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.collections(), 1);
    }

    #[test]
    fn get_returns_identical_copies() {
        let root = tempdir().unwrap();
        let mut source = MemoryCubeSource::new();
        std::fs::create_dir(root.path().join("x.zarr")).unwrap();
        source.insert(root.path().join("x.zarr"), bands(1));
        let index = DatasetIndex::build(root.path(), None, source, SampleBuilder::default()).unwrap();
        let pair = index.get(0).unwrap();
        assert_eq!(pair.input.dim(), (12, 64, 64));
        assert_eq!(pair.input, pair.target);
        assert!(index.get(1).is_err());
    }
}
