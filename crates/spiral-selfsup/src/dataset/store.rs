// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Read-only access to `bands` arrays of `[N, T, 2, H, W]` collections.
//!
//! A [`CubeSource`] opens a collection and hands back a [`CubeHandle`]. The
//! handle is the only thing holding the store open; callers drop it as soon as
//! they have read what they need, so no collection stays open between
//! accesses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array4, ArrayD, Axis, Ix4};

use crate::{Result, SelfSupError};

/// `[T, 2, H, W]` radar cube; channel 0 is VV, channel 1 is VH.
pub type RadarCube = Array4<f32>;

/// Name of the array holding the stacked samples inside each collection.
pub const BANDS_ARRAY: &str = "bands";

/// Shape of a collection's `bands` array, read from metadata only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandsShape {
    pub samples: usize,
    pub timesteps: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl BandsShape {
    /// Interprets raw dimensions; `None` unless the rank is exactly 5.
    pub fn from_dims<T>(dims: &[T]) -> Option<Self>
    where
        T: Copy + TryInto<usize>,
    {
        let mut converted = [0usize; 5];
        if dims.len() != converted.len() {
            return None;
        }
        for (slot, dim) in converted.iter_mut().zip(dims) {
            *slot = (*dim).try_into().ok()?;
        }
        let [samples, timesteps, channels, height, width] = converted;
        Some(Self {
            samples,
            timesteps,
            channels,
            height,
            width,
        })
    }

    /// Shape of a single sample, `(T, C, H, W)`.
    pub fn sample_dims(&self) -> (usize, usize, usize, usize) {
        (self.timesteps, self.channels, self.height, self.width)
    }
}

/// Opens collections for reading.
pub trait CubeSource: Send + Sync {
    type Handle: CubeHandle;

    /// Opens the collection at `path` read-only. Fails when the path is not a
    /// collection, has no `bands` array, or that array is not rank 5.
    fn open(&self, path: &Path) -> Result<Self::Handle>;
}

/// Scoped access to one open collection.
pub trait CubeHandle {
    fn shape(&self) -> BandsShape;

    /// Reads only the `[T, 2, H, W]` slice at `offset`.
    fn read_sample(&self, offset: usize) -> Result<RadarCube>;
}

fn check_offset(path: &Path, shape: &BandsShape, offset: usize) -> Result<()> {
    if offset >= shape.samples {
        return Err(SelfSupError::Storage {
            path: path.to_path_buf(),
            message: format!("offset {offset} out of range for {} samples", shape.samples),
        });
    }
    Ok(())
}

/// In-memory collections keyed by path, for synthetic corpora and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryCubeSource {
    collections: HashMap<PathBuf, Arc<ArrayD<f32>>>,
}

impl MemoryCubeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bands` under `path`. Any rank is accepted here so malformed
    /// collections can be represented; [`CubeSource::open`] enforces rank 5.
    pub fn insert(&mut self, path: impl Into<PathBuf>, bands: ArrayD<f32>) -> &mut Self {
        self.collections.insert(path.into(), Arc::new(bands));
        self
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[derive(Debug)]
pub struct MemoryCubeHandle {
    path: PathBuf,
    shape: BandsShape,
    bands: Arc<ArrayD<f32>>,
}

impl CubeSource for MemoryCubeSource {
    type Handle = MemoryCubeHandle;

    fn open(&self, path: &Path) -> Result<Self::Handle> {
        let bands = self
            .collections
            .get(path)
            .cloned()
            .ok_or_else(|| SelfSupError::Storage {
                path: path.to_path_buf(),
                message: "no such collection".to_string(),
            })?;
        let shape = BandsShape::from_dims(bands.shape()).ok_or_else(|| SelfSupError::Storage {
            path: path.to_path_buf(),
            message: format!("`{BANDS_ARRAY}` has rank {}, expected 5", bands.ndim()),
        })?;
        Ok(MemoryCubeHandle {
            path: path.to_path_buf(),
            shape,
            bands,
        })
    }
}

impl CubeHandle for MemoryCubeHandle {
    fn shape(&self) -> BandsShape {
        self.shape
    }

    fn read_sample(&self, offset: usize) -> Result<RadarCube> {
        check_offset(&self.path, &self.shape, offset)?;
        self.bands
            .index_axis(Axis(0), offset)
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|err| SelfSupError::Shape(err.to_string()))
    }
}

#[cfg(feature = "zarr")]
pub use self::zarr::{ZarrCubeHandle, ZarrCubeSource};

#[cfg(feature = "zarr")]
mod zarr {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use zarrs::array::{Array, DataType};
    use zarrs::array_subset::ArraySubset;
    use zarrs::filesystem::FilesystemStore;

    use super::{check_offset, BandsShape, CubeHandle, CubeSource, RadarCube, BANDS_ARRAY};
    use crate::{Result, SelfSupError};

    fn storage_error(path: &Path, err: impl std::fmt::Display) -> SelfSupError {
        SelfSupError::Storage {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// Element types `bands` may be stored as; every one is widened or
    /// narrowed to `f32` on read.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum BandsElement {
        F32,
        F64,
        I8,
        I16,
        I32,
        I64,
        U8,
        U16,
        U32,
        U64,
    }

    impl BandsElement {
        fn from_data_type(data_type: &DataType) -> Option<Self> {
            Some(match data_type {
                DataType::Float32 => Self::F32,
                DataType::Float64 => Self::F64,
                DataType::Int8 => Self::I8,
                DataType::Int16 => Self::I16,
                DataType::Int32 => Self::I32,
                DataType::Int64 => Self::I64,
                DataType::UInt8 => Self::U8,
                DataType::UInt16 => Self::U16,
                DataType::UInt32 => Self::U32,
                DataType::UInt64 => Self::U64,
                _ => return None,
            })
        }
    }

    macro_rules! retrieve_as_f32 {
        ($array:expr, $subset:expr, $ty:ty) => {
            $array
                .retrieve_array_subset_elements::<$ty>($subset)
                .map(|values| values.into_iter().map(|v| v as f32).collect::<Vec<f32>>())
        };
    }

    /// Zarr collections on the local filesystem.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ZarrCubeSource;

    impl ZarrCubeSource {
        pub fn new() -> Self {
            Self
        }
    }

    pub struct ZarrCubeHandle {
        path: PathBuf,
        shape: BandsShape,
        element: BandsElement,
        array: Array<FilesystemStore>,
    }

    impl CubeSource for ZarrCubeSource {
        type Handle = ZarrCubeHandle;

        fn open(&self, path: &Path) -> Result<Self::Handle> {
            let store = FilesystemStore::new(path).map_err(|err| storage_error(path, err))?;
            let array = Array::open(Arc::new(store), &format!("/{BANDS_ARRAY}"))
                .map_err(|err| storage_error(path, err))?;
            let shape = BandsShape::from_dims(array.shape()).ok_or_else(|| {
                storage_error(
                    path,
                    format!(
                        "`{BANDS_ARRAY}` has rank {}, expected 5",
                        array.shape().len()
                    ),
                )
            })?;
            let element = BandsElement::from_data_type(array.data_type()).ok_or_else(|| {
                storage_error(
                    path,
                    format!(
                        "`{BANDS_ARRAY}` stores unsupported element type {}",
                        array.data_type()
                    ),
                )
            })?;
            Ok(ZarrCubeHandle {
                path: path.to_path_buf(),
                shape,
                element,
                array,
            })
        }
    }

    impl CubeHandle for ZarrCubeHandle {
        fn shape(&self) -> BandsShape {
            self.shape
        }

        fn read_sample(&self, offset: usize) -> Result<RadarCube> {
            check_offset(&self.path, &self.shape, offset)?;
            let (t, c, h, w) = self.shape.sample_dims();
            let start = offset as u64;
            let subset = ArraySubset::new_with_ranges(&[
                start..start + 1,
                0..t as u64,
                0..c as u64,
                0..h as u64,
                0..w as u64,
            ]);
            let array = &self.array;
            let elements = match self.element {
                BandsElement::F32 => array.retrieve_array_subset_elements::<f32>(&subset),
                BandsElement::F64 => retrieve_as_f32!(array, &subset, f64),
                BandsElement::I8 => retrieve_as_f32!(array, &subset, i8),
                BandsElement::I16 => retrieve_as_f32!(array, &subset, i16),
                BandsElement::I32 => retrieve_as_f32!(array, &subset, i32),
                BandsElement::I64 => retrieve_as_f32!(array, &subset, i64),
                BandsElement::U8 => retrieve_as_f32!(array, &subset, u8),
                BandsElement::U16 => retrieve_as_f32!(array, &subset, u16),
                BandsElement::U32 => retrieve_as_f32!(array, &subset, u32),
                BandsElement::U64 => retrieve_as_f32!(array, &subset, u64),
            }
            .map_err(|err| storage_error(&self.path, err))?;
            RadarCube::from_shape_vec((t, c, h, w), elements)
                .map_err(|err| SelfSupError::Shape(err.to_string()))
        }
    }
}
