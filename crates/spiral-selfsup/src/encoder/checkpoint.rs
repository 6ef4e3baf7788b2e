// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Encoder;
use crate::{Result, SelfSupError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl StoredArray {
    pub(crate) fn from_view(view: ArrayViewD<'_, f32>) -> Self {
        Self {
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        }
    }

    pub(crate) fn into_array(self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data)
            .map_err(|err| SelfSupError::Checkpoint(err.to_string()))
    }
}

/// Serialised encoder state: architecture tag, hyper-shape and named arrays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct EncoderSnapshot {
    pub architecture: String,
    pub input_channels: usize,
    pub output_dim: usize,
    pub hyper: BTreeMap<String, usize>,
    pub parameters: BTreeMap<String, StoredArray>,
}

impl EncoderSnapshot {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|err| SelfSupError::Checkpoint(err.to_string()))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|err| SelfSupError::Checkpoint(err.to_string()))
    }

    /// Removes and returns the parameter `name`, checking its shape.
    pub(crate) fn take(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>> {
        let stored = self
            .parameters
            .remove(name)
            .ok_or_else(|| SelfSupError::Checkpoint(format!("missing parameter `{name}`")))?;
        if stored.shape != shape {
            return Err(SelfSupError::Checkpoint(format!(
                "parameter `{name}` has shape {:?}, expected {shape:?}",
                stored.shape
            )));
        }
        stored.into_array()
    }
}

/// Writes `encoder`'s state to `path`, replacing any existing file.
pub fn save<E: Encoder + ?Sized, P: AsRef<Path>>(encoder: &E, path: P) -> Result<()> {
    let path = path.as_ref();
    let bytes = encoder.save_state()?;
    let file = File::create(path).map_err(|err| SelfSupError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&bytes)
        .and_then(|_| writer.flush())
        .map_err(|err| SelfSupError::io(path, err))?;
    info!(path = %path.display(), bytes = bytes.len(), "checkpoint saved");
    Ok(())
}

/// Restores `encoder` from a file written by [`save`].
pub fn load<E: Encoder + ?Sized, P: AsRef<Path>>(encoder: &mut E, path: P) -> Result<()> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|err| SelfSupError::io(path, err))?;
    encoder.load_state(&bytes)?;
    info!(path = %path.display(), "checkpoint loaded");
    Ok(())
}
