// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Embedding extraction with a trained encoder.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::{Array2, Axis};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::dataset::{CubeSource, DataLoader, DatasetIndex};
use crate::encoder::Encoder;
use crate::metrics::{embed_rows, publish, register_embed_descriptors};
use crate::{Result, SelfSupError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub batch_size: usize,
    /// Threads fetching the samples of a batch; `1` stays on the caller.
    pub workers: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            workers: 1,
        }
    }
}

/// One embedding row per sample, in dataset order.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    rows: Array2<f32>,
}

impl EmbeddingTable {
    pub fn new(rows: Array2<f32>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &Array2<f32> {
        &self.rows
    }

    pub fn into_rows(self) -> Array2<f32> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.rows.ncols()
    }

    /// Writes a header of column numbers `0..dim` followed by one line per row.
    ///
    /// The table goes to a sibling temporary file first and replaces `path`
    /// only once fully flushed. The temporary file is removed on failure.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let staging = path.with_extension("csv.partial");
        let written = self
            .write_rows(&staging)
            .map_err(|err| SelfSupError::io(&staging, err))
            .and_then(|()| fs::rename(&staging, path).map_err(|err| SelfSupError::io(path, err)));
        if let Err(err) = written {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
        info!(path = %path.display(), rows = self.len(), dim = self.dim(), "embeddings written");
        Ok(())
    }

    fn write_rows(&self, path: &Path) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let header: Vec<String> = (0..self.dim()).map(|col| col.to_string()).collect();
        writeln!(writer, "{}", header.join(","))?;
        for row in self.rows.outer_iter() {
            let line: Vec<String> = row.iter().map(|value| value.to_string()).collect();
            writeln!(writer, "{}", line.join(","))?;
        }
        writer.flush()
    }

    /// Loads a table written by [`EmbeddingTable::write_csv`].
    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| SelfSupError::io(path, err))?;
        let mut lines = BufReader::new(file).lines();
        let header = match lines.next() {
            Some(line) => line.map_err(|err| SelfSupError::io(path, err))?,
            None => {
                return Err(SelfSupError::Storage {
                    path: path.to_path_buf(),
                    message: "missing header row".to_string(),
                })
            }
        };
        let dim = if header.trim().is_empty() {
            0
        } else {
            header.split(',').count()
        };

        let mut values = Vec::new();
        let mut rows = 0usize;
        for (line_no, line) in lines.enumerate() {
            let line = line.map_err(|err| SelfSupError::io(path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let before = values.len();
            for field in line.split(',') {
                let value = field.trim().parse::<f32>().map_err(|err| SelfSupError::Storage {
                    path: path.to_path_buf(),
                    message: format!("line {}: {err}", line_no + 2),
                })?;
                values.push(value);
            }
            if values.len() - before != dim {
                return Err(SelfSupError::Storage {
                    path: path.to_path_buf(),
                    message: format!(
                        "line {} has {} fields, header has {dim}",
                        line_no + 2,
                        values.len() - before
                    ),
                });
            }
            rows += 1;
        }
        let rows = Array2::from_shape_vec((rows, dim), values)
            .map_err(|err| SelfSupError::Shape(err.to_string()))?;
        Ok(Self { rows })
    }
}

/// Runs `encoder` in evaluation mode over every sample of `index`, in order.
///
/// Any failing batch aborts the extraction.
#[instrument(skip_all, fields(samples = index.len(), batch_size = config.batch_size))]
pub fn extract_embeddings<S, E>(
    encoder: &mut E,
    index: &DatasetIndex<S>,
    config: &ExtractionConfig,
) -> Result<EmbeddingTable>
where
    S: CubeSource,
    E: Encoder + ?Sized,
{
    if config.batch_size == 0 {
        return Err(SelfSupError::InvalidArgument(
            "batch_size must be > 0".to_string(),
        ));
    }
    if encoder.input_channels() != index.builder().output_channels() {
        return Err(SelfSupError::Shape(format!(
            "encoder expects {} channels but samples carry {}",
            encoder.input_channels(),
            index.builder().output_channels()
        )));
    }
    register_embed_descriptors();
    encoder.set_training(false);

    let total = index.len();
    let loader = DataLoader::new(index)
        .batched(config.batch_size)
        .with_workers(config.workers)?;
    let mut rows = Array2::<f32>::zeros((total, encoder.output_dim()));
    let mut done = 0usize;
    for (batch_no, batch) in loader.iter().enumerate() {
        let batch = batch?;
        let embeddings = encoder.forward(batch.inputs.view())?;
        for (slot, row) in batch.indices.iter().zip(embeddings.axis_iter(Axis(0))) {
            rows.row_mut(*slot).assign(&row);
        }
        done += batch.len();
        info!(batch = batch_no, rows = done, total, "extracting embeddings");
    }
    publish(&[embed_rows(done)]);
    Ok(EmbeddingTable { rows })
}
