// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Two-phase driver: contrastive training on a leading subset of collections,
//! then embedding extraction over a larger one with the reloaded checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use spiral_config::Device;
use tracing::{info, instrument};

use crate::config::PipelineConfig;
use crate::dataset::{CubeSource, DatasetIndex, SampleBuilder};
use crate::embed::{extract_embeddings, EmbeddingTable};
use crate::encoder::{checkpoint, PooledLinearEncoder};
use crate::metrics::NtXentEpochMetrics;
use crate::trainer::{CpuDevice, SimClrTrainer};
use crate::{Result, SelfSupError};

/// Outcome of the training phase.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub samples: usize,
    pub collections: usize,
    pub epochs: Vec<NtXentEpochMetrics>,
    pub checkpoint: PathBuf,
}

/// Outcome of the extraction phase.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedReport {
    pub samples: usize,
    pub collections: usize,
    pub dim: usize,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub train: TrainReport,
    pub embed: EmbedReport,
}

/// Builds the sample index the pipeline uses for a given collection limit.
pub fn build_index<S: CubeSource>(
    config: &PipelineConfig,
    source: S,
    limit: Option<usize>,
) -> Result<DatasetIndex<S>> {
    let builder = SampleBuilder::new(config.preprocess.to_builder_config())?;
    DatasetIndex::build(&config.data.root, limit, source, builder)
}

/// Fresh encoder as described by `[encoder]`, initialised from the runtime's
/// determinism settings.
pub fn new_encoder(config: &PipelineConfig) -> Result<PooledLinearEncoder> {
    PooledLinearEncoder::new(config.encoder.clone(), &config.runtime.determinism)
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|err| SelfSupError::io(parent, err))
        }
        _ => Ok(()),
    }
}

/// Trains a fresh encoder on the first `data.train_limit` collections and
/// writes it to `checkpoint`.
pub fn train<S: CubeSource>(config: &PipelineConfig, source: S) -> Result<TrainReport> {
    let device = config.runtime.resolve_device();
    train_on(config, source, &device)
}

#[instrument(skip_all, fields(root = %config.data.root.display(), device = %device))]
fn train_on<S: CubeSource>(
    config: &PipelineConfig,
    source: S,
    device: &Device,
) -> Result<TrainReport> {
    config.validate()?;
    let index = build_index(config, source, config.data.train_limit)?;
    let mut encoder = new_encoder(config)?;

    let augment_seed = config
        .train
        .seed
        .unwrap_or_else(|| config.runtime.determinism.seed_for("spiral-selfsup/augment"));
    let augmentations = config.train.augment.to_pipeline(augment_seed)?;
    let mut trainer = SimClrTrainer::with_device(
        config.train.clone(),
        &augmentations,
        &config.runtime,
        CpuDevice::for_resolved(device),
    )?;
    let epochs = trainer.train(&mut encoder, &index)?;

    ensure_parent(&config.checkpoint)?;
    checkpoint::save(&encoder, &config.checkpoint)?;
    Ok(TrainReport {
        samples: index.len(),
        collections: index.collections(),
        epochs,
        checkpoint: config.checkpoint.clone(),
    })
}

/// Reloads `checkpoint` and returns the embeddings of the first
/// `data.embed_limit` collections without writing them.
pub fn extract<S: CubeSource>(
    config: &PipelineConfig,
    source: S,
) -> Result<(DatasetIndex<S>, EmbeddingTable)> {
    config.validate()?;
    let index = build_index(config, source, config.data.embed_limit)?;
    let mut encoder = new_encoder(config)?;
    checkpoint::load(&mut encoder, &config.checkpoint)?;
    let extraction = config.embed.extraction(config.runtime.workers);
    let table = extract_embeddings(&mut encoder, &index, &extraction)?;
    Ok((index, table))
}

/// Extraction phase: reload, embed and write `embed.output`.
#[instrument(skip_all, fields(root = %config.data.root.display()))]
pub fn embed<S: CubeSource>(config: &PipelineConfig, source: S) -> Result<EmbedReport> {
    let (index, table) = extract(config, source)?;
    ensure_parent(&config.embed.output)?;
    table.write_csv(&config.embed.output)?;
    Ok(EmbedReport {
        samples: table.len(),
        collections: index.collections(),
        dim: table.dim(),
        output: config.embed.output.clone(),
    })
}

/// Runs both phases against `source`. The device preference is resolved
/// once, here.
pub fn run_with<S: CubeSource + Clone>(config: &PipelineConfig, source: S) -> Result<PipelineReport> {
    let device = config.runtime.resolve_device();
    info!(%device, workers = config.runtime.workers, "starting pipeline");
    let train = train_on(config, source.clone(), &device)?;
    let embed = embed(config, source)?;
    info!(
        trained = train.samples,
        embedded = embed.samples,
        output = %embed.output.display(),
        "pipeline finished"
    );
    Ok(PipelineReport { train, embed })
}

/// Runs both phases over the zarr collections under `data.root`.
#[cfg(feature = "zarr")]
pub fn run(config: &PipelineConfig) -> Result<PipelineReport> {
    run_with(config, crate::dataset::ZarrCubeSource::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryCubeSource;
    use crate::encoder::PooledEncoderConfig;
    use crate::test_support::CapturedEvents;
    use ndarray::{ArrayD, IxDyn};
    use spiral_config::DevicePreference;
    use tempfile::tempdir;

    fn synthetic(root: &Path, names: &[&str], samples: usize) -> MemoryCubeSource {
        let mut source = MemoryCubeSource::new();
        for (k, name) in names.iter().enumerate() {
            let path = root.join(name);
            fs::create_dir_all(&path).unwrap();
            let bands = ArrayD::from_shape_fn(IxDyn(&[samples, 2, 2, 12, 12]), |idx| {
                let (n, t, c, h, w) = (idx[0], idx[1], idx[2], idx[3], idx[4]);
                ((k * 7 + n * 3 + t + c) % 5) as f32 + (h * w) as f32 * 0.01
            });
            source.insert(path, bands);
        }
        source
    }

    fn small_config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.data.root = root.to_path_buf();
        config.data.train_limit = Some(1);
        config.data.embed_limit = None;
        config.preprocess.target_size = 8;
        config.preprocess.bilateral_diameter = 3;
        config.preprocess.clahe_tile_grid = 2;
        config.encoder = PooledEncoderConfig {
            output_dim: 6,
            pool_grid: 2,
            seed: Some(5),
            ..PooledEncoderConfig::default()
        };
        config.train.epochs = 1;
        config.train.batch_size = 2;
        config.train.seed = Some(9);
        config.checkpoint = root.join("out").join("encoder.bin");
        config.embed.output = root.join("out").join("emb.csv");
        config
    }

    #[test]
    fn run_trains_on_prefix_and_embeds_everything() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let source = synthetic(&data, &["a.zarr", "b.zarr"], 3);
        let config = small_config(&data);

        let report = run_with(&config, source).unwrap();
        assert_eq!(report.train.samples, 3);
        assert_eq!(report.train.collections, 1);
        assert_eq!(report.train.epochs.len(), 1);
        assert_eq!(report.embed.samples, 6);
        assert_eq!(report.embed.dim, 6);

        let table = EmbeddingTable::read_csv(&config.embed.output).unwrap();
        assert_eq!(table.len(), 6);
        assert_eq!(table.dim(), 6);
        assert!(table.rows().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn accelerator_request_warns_once_per_run() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let source = synthetic(&data, &["a.zarr", "b.zarr"], 3);
        let mut config = small_config(&data);
        config.runtime.device = DevicePreference::Accelerator;
        config.runtime.workers = 1;

        let captured = CapturedEvents::record(|| run_with(&config, source).unwrap());
        assert_eq!(captured.warnings(), 1);
    }

    #[test]
    fn run_publishes_epoch_and_extraction_metrics() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let source = synthetic(&data, &["a.zarr", "b.zarr"], 3);
        let mut config = small_config(&data);
        config.train.epochs = 2;
        config.runtime.workers = 1;

        let captured = CapturedEvents::record(|| run_with(&config, source).unwrap());
        let names = captured.metric_names();
        let losses = names.iter().filter(|name| *name == "selfsup.nt_xent.loss").count();
        assert_eq!(losses, 2);
        assert_eq!(names.last().map(String::as_str), Some("selfsup.embed.rows"));
    }

    #[test]
    fn embed_without_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let source = synthetic(&data, &["a.zarr"], 2);
        let config = small_config(&data);
        let err = embed(&config, source).unwrap_err();
        assert!(matches!(err, SelfSupError::Io { .. }));
        assert!(!config.embed.output.exists());
    }
}
