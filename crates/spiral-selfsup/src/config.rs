// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! TOML configuration for the train-then-embed pipeline.
//!
//! ```toml
//! checkpoint = "simclr_encoder.bin"
//!
//! [data]
//! root = "/data/s1"
//! train_limit = 100
//! embed_limit = 398
//!
//! [train]
//! epochs = 10
//! batch_size = 32
//! temperature = 0.5
//!
//! [embed]
//! output = "sar_embeddings.csv"
//! ```
//!
//! Every section and key is optional; omitted values take the defaults below.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use spiral_config::{DeterminismConfig, RuntimeConfig};
use st_vision::transforms::{
    GaussianNoise, RandomHorizontalFlip, RandomRot90, RandomVerticalFlip, TransformOperation,
    TransformPipeline,
};
use st_vision::{BilateralParams, ClaheParams};

use crate::contrastive::NtXentConfig;
use crate::embed::ExtractionConfig;
use crate::dataset::{SampleBuilderConfig, SUMMARY_CHANNELS};
use crate::encoder::PooledEncoderConfig;
use crate::{Result, SelfSupError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the `*.zarr` collections.
    pub root: PathBuf,
    /// Directory entries considered for training, taken in name order.
    pub train_limit: Option<usize>,
    /// Directory entries considered for extraction, taken in name order.
    pub embed_limit: Option<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            train_limit: Some(100),
            embed_limit: Some(398),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub target_size: usize,
    pub bilateral_diameter: usize,
    pub sigma_color: f32,
    pub sigma_space: f32,
    pub clahe_clip_limit: f32,
    pub clahe_tile_grid: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        let bilateral = BilateralParams::default();
        let clahe = ClaheParams::default();
        Self {
            target_size: 64,
            bilateral_diameter: bilateral.diameter,
            sigma_color: bilateral.sigma_color,
            sigma_space: bilateral.sigma_space,
            clahe_clip_limit: clahe.clip_limit,
            clahe_tile_grid: clahe.tile_grid.0,
        }
    }
}

impl PreprocessConfig {
    pub fn to_builder_config(&self) -> SampleBuilderConfig {
        SampleBuilderConfig {
            bilateral: BilateralParams {
                diameter: self.bilateral_diameter,
                sigma_color: self.sigma_color,
                sigma_space: self.sigma_space,
            },
            clahe: ClaheParams {
                clip_limit: self.clahe_clip_limit,
                tile_grid: (self.clahe_tile_grid, self.clahe_tile_grid),
            },
            target: (self.target_size, self.target_size),
        }
    }
}

/// Probabilities of each view augmentation; `0` disables a stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    pub horizontal_flip: f32,
    pub vertical_flip: f32,
    pub rot90: f32,
    /// Noise deviation relative to each channel's own deviation.
    pub noise_std: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            horizontal_flip: 0.5,
            vertical_flip: 0.5,
            rot90: 0.5,
            noise_std: 0.05,
        }
    }
}

impl AugmentConfig {
    pub fn to_pipeline(&self, seed: u64) -> Result<TransformPipeline> {
        let mut pipeline = TransformPipeline::with_seed(seed);
        if self.horizontal_flip > 0.0 {
            pipeline.add(TransformOperation::HorizontalFlip(RandomHorizontalFlip::new(
                self.horizontal_flip,
            )?));
        }
        if self.vertical_flip > 0.0 {
            pipeline.add(TransformOperation::VerticalFlip(RandomVerticalFlip::new(
                self.vertical_flip,
            )?));
        }
        if self.rot90 > 0.0 {
            pipeline.add(TransformOperation::Rot90(RandomRot90::new(self.rot90)?));
        }
        if self.noise_std > 0.0 {
            pipeline.add(TransformOperation::GaussianNoise(GaussianNoise::new(
                self.noise_std,
            )?));
        }
        Ok(pipeline)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub temperature: f32,
    pub mask_partner: bool,
    pub seed: Option<u64>,
    pub augment: AugmentConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 0.05,
            temperature: NtXentConfig::default().temperature,
            mask_partner: false,
            seed: None,
            augment: AugmentConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn loss(&self) -> NtXentConfig {
        NtXentConfig {
            temperature: self.temperature,
            mask_partner: self.mask_partner,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(SelfSupError::InvalidArgument("epochs must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(SelfSupError::InvalidArgument(
                "batch_size must be > 0".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(SelfSupError::InvalidArgument(format!(
                "learning_rate must be >= 0, got {}",
                self.learning_rate
            )));
        }
        self.loss().validate()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    pub batch_size: usize,
    pub output: PathBuf,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            output: PathBuf::from("sar_embeddings.csv"),
        }
    }
}

impl EmbedConfig {
    pub fn extraction(&self, workers: usize) -> ExtractionConfig {
        ExtractionConfig {
            batch_size: self.batch_size,
            workers,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub checkpoint: PathBuf,
    pub data: DataConfig,
    pub preprocess: PreprocessConfig,
    pub encoder: PooledEncoderConfig,
    pub train: TrainConfig,
    pub embed: EmbedConfig,
    pub runtime: RuntimeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from("simclr_encoder.bin"),
            data: DataConfig::default(),
            preprocess: PreprocessConfig::default(),
            encoder: PooledEncoderConfig::default(),
            train: TrainConfig::default(),
            embed: EmbedConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        if self.encoder.input_channels != SUMMARY_CHANNELS {
            return Err(SelfSupError::Config(format!(
                "encoder.input_channels must equal the {SUMMARY_CHANNELS} sample channels, got {}",
                self.encoder.input_channels
            )));
        }
        if self.preprocess.target_size == 0 {
            return Err(SelfSupError::Config(
                "preprocess.target_size must be > 0".to_string(),
            ));
        }
        if self.embed.batch_size == 0 {
            return Err(SelfSupError::Config(
                "embed.batch_size must be > 0".to_string(),
            ));
        }
        self.train.validate()?;
        self.runtime.validate()?;
        Ok(())
    }

    pub fn from_toml_str(config: &str) -> Result<Self> {
        let parsed: PipelineConfig = toml::from_str(config).map_err(|err| {
            SelfSupError::Config(format!("failed to parse pipeline config: {err}"))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| SelfSupError::io(path, err))?;
        Self::from_toml_str(&data)
    }

    /// Like [`Self::from_toml_str`], but `determinism` stands in for a
    /// document without a `[runtime.determinism]` table. A table that is
    /// present replaces it whole.
    pub fn from_toml_str_over(config: &str, determinism: DeterminismConfig) -> Result<Self> {
        let document: toml::Table = toml::from_str(config).map_err(|err| {
            SelfSupError::Config(format!("failed to parse pipeline config: {err}"))
        })?;
        let declares_determinism = document
            .get("runtime")
            .and_then(|runtime| runtime.get("determinism"))
            .is_some();
        let mut parsed = Self::from_toml_str(config)?;
        if !declares_determinism {
            parsed.runtime.determinism = determinism;
        }
        Ok(parsed)
    }

    /// Reads `path` layered over `determinism`; see [`Self::from_toml_str_over`].
    pub fn load_over<P: AsRef<Path>>(path: P, determinism: DeterminismConfig) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| SelfSupError::io(path, err))?;
        Self::from_toml_str_over(&data, determinism)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.data.train_limit, Some(100));
        assert_eq!(config.data.embed_limit, Some(398));
        assert_eq!(config.encoder.output_dim, 1024);
        assert_eq!(config.embed.batch_size, 64);
        assert_eq!(config.train.temperature, 0.5);
    }

    #[test]
    fn sections_override_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            checkpoint = "out/enc.bin"

            [data]
            root = "/srv/s1"
            train_limit = 5

            [train]
            epochs = 2
            batch_size = 4
            mask_partner = true
            seed = 7

            [train.augment]
            rot90 = 0.0

            [runtime]
            device = "cpu"
            workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.checkpoint, PathBuf::from("out/enc.bin"));
        assert_eq!(config.data.root, PathBuf::from("/srv/s1"));
        assert_eq!(config.data.train_limit, Some(5));
        assert_eq!(config.data.embed_limit, Some(398));
        assert!(config.train.loss().mask_partner);
        assert_eq!(config.train.seed, Some(7));
        assert_eq!(config.runtime.workers, 4);
        let pipeline = config.train.augment.to_pipeline(0).unwrap();
        assert_eq!(pipeline.operations().len(), 3);
    }

    #[test]
    fn mismatched_encoder_channels_are_rejected() {
        let err = PipelineConfig::from_toml_str("[encoder]\ninput_channels = 3\n").unwrap_err();
        assert!(matches!(err, SelfSupError::Config(_)));
    }

    #[test]
    fn invalid_temperature_is_rejected() {
        assert!(PipelineConfig::from_toml_str("[train]\ntemperature = 0.0\n").is_err());
    }

    #[test]
    fn determinism_table_overrides_the_fallback() {
        let fallback = DeterminismConfig::seeded(99);
        let layered =
            PipelineConfig::from_toml_str_over("[train]\nepochs = 2\n", fallback.clone()).unwrap();
        assert_eq!(layered.runtime.determinism, fallback);
        assert_eq!(layered.train.epochs, 2);

        let pinned = PipelineConfig::from_toml_str_over(
            "[runtime.determinism]\nenabled = false\n",
            fallback,
        )
        .unwrap();
        assert!(!pinned.runtime.determinism.enabled);
        assert_eq!(pinned.runtime.determinism, DeterminismConfig::default());
    }
}
