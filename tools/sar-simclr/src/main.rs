// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use spiral_config::{DeterminismConfig, DevicePreference};
use spiral_selfsup::config::PipelineConfig;
use spiral_selfsup::dataset::ZarrCubeSource;
use spiral_selfsup::embed::EmbeddingTable;
use spiral_selfsup::pipeline;
use tracing::info;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "SimCLR pretraining and embedding extraction for Sentinel-1 time series"
)]
struct Cli {
    /// TOML pipeline configuration; built-in defaults apply when omitted.
    /// `SPIRAL_DETERMINISTIC` and `SPIRAL_DETERMINISTIC_SEED` apply unless the
    /// file has a `[runtime.determinism]` table
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Directory holding the `*.zarr` collections
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    root: Option<PathBuf>,

    /// Encoder checkpoint written by `train` and read by `embed`
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    /// Threads fetching samples; 0 sizes the pool to the machine
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[arg(long, global = true, value_enum)]
    device: Option<DeviceArg>,

    /// Seeds every RNG in the run (augmentations, shuffling, weight init)
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the encoder and write its checkpoint
    Train(TrainArgs),

    /// Reload the checkpoint and write one embedding per sample to CSV
    Embed(EmbedArgs),

    /// Train, then embed with the freshly written checkpoint
    Run {
        #[command(flatten)]
        train: TrainArgs,
        #[command(flatten)]
        embed: EmbedArgs,
    },

    /// Summarise the dataset index and, optionally, an embeddings file
    Inspect(InspectArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Directory entries considered for training, in name order
    #[arg(long)]
    train_limit: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f32>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Drop the partner view from the negatives of each row
    #[arg(long, action = ArgAction::SetTrue)]
    mask_partner: bool,
}

#[derive(Args)]
struct EmbedArgs {
    /// Directory entries considered for extraction, in name order
    #[arg(long)]
    embed_limit: Option<usize>,

    #[arg(long)]
    embed_batch_size: Option<usize>,

    /// Destination CSV, replaced if present
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct InspectArgs {
    /// Directory entries to index, in name order
    #[arg(long)]
    limit: Option<usize>,

    /// Embeddings CSV to summarise
    #[arg(long, value_hint = ValueHint::FilePath)]
    embeddings: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Auto,
    Cpu,
    Accelerator,
}

impl From<DeviceArg> for DevicePreference {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Cpu => DevicePreference::Cpu,
            DeviceArg::Accelerator => DevicePreference::Accelerator,
        }
    }
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let from_env = DeterminismConfig::from_env();
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load_over(path, from_env)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PipelineConfig {
                runtime: spiral_config::RuntimeConfig {
                    determinism: from_env,
                    ..Default::default()
                },
                ..PipelineConfig::default()
            },
        };
        if let Some(root) = &self.root {
            config.data.root = root.clone();
        }
        if let Some(checkpoint) = &self.checkpoint {
            config.checkpoint = checkpoint.clone();
        }
        if let Some(workers) = self.workers {
            config.runtime.workers = workers;
        }
        if let Some(device) = self.device {
            config.runtime.device = device.into();
        }
        if let Some(seed) = self.seed {
            config.runtime.determinism = DeterminismConfig::seeded(seed);
            config.train.seed = Some(seed);
            config.encoder.seed = Some(seed);
        }
        Ok(config)
    }
}

impl TrainArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if self.train_limit.is_some() {
            config.data.train_limit = self.train_limit;
        }
        if let Some(epochs) = self.epochs {
            config.train.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.train.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.train.learning_rate = learning_rate;
        }
        if let Some(temperature) = self.temperature {
            config.train.temperature = temperature;
        }
        if self.mask_partner {
            config.train.mask_partner = true;
        }
    }
}

impl EmbedArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if self.embed_limit.is_some() {
            config.data.embed_limit = self.embed_limit;
        }
        if let Some(batch_size) = self.embed_batch_size {
            config.embed.batch_size = batch_size;
        }
        if let Some(output) = &self.output {
            config.embed.output = output.clone();
        }
    }
}

fn main() -> Result<()> {
    spiral_config::init_tracing().context("initialising tracing")?;
    let cli = Cli::parse();
    let mut config = cli.pipeline_config()?;
    let result = dispatch(&cli.command, &mut config);
    spiral_config::tracing::flush_chrome_trace();
    result
}

fn dispatch(command: &Command, config: &mut PipelineConfig) -> Result<()> {
    match command {
        Command::Train(args) => {
            args.apply(config);
            config.validate()?;
            let report = pipeline::train(config, ZarrCubeSource::new())?;
            for (epoch, metrics) in report.epochs.iter().enumerate() {
                println!(
                    "epoch {epoch}: loss {:.6}, top1 {:.3}, batches {}",
                    metrics.mean_loss, metrics.top1_accuracy, metrics.batches
                );
            }
            println!(
                "trained on {} samples from {} collections -> {}",
                report.samples,
                report.collections,
                report.checkpoint.display()
            );
        }
        Command::Embed(args) => {
            args.apply(config);
            config.validate()?;
            let report = pipeline::embed(config, ZarrCubeSource::new())?;
            println!(
                "wrote {} embeddings of dimension {} -> {}",
                report.samples,
                report.dim,
                report.output.display()
            );
        }
        Command::Run { train, embed } => {
            train.apply(config);
            embed.apply(config);
            config.validate()?;
            let report = pipeline::run(config)?;
            if let Some(last) = report.train.epochs.last() {
                println!("final loss {:.6}, top1 {:.3}", last.mean_loss, last.top1_accuracy);
            }
            println!(
                "wrote {} embeddings of dimension {} -> {}",
                report.embed.samples,
                report.embed.dim,
                report.embed.output.display()
            );
        }
        Command::Inspect(args) => inspect(args, config)?,
    }
    Ok(())
}

fn inspect(args: &InspectArgs, config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    let limit = args.limit.or(config.data.embed_limit);
    let index = pipeline::build_index(config, ZarrCubeSource::new(), limit)
        .with_context(|| format!("indexing {}", config.data.root.display()))?;
    let (channels, height, width) = index.builder().output_shape();
    info!(root = %config.data.root.display(), "index inspected");
    println!(
        "{} samples in {} collections under {}",
        index.len(),
        index.collections(),
        config.data.root.display()
    );
    println!("sample shape: [{channels}, {height}, {width}]");

    if let Some(path) = &args.embeddings {
        let table = EmbeddingTable::read_csv(path)
            .with_context(|| format!("reading {}", path.display()))?;
        println!(
            "{}: {} rows x {} columns",
            path.display(),
            table.len(),
            table.dim()
        );
    }
    Ok(())
}
