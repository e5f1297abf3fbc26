mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use selfsup::SslTrainingType;
use tracing_subscriber::EnvFilter;

use pipeline::{BuildClassifierArgs, PretrainArgs};

/// ssl-runner: self-supervised encoder pretraining with an online evaluator.
#[derive(Parser)]
#[command(name = "ssl-runner", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pretrain a SimCLR or BYOL module on synthetic data.
    Pretrain {
        /// Path to SSL config TOML file.
        #[arg(long, default_value = "configs/ssl.toml")]
        config: PathBuf,
        /// Override the training type ("SimCLR" or "BYOL").
        #[arg(long)]
        ssl_type: Option<SslTrainingType>,
        /// Override the number of epochs.
        #[arg(long)]
        max_epochs: Option<usize>,
        /// Override the checkpoint directory.
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Resume from a checkpoint directory (e.g. checkpoints/ssl/last).
        #[arg(long)]
        resume_from: Option<PathBuf>,
    },
    /// Build an image classifier on the encoder stored in a checkpoint.
    BuildClassifier {
        /// Pretraining checkpoint directory.
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        num_classes: usize,
        /// Fine-tune the encoder instead of freezing it.
        #[arg(long)]
        unfreeze_encoder: bool,
        /// Comma-separated per-class loss weights.
        #[arg(long, value_delimiter = ',')]
        class_weights: Option<Vec<f32>>,
        #[arg(long, default_value_t = 8)]
        batch_size: usize,
        #[arg(long, default_value_t = 16)]
        image_size: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Pretrain {
            config,
            ssl_type,
            max_epochs,
            checkpoint_dir,
            resume_from,
        } => pipeline::run_pretrain(PretrainArgs {
            config,
            ssl_type,
            max_epochs,
            checkpoint_dir,
            resume_from,
        }),
        Command::BuildClassifier {
            checkpoint,
            num_classes,
            unfreeze_encoder,
            class_weights,
            batch_size,
            image_size,
        } => pipeline::run_build_classifier(BuildClassifierArgs {
            checkpoint,
            num_classes,
            freeze_encoder: !unfreeze_encoder,
            class_weights,
            batch_size,
            image_size,
        }),
    }
}
