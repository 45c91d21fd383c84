//! caption-net CLI
//!
//! Usage:
//!   caption-net train --data-dir D --artifact-dir A    Train and write artifacts
//!   caption-net caption --artifact-dir A IMAGE...      Caption images

use anyhow::{Context, Result};
use caption_net::{
    AttentionKind, Captioner, DecoderKind, EncoderKind, ModelConfig, TrainingConfig, train,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[cfg(not(feature = "cuda"))]
type InferenceBackend = burn::backend::NdArray;
#[cfg(feature = "cuda")]
type InferenceBackend = burn_cuda::Cuda;

type TrainingBackend = burn::backend::Autodiff<InferenceBackend>;

#[cfg(not(feature = "cuda"))]
fn device() -> burn::backend::ndarray::NdArrayDevice {
    burn::backend::ndarray::NdArrayDevice::Cpu
}

#[cfg(feature = "cuda")]
fn device() -> burn_cuda::CudaDevice {
    burn_cuda::CudaDevice::new(0)
}

#[derive(Parser)]
#[command(name = "caption-net", version, about = "Image captioning with an LSTM decoder")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a captioned image corpus
    Train {
        /// Directory holding results.csv and images/
        #[arg(long)]
        data_dir: PathBuf,
        /// Where configs, vocabulary and checkpoints are written
        #[arg(long)]
        artifact_dir: PathBuf,

        #[arg(long, default_value = "spatial")]
        encoder: EncoderKind,
        #[arg(long, default_value = "attention")]
        decoder: DecoderKind,
        #[arg(long, default_value = "soft")]
        attention: AttentionKind,

        #[arg(long, default_value_t = 10)]
        epochs: usize,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        #[arg(long, default_value_t = 1e-3)]
        learning_rate: f64,
        #[arg(long, default_value_t = 2)]
        workers: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Percentage of the corpus to load
        #[arg(long, default_value_t = 100.0)]
        dataset_percentage: f64,
        /// Percentage of the loaded corpus used for training
        #[arg(long, default_value_t = 80.0)]
        train_percentage: f64,
        /// Percentage of the remainder used for evaluation
        #[arg(long, default_value_t = 100.0)]
        eval_percentage: f64,
        #[arg(long, default_value_t = 0.0)]
        flip_probability: f64,
        /// Log a sampled caption every N iterations
        #[arg(long, default_value_t = 10)]
        log_every: usize,
        /// Full-precision burn record with pretrained backbone weights
        #[arg(long)]
        backbone: Option<PathBuf>,
    },
    /// Caption images with a trained model
    Caption {
        #[arg(long)]
        artifact_dir: PathBuf,
        /// Image files
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Commands::Train {
            data_dir,
            artifact_dir,
            encoder,
            decoder,
            attention,
            epochs,
            batch_size,
            learning_rate,
            workers,
            seed,
            dataset_percentage,
            train_percentage,
            eval_percentage,
            flip_probability,
            log_every,
            backbone,
        } => {
            // vocab_size is replaced by the size of the training vocabulary
            let model_config = ModelConfig::new(0)
                .with_encoder(encoder)
                .with_decoder(decoder)
                .with_attention(attention);
            let training_config = TrainingConfig::new()
                .with_num_epochs(epochs)
                .with_batch_size(batch_size)
                .with_learning_rate(learning_rate)
                .with_num_workers(workers)
                .with_seed(seed)
                .with_dataset_percentage(dataset_percentage)
                .with_train_percentage(train_percentage)
                .with_eval_percentage(eval_percentage)
                .with_flip_probability(flip_probability)
                .with_log_every(log_every)
                .with_backbone(backbone);

            let report = train::<TrainingBackend>(
                &data_dir,
                &artifact_dir,
                model_config,
                training_config,
                device(),
            )
            .with_context(|| format!("training on {} failed", data_dir.display()))?;

            info!(
                epochs = report.epochs,
                train_loss = ?report.last_train_loss,
                eval_loss = ?report.last_eval_loss,
                checkpoint = %report.checkpoint.display(),
                "done"
            );
        }
        Commands::Caption {
            artifact_dir,
            images,
        } => {
            let captioner = Captioner::<InferenceBackend>::load(&artifact_dir, device())
                .with_context(|| {
                    format!("failed to load model from {}", artifact_dir.display())
                })?;

            for path in images {
                let caption = captioner
                    .caption_file(&path)
                    .with_context(|| format!("failed to caption {}", path.display()))?;
                println!("{}\t{}", path.display(), caption);
            }
        }
    }

    Ok(())
}
