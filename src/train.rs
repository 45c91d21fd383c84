use crate::{
    config::ModelConfig,
    data::{CaptionBatch, CaptionBatcher, CaptionDataset},
    error::{self, CaptionError},
    model::CaptionModel,
    vocabulary::Vocabulary,
};
use burn::{
    config::Config,
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};

pub const MODEL_CONFIG_FILE: &str = "model_config.json";
pub const TRAINING_CONFIG_FILE: &str = "training_config.json";
pub const VOCABULARY_FILE: &str = "vocabulary.json";
pub const CHECKPOINT_FILE: &str = "model";

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 10)]
    pub num_epochs: usize,

    #[config(default = 1e-3)]
    pub learning_rate: f64,

    #[config(default = 42)]
    pub seed: u64,

    /// Data loader worker threads.
    #[config(default = 2)]
    pub num_workers: usize,

    /// Share of the corpus read at all.
    #[config(default = 100.0)]
    pub dataset_percentage: f64,

    /// Share of the loaded corpus moved into the training split.
    #[config(default = 80.0)]
    pub train_percentage: f64,

    /// Share of what remains moved into the evaluation split.
    #[config(default = 100.0)]
    pub eval_percentage: f64,

    #[config(default = 10)]
    pub log_every: usize,

    #[config(default = 0.0)]
    pub flip_probability: f64,

    /// Pretrained backbone record (see [`crate::encoder::BackboneRecorder`]). Without it
    /// the frozen backbone keeps its random initialization.
    pub backbone: Option<PathBuf>,
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.batch_size == 0 || self.num_epochs == 0 || self.log_every == 0 {
            return Err(CaptionError::Config(
                "batch_size, num_epochs and log_every must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.flip_probability) {
            return Err(CaptionError::Config(format!(
                "flip_probability {} is not a probability",
                self.flip_probability
            )));
        }
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug)]
pub struct TrainingReport {
    pub epochs: usize,
    pub last_train_loss: Option<f64>,
    pub last_eval_loss: Option<f64>,
    pub checkpoint: PathBuf,
}

pub fn checkpoint_path(artifact_dir: &Path) -> PathBuf {
    artifact_dir.join(CHECKPOINT_FILE)
}

/// Loads the corpus, splits it, builds the vocabulary from the training
/// split and runs the epoch loop. Artifacts land in `artifact_dir`.
///
/// `model_config.vocab_size` is replaced by the size of the vocabulary built
/// here.
pub fn train<B: AutodiffBackend>(
    data_dir: &Path,
    artifact_dir: &Path,
    model_config: ModelConfig,
    config: TrainingConfig,
    device: B::Device,
) -> error::Result<TrainingReport> {
    config.validate()?;
    fs::create_dir_all(artifact_dir).map_err(|e| CaptionError::io(artifact_dir, e))?;

    // 1. Data
    let mut dataset = CaptionDataset::open(data_dir, config.dataset_percentage, config.seed)?;
    let train_set = dataset.take_fraction(config.train_percentage, true);
    let eval_set = dataset.take_fraction(config.eval_percentage, true);
    if train_set.is_empty() {
        return Err(CaptionError::Config(format!(
            "training split of {} is empty",
            data_dir.display()
        )));
    }
    info!(
        train = train_set.items().len(),
        eval = eval_set.items().len(),
        "dataset split"
    );

    let vocabulary = Arc::new(train_set.build_vocabulary());
    let mut model_config = model_config;
    model_config.vocab_size = vocabulary.len();

    vocabulary.save(artifact_dir.join(VOCABULARY_FILE))?;
    save_config(&model_config, &artifact_dir.join(MODEL_CONFIG_FILE))?;
    save_config(&config, &artifact_dir.join(TRAINING_CONFIG_FILE))?;

    // 2. Model & optimizer
    let mut model: CaptionModel<B> = model_config.init(&device)?;
    if let Some(path) = &config.backbone {
        let encoder = model.encoder().clone().load_backbone(path, &device)?;
        model = model.with_encoder(encoder);
    } else {
        warn!("no pretrained backbone given, image features come from random weights");
    }
    let mut optim = AdamConfig::new().init();

    let loader_train = DataLoaderBuilder::new(CaptionBatcher::training(
        vocabulary.clone(),
        config.flip_probability,
    ))
    .batch_size(config.batch_size)
    .shuffle(config.seed)
    .num_workers(config.num_workers)
    .build(train_set);

    let loader_eval = (!eval_set.is_empty()).then(|| {
        DataLoaderBuilder::new(CaptionBatcher::evaluation(vocabulary.clone()))
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(eval_set)
    });

    let checkpoint = checkpoint_path(artifact_dir);
    let mut report = TrainingReport {
        epochs: 0,
        last_train_loss: None,
        last_eval_loss: None,
        checkpoint: checkpoint.clone(),
    };

    info!(epochs = config.num_epochs, "starting training loop");

    // 3. Epochs
    for epoch in 1..=config.num_epochs {
        let mut loss_sum = 0.0;
        let mut batches = 0usize;

        for (iteration, batch) in loader_train.iter().enumerate() {
            let batch = batch?;

            // A. Forward
            let loss = model.forward_loss(&batch)?;
            let loss_value: f64 = loss.clone().into_scalar().elem();
            loss_sum += loss_value;
            batches += 1;

            if iteration % config.log_every == 0 {
                let sample = model.caption(batch.images.clone().slice([0..1]));
                let sentence = sample
                    .first()
                    .map(|ids| vocabulary.to_sentence(ids))
                    .transpose()?
                    .unwrap_or_default();
                info!(
                    epoch,
                    iteration,
                    loss = format_args!("{loss_value:.4}"),
                    sample = %sentence,
                    "mini-batch"
                );
            }

            // B. Backward & step
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);
        }

        let train_loss = (batches > 0).then(|| loss_sum / batches as f64);
        let eval_loss = match &loader_eval {
            Some(loader) => evaluate(&model.valid(), loader.iter())?,
            None => None,
        };

        match (train_loss, eval_loss) {
            (Some(train), Some(eval)) => info!(
                epoch,
                train_loss = format_args!("{train:.4}"),
                eval_loss = format_args!("{eval:.4}"),
                "epoch complete"
            ),
            (Some(train), None) => info!(
                epoch,
                train_loss = format_args!("{train:.4}"),
                "epoch complete (no evaluation split)"
            ),
            _ => warn!(epoch, "epoch produced no batches"),
        }

        model
            .clone()
            .save_file(checkpoint.clone(), &CompactRecorder::new())
            .map_err(|e| CaptionError::Checkpoint(e.to_string()))?;

        report.epochs = epoch;
        report.last_train_loss = train_loss;
        report.last_eval_loss = eval_loss;
    }

    info!(checkpoint = %checkpoint.display(), "training complete");
    Ok(report)
}

/// Mean loss over the evaluation batches, `None` when there are none.
pub fn evaluate<B: Backend>(
    model: &CaptionModel<B>,
    batches: impl Iterator<Item = error::Result<CaptionBatch<B>>>,
) -> error::Result<Option<f64>> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for batch in batches {
        let loss: f64 = model.forward_loss(&batch?)?.into_scalar().elem();
        sum += loss;
        count += 1;
    }
    Ok((count > 0).then(|| sum / count as f64))
}

fn save_config<C: Config>(config: &C, path: &Path) -> error::Result<()> {
    config.save(path).map_err(|e| CaptionError::io(path, e))
}

/// Reads the vocabulary written by [`train`].
pub fn load_vocabulary(artifact_dir: &Path) -> error::Result<Vocabulary> {
    Vocabulary::load(artifact_dir.join(VOCABULARY_FILE))
}
