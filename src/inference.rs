use crate::{
    config::ModelConfig,
    error::{CaptionError, Result},
    model::CaptionModel,
    train::{MODEL_CONFIG_FILE, checkpoint_path, load_vocabulary},
    transform::{Preprocess, load_rgb},
    vocabulary::Vocabulary,
};
use burn::{
    config::Config,
    module::Module,
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use std::path::Path;
use tracing::{debug, info};

/// Captions images with a trained model.
pub struct Captioner<B: Backend> {
    model: CaptionModel<B>,
    vocabulary: Vocabulary,
    preprocess: Preprocess,
    device: B::Device,
}

impl<B: Backend> Captioner<B> {
    pub fn new(model: CaptionModel<B>, vocabulary: Vocabulary, device: B::Device) -> Self {
        Self {
            model,
            vocabulary,
            preprocess: Preprocess::evaluation(),
            device,
        }
    }

    /// Restores the model configuration, vocabulary and weights written by
    /// training.
    pub fn load(artifact_dir: &Path, device: B::Device) -> Result<Self> {
        let config_path = artifact_dir.join(MODEL_CONFIG_FILE);
        let config = ModelConfig::load(&config_path)
            .map_err(|e| CaptionError::Config(format!("{}: {e}", config_path.display())))?;
        let vocabulary = load_vocabulary(artifact_dir)?;
        if vocabulary.len() != config.vocab_size {
            return Err(CaptionError::Config(format!(
                "vocabulary has {} entries but the model expects {}",
                vocabulary.len(),
                config.vocab_size
            )));
        }

        info!(artifact_dir = %artifact_dir.display(), "loading caption model");
        let skeleton: CaptionModel<B> = config.init(&device)?;
        let record = CompactRecorder::new()
            .load(checkpoint_path(artifact_dir), &device)
            .map_err(|e| CaptionError::Checkpoint(e.to_string()))?;
        let model = skeleton.load_record(record);

        Ok(Self::new(model, vocabulary, device))
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Greedy caption ids for one image file, `<END>` included when emitted.
    pub fn caption_ids(&self, path: &Path) -> Result<Vec<usize>> {
        let image = load_rgb(path)?;
        let size = self.preprocess.output_size() as usize;
        let pixels = self.preprocess.to_tensor_data(&image, &mut rand::rng());
        let images =
            Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device).reshape([1, 3, size, size]);

        let ids = self.model.caption(images).into_iter().next().unwrap_or_default();
        debug!(path = %path.display(), tokens = ids.len(), "image captioned");
        Ok(ids)
    }

    /// Caption words joined by spaces, control tokens removed.
    pub fn caption_file(&self, path: &Path) -> Result<String> {
        let ids = self.caption_ids(path)?;
        self.vocabulary.to_sentence(&ids)
    }
}
