use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
    module::Module,
};
use caption_net::{
    AttentionKind, CaptionError, Captioner, DecoderKind, ModelConfig, TrainingConfig,
    encoder::{Backbone, BackboneRecorder},
    train::{
        MODEL_CONFIG_FILE, TRAINING_CONFIG_FILE, VOCABULARY_FILE, checkpoint_path, train,
    },
};
use image::{Rgb, RgbImage};
use std::{fs, path::Path};

type Inference = NdArray;
type Training = Autodiff<NdArray>;

const CORPUS: &str = "image_name| comment_number| comment\n\
                      red.png| 0| A red square .\n\
                      red.png| 1| A red box\n\
                      green.png| 0| A green square .\n\
                      green.png| 1| Green grass , green field\n\
                      blue.png| 0| A blue sky\n\
                      blue.png| 1| The blue sea .\n";

fn write_corpus(dir: &Path) {
    fs::write(dir.join("results.csv"), CORPUS).unwrap();
    let images = dir.join("images");
    fs::create_dir(&images).unwrap();
    for (name, color) in [
        ("red.png", Rgb([220, 20, 20])),
        ("green.png", Rgb([20, 200, 40])),
        ("blue.png", Rgb([20, 40, 220])),
    ] {
        RgbImage::from_pixel(48, 32, color)
            .save(images.join(name))
            .unwrap();
    }
}

fn tiny_model(decoder: DecoderKind, attention: AttentionKind) -> ModelConfig {
    ModelConfig::new(0)
        .with_decoder(decoder)
        .with_attention(attention)
        .with_embedding_dim(8)
        .with_encoder_dim(8)
        .with_hidden_dim(8)
        .with_attention_dim(4)
        .with_backbone_channels(8)
        .with_grid_size(2)
        .with_max_caption_steps(6)
}

fn quick_training() -> TrainingConfig {
    TrainingConfig::new()
        .with_batch_size(2)
        .with_num_epochs(1)
        .with_num_workers(1)
        .with_train_percentage(70.0)
        .with_log_every(1)
}

#[test]
fn train_then_caption() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_corpus(data.path());

    let report = train::<Training>(
        data.path(),
        artifacts.path(),
        tiny_model(DecoderKind::Attention, AttentionKind::Soft),
        quick_training(),
        Default::default(),
    )
    .unwrap();

    assert_eq!(report.epochs, 1);
    assert!(report.last_train_loss.is_some_and(f64::is_finite));
    assert!(report.last_eval_loss.is_some_and(f64::is_finite));

    for file in [MODEL_CONFIG_FILE, TRAINING_CONFIG_FILE, VOCABULARY_FILE] {
        assert!(artifacts.path().join(file).exists(), "{file} missing");
    }
    assert!(checkpoint_path(artifacts.path()).with_extension("mpk").exists());

    let captioner = Captioner::<Inference>::load(artifacts.path(), Default::default()).unwrap();
    let saved = ModelConfig::load(artifacts.path().join(MODEL_CONFIG_FILE)).unwrap();
    assert_eq!(saved.vocab_size, captioner.vocabulary().len());

    let image = data.path().join("images").join("red.png");
    let ids = captioner.caption_ids(&image).unwrap();
    assert!(!ids.is_empty() && ids.len() <= 6);
    assert!(ids.iter().all(|&id| id < captioner.vocabulary().len()));

    let sentence = captioner.caption_file(&image).unwrap();
    assert!(sentence.split_whitespace().count() <= 6);
    assert!(!sentence.contains("<START>") && !sentence.contains("<END>"));
}

#[test]
fn hidden_decoder_trains_without_attention() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_corpus(data.path());

    let report = train::<Training>(
        data.path(),
        artifacts.path(),
        tiny_model(DecoderKind::Hidden, AttentionKind::None)
            .with_encoder(caption_net::EncoderKind::Global),
        quick_training().with_eval_percentage(0.0),
        Default::default(),
    )
    .unwrap();

    assert!(report.last_train_loss.is_some());
    assert!(report.last_eval_loss.is_none());
}

#[test]
fn missing_image_surfaces_as_error() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_corpus(data.path());
    fs::remove_file(data.path().join("images").join("blue.png")).unwrap();

    let result = train::<Training>(
        data.path(),
        artifacts.path(),
        tiny_model(DecoderKind::Attention, AttentionKind::Soft),
        quick_training().with_train_percentage(100.0).with_batch_size(6),
        Default::default(),
    );
    assert!(matches!(result, Err(CaptionError::Io { .. })));
}

#[test]
fn pretrained_backbone_is_applied() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_corpus(data.path());

    let backbone = artifacts.path().join("backbone");
    Backbone::<Inference>::new(8, 2, &Default::default())
        .save_file(backbone.clone(), &BackboneRecorder::new())
        .unwrap();

    let report = train::<Training>(
        data.path(),
        artifacts.path(),
        tiny_model(DecoderKind::Attention, AttentionKind::Soft),
        quick_training().with_backbone(Some(backbone.with_extension("mpk"))),
        Default::default(),
    )
    .unwrap();
    assert!(report.last_train_loss.is_some());

    let missing = train::<Training>(
        data.path(),
        artifacts.path(),
        tiny_model(DecoderKind::Attention, AttentionKind::Soft),
        quick_training().with_backbone(Some(data.path().join("no-backbone"))),
        Default::default(),
    );
    assert!(matches!(missing, Err(CaptionError::Checkpoint(_))));
}

#[test]
fn loading_without_artifacts_fails() {
    let empty = tempfile::tempdir().unwrap();
    let result = Captioner::<Inference>::load(empty.path(), Default::default());
    assert!(matches!(result, Err(CaptionError::Config(_))));
}
