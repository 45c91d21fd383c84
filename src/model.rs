use crate::{
    config::{EncoderKind, ModelConfig},
    data::CaptionBatch,
    decoder::{CaptionDecoder, Features, PackedLogits, pack_targets},
    encoder::ImageEncoder,
    error::Result,
    vocabulary::PAD,
};
use burn::{nn::loss::CrossEntropyLossConfig, prelude::*};
use tracing::debug;

/// Encoder and decoder assembled from a [`ModelConfig`].
#[derive(Module, Debug)]
pub struct CaptionModel<B: Backend> {
    encoder: ImageEncoder<B>,
    decoder: CaptionDecoder<B>,
    spatial: bool,
    max_caption_steps: usize,
}

impl ModelConfig {
    /// Builds the model selected by the variant tags, failing on invalid
    /// dimensions or combinations.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CaptionModel<B>> {
        self.validate()?;
        debug!(
            encoder = %self.encoder,
            decoder = %self.decoder,
            attention = %self.attention,
            vocab_size = self.vocab_size,
            "building caption model"
        );

        Ok(CaptionModel {
            encoder: ImageEncoder::new(
                self.backbone_channels,
                self.encoder_dim,
                self.grid_size,
                device,
            ),
            decoder: CaptionDecoder::new(self, device)?,
            spatial: self.encoder == EncoderKind::Spatial,
            max_caption_steps: self.max_caption_steps,
        })
    }
}

impl<B: Backend> CaptionModel<B> {
    pub fn encoder(&self) -> &ImageEncoder<B> {
        &self.encoder
    }

    pub fn with_encoder(mut self, encoder: ImageEncoder<B>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn encode(&self, images: Tensor<B, 4>) -> Features<B> {
        if self.spatial {
            Features::Spatial(self.encoder.encode_spatial(images))
        } else {
            Features::Global(self.encoder.encode_global(images))
        }
    }

    /// Packed logits and the matching packed targets for a batch.
    pub fn forward(&self, batch: &CaptionBatch<B>) -> Result<(PackedLogits<B>, Tensor<B, 1, Int>)> {
        let features = self.encode(batch.images.clone());
        let packed = self
            .decoder
            .forward(&features, batch.captions.clone(), &batch.lengths)?;
        let targets = pack_targets(batch.targets.clone(), &packed.batch_sizes);
        Ok((packed, targets))
    }

    /// Mean cross entropy over the active positions; `<PAD>` never counts.
    pub fn forward_loss(&self, batch: &CaptionBatch<B>) -> Result<Tensor<B, 1>> {
        let (packed, targets) = self.forward(batch)?;
        let loss = CrossEntropyLossConfig::new()
            .with_pad_tokens(Some(vec![PAD]))
            .init(&packed.logits.device())
            .forward(packed.logits, targets);
        Ok(loss)
    }

    /// Greedy captions (token ids) for `[N, 3, S, S]` images.
    pub fn caption(&self, images: Tensor<B, 4>) -> Vec<Vec<usize>> {
        let features = self.encode(images);
        self.decoder.sample(&features, self.max_caption_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AttentionKind, DecoderKind},
        data::pad_sequences,
    };
    use burn::{
        backend::{Autodiff, NdArray},
        optim::{AdamConfig, GradientsParams, Optimizer},
        tensor::{Distribution, ElementConversion},
    };

    type TestBackend = Autodiff<NdArray>;

    fn tiny(decoder: DecoderKind, attention: AttentionKind) -> ModelConfig {
        ModelConfig::new(9)
            .with_decoder(decoder)
            .with_attention(attention)
            .with_embedding_dim(8)
            .with_encoder_dim(8)
            .with_hidden_dim(6)
            .with_attention_dim(5)
            .with_backbone_channels(8)
            .with_grid_size(2)
            .with_max_caption_steps(5)
    }

    fn batch(device: &<TestBackend as Backend>::Device) -> CaptionBatch<TestBackend> {
        let ids = vec![vec![1, 4, 5, 6, 2], vec![1, 7, 8, 2], vec![1, 2]];
        let targets: Vec<Vec<usize>> = ids.iter().map(|row| row[1..].to_vec()).collect();
        let to_tensor = |rows: &[Vec<usize>]| {
            let (flat, width) = pad_sequences(rows, PAD);
            let flat: Vec<i64> = flat.into_iter().map(|v| v as i64).collect();
            Tensor::<TestBackend, 1, Int>::from_ints(flat.as_slice(), device).reshape([rows.len(), width])
        };
        CaptionBatch {
            images: Tensor::random([3, 3, 64, 64], Distribution::Normal(0.0, 1.0), device),
            captions: to_tensor(&ids),
            targets: to_tensor(&targets),
            lengths: vec![3, 2, 0],
        }
    }

    #[test]
    fn invalid_combination_fails_at_construction() {
        let device = Default::default();
        let result = tiny(DecoderKind::Hidden, AttentionKind::Soft).init::<TestBackend>(&device);
        assert!(result.is_err());
    }

    #[test]
    fn packed_targets_skip_padding() {
        let device = Default::default();
        let model = tiny(DecoderKind::Attention, AttentionKind::Soft)
            .init::<TestBackend>(&device)
            .unwrap();
        let (packed, targets) = model.forward(&batch(&device)).unwrap();
        assert_eq!(packed.batch_sizes, vec![3, 2, 2, 1]);
        assert_eq!(packed.logits.dims(), [8, 9]);
        let targets: Vec<i64> = targets.into_data().iter::<i64>().collect();
        assert_eq!(targets, vec![4, 7, 2, 5, 8, 6, 2, 2]);
        assert!(!targets.contains(&(PAD as i64)));
    }

    #[test]
    fn optimizer_step_runs_for_attention_and_plain_decoders() {
        let device = Default::default();
        for (decoder, attention) in [
            (DecoderKind::Attention, AttentionKind::Soft),
            (DecoderKind::HiddenCell, AttentionKind::None),
        ] {
            let model = tiny(decoder, attention).init::<TestBackend>(&device).unwrap();
            let batch = batch(&device);

            let loss = model.forward_loss(&batch).unwrap();
            let value: f64 = loss.clone().into_scalar().elem();
            assert!(value.is_finite() && value > 0.0);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let mut optim = AdamConfig::new().init();
            let updated = optim.step(1e-2, model.clone(), grads);

            let before = model.caption(batch.images.clone());
            let after = updated.caption(batch.images.clone());
            assert_eq!(before.len(), 3);
            assert_eq!(after.len(), 3);
            assert!(after.iter().all(|caption| caption.len() <= 5));
        }
    }
}
