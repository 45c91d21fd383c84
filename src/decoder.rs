//! LSTM caption decoder.
//!
//! Teacher-forced training runs one LSTM step at a time over a batch sorted
//! by descending caption length. At step `t` only the prefix of sequences
//! that are still running takes part, so input rows and recurrent state are
//! truncated to that prefix before every step. The resulting logits are
//! packed step-major, the same order [`pack_targets`] produces.

use crate::{
    attention::{SoftAttention, SoftAttentionConfig},
    config::{AttentionKind, DecoderKind, ModelConfig},
    error::{CaptionError, Result},
    vocabulary::{END, START},
};
use burn::{
    nn::{Embedding, EmbeddingConfig, Linear, LinearConfig, Lstm, LstmConfig, LstmState},
    prelude::*,
    tensor::activation::tanh,
};

/// Encoder output as seen by the decoder.
#[derive(Clone, Debug)]
pub enum Features<B: Backend> {
    /// `[N, encoder_dim]`
    Global(Tensor<B, 2>),
    /// `[N, regions, encoder_dim]`
    Spatial(Tensor<B, 3>),
}

impl<B: Backend> Features<B> {
    pub fn rows(&self) -> usize {
        match self {
            Self::Global(t) => t.dims()[0],
            Self::Spatial(t) => t.dims()[0],
        }
    }

    pub fn device(&self) -> B::Device {
        match self {
            Self::Global(t) => t.device(),
            Self::Spatial(t) => t.device(),
        }
    }

    /// Keeps the first `rows` images.
    pub fn narrow(&self, rows: usize) -> Self {
        match self {
            Self::Global(t) => Self::Global(t.clone().slice([0..rows])),
            Self::Spatial(t) => Self::Spatial(t.clone().slice([0..rows])),
        }
    }

    /// One vector per image; spatial features are averaged over regions.
    pub fn summary(&self) -> Tensor<B, 2> {
        match self {
            Self::Global(t) => t.clone(),
            Self::Spatial(t) => {
                let [batch, _, dim] = t.dims();
                t.clone().mean_dim(1).reshape([batch, dim])
            }
        }
    }
}

/// Step-major packed decoder output.
#[derive(Clone, Debug)]
pub struct PackedLogits<B: Backend> {
    /// `[sum(batch_sizes), vocab_size]`
    pub logits: Tensor<B, 2>,
    /// Number of active sequences at each step; non-increasing.
    pub batch_sizes: Vec<usize>,
}

/// Number of decoding steps each caption takes: its words plus `<END>`.
pub fn step_counts(lengths: &[usize]) -> Vec<usize> {
    lengths.iter().map(|len| len + 1).collect()
}

/// Active prefix size at every step for step counts sorted descending.
pub fn active_batch_sizes(steps: &[usize]) -> Vec<usize> {
    let longest = steps.first().copied().unwrap_or(0);
    (0..longest)
        .map(|t| steps.iter().take_while(|&&s| s > t).count())
        .collect()
}

/// Packs `[N, T]` targets step-major, keeping only active positions.
pub fn pack_targets<B: Backend>(
    targets: Tensor<B, 2, Int>,
    batch_sizes: &[usize],
) -> Tensor<B, 1, Int> {
    let columns = batch_sizes
        .iter()
        .enumerate()
        .map(|(t, &active)| {
            targets
                .clone()
                .slice([0..active, t..t + 1])
                .reshape([active])
        })
        .collect();
    Tensor::cat(columns, 0)
}

#[derive(Module, Debug)]
pub struct CaptionDecoder<B: Backend> {
    embedding: Embedding<B>,
    lstm: Lstm<B>,
    output: Linear<B>,
    init_hidden: Option<Linear<B>>,
    init_cell: Option<Linear<B>>,
    attention: Option<SoftAttention<B>>,
    feature_first: bool,
    hidden_dim: usize,
}

impl<B: Backend> CaptionDecoder<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;

        let attention = match config.attention {
            AttentionKind::Soft => Some(
                SoftAttentionConfig::new(
                    config.encoder_dim,
                    config.hidden_dim,
                    config.attention_dim,
                )
                .init(device),
            ),
            AttentionKind::None => None,
        };

        let lstm_input = match config.decoder {
            DecoderKind::Attention => config.embedding_dim + config.encoder_dim,
            _ => config.embedding_dim,
        };

        let init_linear = || LinearConfig::new(config.encoder_dim, config.hidden_dim).init(device);
        let (init_hidden, init_cell) = match config.decoder {
            DecoderKind::Input => (None, None),
            DecoderKind::Hidden => (Some(init_linear()), None),
            DecoderKind::HiddenCell | DecoderKind::Attention => {
                (Some(init_linear()), Some(init_linear()))
            }
        };

        Ok(Self {
            embedding: EmbeddingConfig::new(config.vocab_size, config.embedding_dim).init(device),
            lstm: LstmConfig::new(lstm_input, config.hidden_dim, true).init(device),
            output: LinearConfig::new(config.hidden_dim, config.vocab_size).init(device),
            init_hidden,
            init_cell,
            attention,
            feature_first: config.decoder == DecoderKind::Input,
            hidden_dim: config.hidden_dim,
        })
    }

    pub fn kind(&self) -> DecoderKind {
        match (&self.attention, &self.init_cell, &self.init_hidden) {
            (Some(_), _, _) => DecoderKind::Attention,
            (None, Some(_), _) => DecoderKind::HiddenCell,
            (None, None, Some(_)) => DecoderKind::Hidden,
            (None, None, None) => DecoderKind::Input,
        }
    }

    /// Zero state, or a state projected from the image features.
    fn initial_state(&self, features: &Features<B>) -> Option<LstmState<B, 2>> {
        let init_hidden = self.init_hidden.as_ref()?;
        let summary = features.summary();
        let hidden = tanh(init_hidden.forward(summary.clone()));
        let cell = match &self.init_cell {
            Some(init_cell) => tanh(init_cell.forward(summary)),
            None => hidden.zeros_like(),
        };
        Some(LstmState::new(cell, hidden))
    }

    fn embed(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let [rows, _] = tokens.dims();
        let embedded = self.embedding.forward(tokens);
        let [_, _, dim] = embedded.dims();
        embedded.reshape([rows, dim])
    }

    /// One recurrence step for `input [n, embedding_dim]`.
    fn step(
        &self,
        input: Tensor<B, 2>,
        features: &Features<B>,
        state: Option<LstmState<B, 2>>,
    ) -> (Tensor<B, 2>, LstmState<B, 2>) {
        let [rows, _] = input.dims();

        let input = match (&self.attention, features) {
            (Some(attention), Features::Spatial(regions)) => {
                let hidden = match &state {
                    Some(state) => state.hidden.clone(),
                    None => Tensor::zeros([rows, self.hidden_dim], &input.device()),
                };
                let (context, _) = attention.forward(regions.clone(), hidden);
                Tensor::cat(vec![input, context], 1)
            }
            _ => input,
        };

        let (output, state) = self.lstm.forward(input.unsqueeze_dim::<3>(1), state);
        let logits = self.output.forward(output.reshape([rows, self.hidden_dim]));
        (logits, state)
    }

    /// Teacher-forced pass.
    ///
    /// `captions` is `[N, W]` holding `<START> words <END>` rows padded with
    /// `<PAD>`; `lengths` are the word counts, sorted descending. Step `t`
    /// consumes `captions[:, t]` (the image feature instead of `<START>` for
    /// the `input` variant) and predicts `captions[:, t + 1]`.
    pub fn forward(
        &self,
        features: &Features<B>,
        captions: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Result<PackedLogits<B>> {
        let [batch, width] = captions.dims();
        if lengths.len() != batch || features.rows() != batch {
            return Err(CaptionError::Config(format!(
                "batch of {batch} captions has {} lengths and {} images",
                lengths.len(),
                features.rows()
            )));
        }
        if lengths.windows(2).any(|pair| pair[0] < pair[1]) {
            return Err(CaptionError::Config(
                "caption lengths must be sorted in descending order".into(),
            ));
        }

        let batch_sizes = active_batch_sizes(&step_counts(lengths));
        if batch_sizes.len() + 1 > width {
            return Err(CaptionError::Config(format!(
                "captions of width {width} cannot hold {} steps",
                batch_sizes.len()
            )));
        }

        let mut state = self.initial_state(features);
        let mut logits = Vec::with_capacity(batch_sizes.len());

        for (t, &active) in batch_sizes.iter().enumerate() {
            let features_t = features.narrow(active);
            state = state.map(|s| {
                LstmState::new(
                    s.cell.slice([0..active]),
                    s.hidden.slice([0..active]),
                )
            });

            let input = if self.feature_first && t == 0 {
                features_t.summary()
            } else {
                self.embed(captions.clone().slice([0..active, t..t + 1]))
            };

            let (step_logits, next) = self.step(input, &features_t, state);
            logits.push(step_logits);
            state = Some(next);
        }

        Ok(PackedLogits {
            logits: Tensor::cat(logits, 0),
            batch_sizes,
        })
    }

    /// Greedy decoding for every image in `features`.
    ///
    /// Each row stops after emitting `<END>`; no row runs longer than
    /// `max_steps`. Ties in the arg-max resolve as the backend's `argmax`
    /// does (first maximum).
    pub fn sample(&self, features: &Features<B>, max_steps: usize) -> Vec<Vec<usize>> {
        let batch = features.rows();
        let mut captions = vec![Vec::new(); batch];
        let mut finished = vec![false; batch];

        let mut state = self.initial_state(features);
        let mut input = if self.feature_first {
            features.summary()
        } else {
            let device = features.device();
            let start = vec![START as i64; batch];
            self.embed(Tensor::<B, 1, Int>::from_ints(start.as_slice(), &device).reshape([batch, 1]))
        };

        for _ in 0..max_steps {
            let (logits, next) = self.step(input, features, state);
            state = Some(next);

            let predicted = logits.argmax(1);
            let ids: Vec<usize> = predicted
                .clone()
                .into_data()
                .iter::<i64>()
                .map(|id| id as usize)
                .collect();

            for (row, &id) in ids.iter().enumerate() {
                if finished[row] {
                    continue;
                }
                captions[row].push(id);
                finished[row] = id == END;
            }
            if finished.iter().all(|&done| done) {
                break;
            }

            input = self.embed(predicted);
        }

        captions
    }
}
