//! Image captioning: a frozen convolutional encoder, optional soft attention
//! and an LSTM decoder trained with teacher forcing and sampled greedily.

pub mod attention;
pub mod config;
pub mod data;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod inference;
pub mod model;
pub mod train;
pub mod transform;
pub mod vocabulary;

pub use config::{AttentionKind, DecoderKind, EncoderKind, ModelConfig};
pub use error::{CaptionError, Result};
pub use inference::Captioner;
pub use model::CaptionModel;
pub use train::{TrainingConfig, train};
pub use vocabulary::{Translation, Vocabulary};
