use crate::{
    error::{self, CaptionError},
    vocabulary::UNK,
};
use burn::config::Config;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Which image representation the encoder hands to the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderKind {
    /// One feature vector per image.
    Global,
    /// A `grid x grid` set of region vectors per image.
    Spatial,
}

/// Decoder variants. They differ in how the image enters the recurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderKind {
    /// The image feature is the first LSTM input; the state starts at zero.
    Input,
    /// The image feature initializes the hidden vector.
    Hidden,
    /// The image feature initializes both hidden and cell vectors.
    HiddenCell,
    /// Like `HiddenCell`, with an attention context appended to every input.
    Attention,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionKind {
    None,
    Soft,
}

macro_rules! tagged_variants {
    ($ty:ty, $kind:literal, { $($tag:literal => $variant:path),+ $(,)? }) => {
        impl $ty {
            pub const TAGS: &'static [&'static str] = &[$($tag),+];

            pub fn tag(&self) -> &'static str {
                match *self {
                    $($variant => $tag,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = CaptionError;

            fn from_str(tag: &str) -> error::Result<Self> {
                match tag.trim().to_ascii_lowercase().as_str() {
                    $($tag => Ok($variant),)+
                    _ => Err(CaptionError::UnknownVariant {
                        kind: $kind,
                        tag: tag.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.tag())
            }
        }
    };
}

tagged_variants!(EncoderKind, "encoder", {
    "global" => EncoderKind::Global,
    "spatial" => EncoderKind::Spatial,
});

tagged_variants!(DecoderKind, "decoder", {
    "input" => DecoderKind::Input,
    "hidden" => DecoderKind::Hidden,
    "hidden-cell" => DecoderKind::HiddenCell,
    "attention" => DecoderKind::Attention,
});

tagged_variants!(AttentionKind, "attention", {
    "none" => AttentionKind::None,
    "soft" => AttentionKind::Soft,
});

#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Number of vocabulary entries, reserved tokens included.
    pub vocab_size: usize,

    #[config(default = "EncoderKind::Spatial")]
    pub encoder: EncoderKind,

    #[config(default = "DecoderKind::Attention")]
    pub decoder: DecoderKind,

    #[config(default = "AttentionKind::Soft")]
    pub attention: AttentionKind,

    /// Width of the word embeddings.
    #[config(default = 256)]
    pub embedding_dim: usize,

    /// Width of the projected image features.
    #[config(default = 1024)]
    pub encoder_dim: usize,

    /// LSTM capacity.
    #[config(default = 512)]
    pub hidden_dim: usize,

    #[config(default = 512)]
    pub attention_dim: usize,

    /// Output channels of the frozen backbone.
    #[config(default = 512)]
    pub backbone_channels: usize,

    /// Regions per side of the spatial feature grid (7 -> 49 regions).
    #[config(default = 7)]
    pub grid_size: usize,

    /// Upper bound on greedy decoding steps.
    #[config(default = 30)]
    pub max_caption_steps: usize,
}

impl ModelConfig {
    /// Checks dimensions and the encoder/decoder/attention combination.
    pub fn validate(&self) -> error::Result<()> {
        if self.vocab_size <= UNK {
            return Err(CaptionError::Config(format!(
                "vocabulary of {} entries cannot hold the reserved tokens",
                self.vocab_size
            )));
        }

        let dims = [
            ("embedding_dim", self.embedding_dim),
            ("encoder_dim", self.encoder_dim),
            ("hidden_dim", self.hidden_dim),
            ("grid_size", self.grid_size),
            ("max_caption_steps", self.max_caption_steps),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, value)| *value == 0) {
            return Err(CaptionError::Config(format!("{name} must be positive")));
        }
        if self.backbone_channels < 4 {
            return Err(CaptionError::Config(
                "backbone_channels must be at least 4".into(),
            ));
        }

        match (self.decoder, self.attention, self.encoder) {
            (DecoderKind::Attention, AttentionKind::Soft, EncoderKind::Spatial) => {
                if self.attention_dim == 0 {
                    return Err(CaptionError::Config("attention_dim must be positive".into()));
                }
            }
            (DecoderKind::Attention, AttentionKind::None, _) => {
                return Err(CaptionError::Config(
                    "the attention decoder needs soft attention".into(),
                ));
            }
            (DecoderKind::Attention, _, EncoderKind::Global) => {
                return Err(CaptionError::Config(
                    "the attention decoder needs the spatial encoder".into(),
                ));
            }
            (decoder, AttentionKind::Soft, _) => {
                return Err(CaptionError::Config(format!(
                    "decoder '{decoder}' does not use attention"
                )));
            }
            (DecoderKind::Input, AttentionKind::None, _) => {
                if self.encoder_dim != self.embedding_dim {
                    return Err(CaptionError::Config(format!(
                        "decoder 'input' feeds the image feature as a word: encoder_dim ({}) must equal embedding_dim ({})",
                        self.encoder_dim, self.embedding_dim
                    )));
                }
            }
            (_, AttentionKind::None, _) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_and_display() {
        for tag in DecoderKind::TAGS {
            let kind: DecoderKind = tag.parse().unwrap();
            assert_eq!(kind.to_string(), *tag);
        }
        assert_eq!("Spatial".parse::<EncoderKind>().unwrap(), EncoderKind::Spatial);
        assert_eq!(" soft ".parse::<AttentionKind>().unwrap(), AttentionKind::Soft);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = "transformer".parse::<DecoderKind>().unwrap_err();
        assert!(matches!(
            err,
            CaptionError::UnknownVariant { kind: "decoder", ref tag } if tag == "transformer"
        ));
    }

    #[test]
    fn defaults_are_valid() {
        ModelConfig::new(100).validate().unwrap();
    }

    #[test]
    fn empty_vocabulary_is_rejected() {
        assert!(matches!(
            ModelConfig::new(0).validate(),
            Err(CaptionError::Config(_))
        ));
    }

    #[test]
    fn zero_hidden_size_is_rejected() {
        let config = ModelConfig::new(50).with_hidden_dim(0);
        assert!(matches!(config.validate(), Err(CaptionError::Config(_))));
    }

    #[test]
    fn incompatible_variants_are_rejected() {
        let no_attention = ModelConfig::new(50).with_attention(AttentionKind::None);
        assert!(no_attention.validate().is_err());

        let global = ModelConfig::new(50).with_encoder(EncoderKind::Global);
        assert!(global.validate().is_err());

        let stray_attention = ModelConfig::new(50).with_decoder(DecoderKind::HiddenCell);
        assert!(stray_attention.validate().is_err());

        let input = ModelConfig::new(50)
            .with_decoder(DecoderKind::Input)
            .with_attention(AttentionKind::None);
        assert!(input.validate().is_err());
        assert!(input.with_encoder_dim(256).validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_config.json");
        let config = ModelConfig::new(42)
            .with_decoder(DecoderKind::Hidden)
            .with_attention(AttentionKind::None);
        config.save(&path).unwrap();
        let loaded = ModelConfig::load(&path).unwrap();
        assert_eq!(loaded.vocab_size, 42);
        assert_eq!(loaded.decoder, DecoderKind::Hidden);
        assert_eq!(loaded.attention, AttentionKind::None);
    }
}
